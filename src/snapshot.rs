//! Heap-snapshot writer.
//!
//! Serializes the reachable object graph into the JSON format understood
//! by browser heap profilers: a meta block, flat `nodes` and `edges`
//! arrays and an interned string table. Node 0 is always the context, so
//! inspector tools treat it as the root.

use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use serde_json::json;

use crate::GcResult;
use crate::object::{CellData, CellKind, ClassId, ListTag, ObjectPayload};
use crate::runtime::RuntimeState;
use crate::trace::{self, EdgeLabel, SnapTarget};
use crate::value::{Atom, CellId, StringId, Value};

const NODE_FIELD_COUNT: u64 = 5;

mod node_type {
    pub const HIDDEN: u32 = 0;
    pub const ARRAY: u32 = 1;
    pub const STRING: u32 = 2;
    pub const OBJECT: u32 = 3;
    pub const CODE: u32 = 4;
    pub const CLOSURE: u32 = 5;
    pub const NUMBER: u32 = 7;
    pub const NATIVE: u32 = 8;
    pub const SYNTHETIC: u32 = 9;
}

mod edge_type {
    pub const ELEMENT: u32 = 1;
    pub const PROPERTY: u32 = 2;
    pub const INTERNAL: u32 = 3;
    pub const WEAK: u32 = 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SnapKey {
    Cell(CellId),
    Str(StringId),
    Int(i32),
    NativeFn(usize),
    ErrProtoGroup(CellId),
    ClassProtoGroup(CellId),
    ShapeProp(CellId, u32),
}

struct Edge {
    ty: u32,
    name_or_index: u64,
    to: usize,
}

struct Node {
    ty: u32,
    name: u32,
    self_size: usize,
    edges: Vec<Edge>,
    filled: bool,
}

struct DumpCtx {
    nodes: Vec<Node>,
    edges_len: usize,
    strs: Vec<String>,
    str_ids: FxHashMap<String, u32>,
    key_nodes: FxHashMap<SnapKey, usize>,
}

impl DumpCtx {
    fn new() -> Self {
        let mut dc = Self {
            nodes: Vec::new(),
            edges_len: 0,
            strs: Vec::new(),
            str_ids: FxHashMap::default(),
            key_nodes: FxHashMap::default(),
        };
        // index 0 backs every unnamed node
        dc.add_str("");
        dc
    }

    fn add_str(&mut self, s: &str) -> u32 {
        if let Some(i) = self.str_ids.get(s) {
            return *i;
        }
        let i = self.strs.len() as u32;
        self.strs.push(s.to_owned());
        self.str_ids.insert(s.to_owned(), i);
        i
    }

    fn node_for(&mut self, key: SnapKey) -> usize {
        if let Some(i) = self.key_nodes.get(&key) {
            return *i;
        }
        let i = self.nodes.len();
        self.nodes.push(Node {
            ty: node_type::HIDDEN,
            name: 0,
            self_size: 0,
            edges: Vec::new(),
            filled: false,
        });
        self.key_nodes.insert(key, i);
        i
    }

    fn add_edge(&mut self, from: usize, ty: u32, name_or_index: u64, to: usize) {
        self.nodes[from].edges.push(Edge {
            ty,
            name_or_index,
            to,
        });
        self.edges_len += 1;
    }

    fn labelled_edge(&mut self, rt: &RuntimeState, from: usize, label: EdgeLabel, to: usize) {
        let (ty, name_or_index) = match label {
            EdgeLabel::Prop(atom) => {
                let s = rt.atom_str(atom).to_owned();
                (edge_type::PROPERTY, self.add_str(&s) as u64)
            }
            EdgeLabel::Name(s) => (edge_type::PROPERTY, self.add_str(s) as u64),
            EdgeLabel::Elem(i) => (edge_type::ELEMENT, i as u64),
            EdgeLabel::Internal(s) => (edge_type::INTERNAL, self.add_str(s) as u64),
            EdgeLabel::Weak(s) => (edge_type::WEAK, self.add_str(s) as u64),
        };
        self.add_edge(from, ty, name_or_index, to);
    }
}

/// Read-only prototype-chain lookup used for display names; never runs
/// getters and never touches refcounts.
fn lookup_chain(rt: &RuntimeState, id: CellId, atom: Atom) -> Option<Value> {
    let mut cur = Some(id);
    while let Some(oid) = cur {
        if let Some(v) = rt.get_own_property(oid, atom) {
            return Some(v);
        }
        cur = rt.object(oid).shape.and_then(|sh| rt.shape(sh).proto);
    }
    None
}

fn is_function_class(class_id: ClassId) -> bool {
    class_id == ClassId::C_FUNCTION
        || class_id == ClassId::BYTECODE_FUNCTION
        || class_id == ClassId::BOUND_FUNCTION
}

/// Display-name resolution: Proxy literal, own `name` string property,
/// `constructor.name`, then the canonical class name.
fn object_node_name(rt: &RuntimeState, dc: &mut DumpCtx, id: CellId) -> u32 {
    let class_id = rt.object(id).class_id;
    if class_id == ClassId::PROXY {
        return dc.add_str(rt.atom_str(Atom::PROXY));
    }
    if let Some(Value::String(s)) = rt.get_own_property(id, Atom::NAME) {
        let name = rt.string_str(s).to_owned();
        return dc.add_str(&name);
    }
    if let Some(Value::Object(ctor)) = lookup_chain(rt, id, Atom::CONSTRUCTOR) {
        if is_function_class(rt.object(ctor).class_id) {
            if let Some(Value::String(s)) = rt.get_own_property(ctor, Atom::NAME) {
                let name = rt.string_str(s).to_owned();
                return dc.add_str(&name);
            }
        }
    }
    let name = rt.atom_str(rt.classes[class_id.index()].name_atom).to_owned();
    dc.add_str(&name)
}

/// Class-aware shallow size: fast arrays contribute their element storage,
/// array buffers their byte length.
fn object_self_size(rt: &RuntimeState, id: CellId) -> usize {
    let p = rt.object(id);
    let mut size = std::mem::size_of::<crate::object::JsObject>();
    match &p.payload {
        ObjectPayload::FastArray(values) => {
            size += values.len() * std::mem::size_of::<Value>();
        }
        ObjectPayload::ArrayBuffer(ab) => {
            size += ab.data.len();
        }
        _ => {
            size += rt.classes[p.class_id.index()].def.opaque_size;
        }
    }
    size
}

fn bytecode_self_size(rt: &RuntimeState, id: CellId) -> usize {
    match &rt.cell(id).data {
        CellData::Bytecode(b) => {
            let mut size = std::mem::size_of::<crate::object::FunctionBytecode>();
            size += b.byte_code.len();
            size += (b.arg_count as usize + b.vardefs.len())
                * std::mem::size_of::<crate::object::VarDef>();
            size += b.closure_vars.len() * std::mem::size_of::<crate::object::ClosureVarDef>();
            size += b.cpool.len() * std::mem::size_of::<Value>();
            if let Some(d) = &b.debug {
                if let Some(src) = d.source {
                    size += rt.string(src).buf.len();
                }
            }
            size
        }
        _ => 0,
    }
}

/// Node for a snapshot target, filling string and number sentinels on
/// first sight.
fn target_node(rt: &RuntimeState, dc: &mut DumpCtx, target: SnapTarget) -> usize {
    match target {
        SnapTarget::Cell(id) => dc.node_for(SnapKey::Cell(id)),
        SnapTarget::Str(sid) => {
            let i = dc.node_for(SnapKey::Str(sid));
            if !dc.nodes[i].filled {
                let content = rt.string_str(sid).to_owned();
                dc.nodes[i].ty = node_type::STRING;
                let name_idx = dc.add_str(&content);
                dc.nodes[i].name = name_idx;
                dc.nodes[i].self_size = content.len();
                dc.nodes[i].filled = true;
            }
            i
        }
        SnapTarget::Int(v) => {
            // numbers referenced from properties are emitted as string
            // nodes whose name is the formatted value
            let i = dc.node_for(SnapKey::Int(v));
            if !dc.nodes[i].filled {
                dc.nodes[i].ty = node_type::STRING;
                let name_idx = dc.add_str(&v.to_string());
                dc.nodes[i].name = name_idx;
                dc.nodes[i].self_size = std::mem::size_of::<f64>();
                dc.nodes[i].filled = true;
            }
            i
        }
    }
}

fn process_object(rt: &RuntimeState, dc: &mut DumpCtx, ctx_id: CellId, id: CellId, node_i: usize) {
    if dc.nodes[node_i].filled {
        return;
    }
    dc.nodes[node_i].filled = true;

    let class_id = rt.object(id).class_id;
    let ctx = rt.context_data(ctx_id);
    let array_proto = ctx.class_protos[ClassId::ARRAY.index()].gc_cell();
    let global_cell = ctx.global_obj.gc_cell();

    let mut ty = node_type::OBJECT;
    if class_id == ClassId::ARRAY && Some(id) != array_proto {
        ty = node_type::ARRAY;
    } else if is_function_class(class_id) {
        ty = node_type::CLOSURE;
    }
    dc.nodes[node_i].ty = ty;
    dc.nodes[node_i].self_size = object_self_size(rt, id);

    // __proto__ and shape are internal structure
    if let Some(sh) = rt.object(id).shape {
        if let Some(proto) = rt.shape(sh).proto {
            let proto_i = dc.node_for(SnapKey::Cell(proto));
            let name = dc.add_str(rt.atom_str(Atom::PROTO));
            dc.add_edge(node_i, edge_type::PROPERTY, name as u64, proto_i);
        }
        let shape_i = dc.node_for(SnapKey::Cell(sh));
        let name = dc.add_str(rt.atom_str(Atom::SHAPE));
        dc.add_edge(node_i, edge_type::INTERNAL, name as u64, shape_i);
    }

    // typed arrays keep their backing buffer as internal structure
    if let ObjectPayload::TypedArray(ta) = &rt.object(id).payload {
        if let Some(buf) = ta.buffer {
            let buf_i = dc.node_for(SnapKey::Cell(buf));
            let name = dc.add_str("typed_array");
            dc.add_edge(node_i, edge_type::INTERNAL, name as u64, buf_i);
        }
    }

    // functions link to their code
    match &rt.object(id).payload {
        ObjectPayload::Closure(c) => {
            if let Some(bc) = c.bytecode {
                let code_i = dc.node_for(SnapKey::Cell(bc));
                let name = dc.add_str(rt.atom_str(Atom::CODE));
                dc.add_edge(node_i, edge_type::INTERNAL, name as u64, code_i);
            }
        }
        ObjectPayload::NativeFunction(data) => {
            let native_i = dc.node_for(SnapKey::NativeFn(data.func as usize));
            if !dc.nodes[native_i].filled {
                dc.nodes[native_i].ty = node_type::NATIVE;
                let name_idx = dc.add_str("cfunc");
                dc.nodes[native_i].name = name_idx;
                dc.nodes[native_i].self_size = std::mem::size_of::<usize>();
                dc.nodes[native_i].filled = true;
            }
            let name = dc.add_str(rt.atom_str(Atom::CODE));
            dc.add_edge(node_i, edge_type::INTERNAL, name as u64, native_i);
        }
        _ => {}
    }

    let name_idx = if Some(id) == global_cell {
        dc.add_str(rt.atom_str(Atom::GLOBAL))
    } else {
        object_node_name(rt, dc, id)
    };
    dc.nodes[node_i].name = name_idx;

    // indexed elements, in order
    if ty == node_type::ARRAY {
        if let ObjectPayload::FastArray(values) = &rt.object(id).payload {
            let values = values.clone();
            for (idx, v) in values.iter().enumerate() {
                let mut targets: Vec<SnapTarget> = Vec::new();
                trace::walk_value(*v, EdgeLabel::Elem(idx as u32), &mut |t, _| targets.push(t));
                for t in targets {
                    let el_i = target_node(rt, dc, t);
                    dc.add_edge(node_i, edge_type::ELEMENT, idx as u64, el_i);
                }
            }
        }
    }
}

fn process_cell(rt: &RuntimeState, dc: &mut DumpCtx, ctx_id: CellId, id: CellId, node_i: usize) {
    match &rt.cell(id).data {
        CellData::Object(_) => process_object(rt, dc, ctx_id, id, node_i),
        CellData::Bytecode(b) => {
            if !dc.nodes[node_i].filled {
                dc.nodes[node_i].ty = node_type::CODE;
                let name = rt.atom_str(b.func_name).to_owned();
                let name_idx = dc.add_str(&name);
                dc.nodes[node_i].name = name_idx;
                dc.nodes[node_i].self_size = bytecode_self_size(rt, id);
                dc.nodes[node_i].filled = true;
            }
        }
        CellData::VarRef(vr) => {
            if !dc.nodes[node_i].filled {
                dc.nodes[node_i].ty = match vr.value {
                    Value::String(_) => node_type::STRING,
                    Value::Int(_) | Value::Float(_) => node_type::NUMBER,
                    _ => node_type::HIDDEN,
                };
                dc.nodes[node_i].self_size = std::mem::size_of::<crate::object::VarRef>();
                dc.nodes[node_i].filled = true;
            }
        }
        CellData::AsyncFunction(_) => {
            if !dc.nodes[node_i].filled {
                dc.nodes[node_i].ty = node_type::HIDDEN;
                let name_idx = dc.add_str("async_function");
                dc.nodes[node_i].name = name_idx;
                dc.nodes[node_i].filled = true;
            }
        }
        CellData::Shape(sh) => {
            if !dc.nodes[node_i].filled {
                dc.nodes[node_i].ty = node_type::HIDDEN;
                let name_idx = dc.add_str(rt.atom_str(Atom::SHAPE));
                dc.nodes[node_i].name = name_idx;
                if sh.hashed {
                    dc.nodes[node_i].self_size = std::mem::size_of::<crate::object::Shape>();
                    let props = sh.props.clone();
                    for (idx, sp) in props.iter().enumerate() {
                        let prop_i = dc.node_for(SnapKey::ShapeProp(id, idx as u32));
                        let name = rt.atom_str(sp.atom).to_owned();
                        dc.nodes[prop_i].ty = node_type::HIDDEN;
                        let name_idx = dc.add_str(&name);
                        dc.nodes[prop_i].name = name_idx;
                        dc.nodes[prop_i].self_size =
                            std::mem::size_of::<crate::object::ShapeProperty>();
                        dc.nodes[prop_i].filled = true;
                        dc.add_edge(node_i, edge_type::ELEMENT, idx as u64, prop_i);
                    }
                }
                dc.nodes[node_i].filled = true;
            }
        }
        CellData::Context(_) => {
            if !dc.nodes[node_i].filled {
                dc.nodes[node_i].ty = node_type::OBJECT;
                let name_idx = dc.add_str(rt.atom_str(Atom::GLOBAL));
                dc.nodes[node_i].name = name_idx;
                dc.nodes[node_i].self_size = std::mem::size_of::<crate::context::JsContext>();
                dc.nodes[node_i].filled = true;
            }
        }
    }
}

fn named_value_edge(
    rt: &RuntimeState,
    dc: &mut DumpCtx,
    parent: usize,
    name: &'static str,
    v: Value,
) {
    let mut targets: Vec<SnapTarget> = Vec::new();
    trace::walk_value(v, EdgeLabel::Name(name), &mut |t, _| targets.push(t));
    for t in targets {
        let child = target_node(rt, dc, t);
        dc.labelled_edge(rt, parent, EdgeLabel::Name(name), child);
    }
}

/// The context's outgoing edges, including the synthetic "Array" grouping
/// nodes for its fixed-size prototype tables.
fn dump_context_children(rt: &RuntimeState, dc: &mut DumpCtx, ctx_id: CellId, parent: usize) {
    let ctx = rt.context_data(ctx_id);
    let global_obj = ctx.global_obj;
    let global_var_obj = ctx.global_var_obj;
    let throw_type_error = ctx.throw_type_error;
    let eval_obj = ctx.eval_obj;
    let array_proto_values = ctx.array_proto_values;
    let native_error_protos = ctx.native_error_protos;
    let class_protos = ctx.class_protos.clone();
    let iterator_proto = ctx.iterator_proto;
    let async_iterator_proto = ctx.async_iterator_proto;
    let promise_ctor = ctx.promise_ctor;
    let array_ctor = ctx.array_ctor;
    let regexp_ctor = ctx.regexp_ctor;
    let function_ctor = ctx.function_ctor;
    let function_proto = ctx.function_proto;
    let array_shape = ctx.array_shape;

    named_value_edge(rt, dc, parent, "global_obj", global_obj);
    named_value_edge(rt, dc, parent, "global_var_obj", global_var_obj);
    named_value_edge(rt, dc, parent, "throw_type_error", throw_type_error);
    named_value_edge(rt, dc, parent, "eval_obj", eval_obj);
    named_value_edge(rt, dc, parent, "array_proto_values", array_proto_values);

    // synthetic grouping node so inspectors render the fixed-size arrays
    let group_i = dc.node_for(SnapKey::ErrProtoGroup(ctx_id));
    dc.nodes[group_i].ty = node_type::SYNTHETIC;
    let name_idx = dc.add_str(rt.atom_str(Atom::ARRAY));
    dc.nodes[group_i].name = name_idx;
    dc.nodes[group_i].filled = true;
    let name = dc.add_str("native_error_proto");
    dc.add_edge(parent, edge_type::INTERNAL, name as u64, group_i);
    for (i, v) in native_error_protos.iter().enumerate() {
        if let Some(cell) = v.gc_cell() {
            let child = dc.node_for(SnapKey::Cell(cell));
            dc.add_edge(group_i, edge_type::ELEMENT, i as u64, child);
        }
    }

    let group_i = dc.node_for(SnapKey::ClassProtoGroup(ctx_id));
    dc.nodes[group_i].ty = node_type::SYNTHETIC;
    let name_idx = dc.add_str(rt.atom_str(Atom::ARRAY));
    dc.nodes[group_i].name = name_idx;
    dc.nodes[group_i].filled = true;
    let name = dc.add_str("class_proto");
    dc.add_edge(parent, edge_type::INTERNAL, name as u64, group_i);
    for (i, v) in class_protos.iter().enumerate() {
        if let Some(cell) = v.gc_cell() {
            let child = dc.node_for(SnapKey::Cell(cell));
            dc.add_edge(group_i, edge_type::ELEMENT, i as u64, child);
        }
    }

    named_value_edge(rt, dc, parent, "iterator_proto", iterator_proto);
    named_value_edge(rt, dc, parent, "async_iterator_proto", async_iterator_proto);
    named_value_edge(rt, dc, parent, "promise_ctor", promise_ctor);
    named_value_edge(rt, dc, parent, "array_ctor", array_ctor);
    named_value_edge(rt, dc, parent, "regexp_ctor", regexp_ctor);
    named_value_edge(rt, dc, parent, "function_ctor", function_ctor);
    named_value_edge(rt, dc, parent, "function_proto", function_proto);
    if let Some(sh) = array_shape {
        let child = dc.node_for(SnapKey::Cell(sh));
        dc.labelled_edge(rt, parent, EdgeLabel::Name("array_shape"), child);
    }
}

fn build_snapshot(rt: &RuntimeState, ctx_id: CellId) -> DumpCtx {
    let mut dc = DumpCtx::new();

    // make sure the context is the root node with index 0
    let root = dc.node_for(SnapKey::Cell(ctx_id));
    debug_assert_eq!(root, 0);

    for id in rt.registry.iter(ListTag::Live) {
        let node_i = dc.node_for(SnapKey::Cell(id));
        process_cell(rt, &mut dc, ctx_id, id, node_i);

        if rt.cell(id).header.kind == CellKind::Context {
            dump_context_children(rt, &mut dc, id, node_i);
        } else {
            let mut pairs: Vec<(SnapTarget, EdgeLabel)> = Vec::new();
            trace::walk_cell_edges(rt, id, &mut |t, l| pairs.push((t, l)));
            for (t, l) in pairs {
                let child = target_node(rt, &mut dc, t);
                dc.labelled_edge(rt, node_i, l, child);
            }
        }
    }
    dc
}

pub(crate) fn write_snapshot(
    rt: &RuntimeState,
    ctx_id: CellId,
    w: &mut dyn Write,
) -> GcResult<()> {
    let dc = build_snapshot(rt, ctx_id);

    let mut nodes_flat: Vec<u64> = Vec::with_capacity(dc.nodes.len() * 5);
    for (i, n) in dc.nodes.iter().enumerate() {
        nodes_flat.push(n.ty as u64);
        nodes_flat.push(n.name as u64);
        nodes_flat.push(i as u64);
        nodes_flat.push(n.self_size as u64);
        nodes_flat.push(n.edges.len() as u64);
    }
    let mut edges_flat: Vec<u64> = Vec::with_capacity(dc.edges_len * 3);
    for n in &dc.nodes {
        for e in &n.edges {
            edges_flat.push(e.ty as u64);
            edges_flat.push(e.name_or_index);
            edges_flat.push(e.to as u64 * NODE_FIELD_COUNT);
        }
    }

    let doc = json!({
        "snapshot": {
            "meta": {
                "node_fields": ["type", "name", "id", "self_size", "edge_count"],
                "node_types": [
                    [
                        "hidden", "array", "string", "object", "code",
                        "closure", "regexp", "number", "native", "synthetic",
                        "concatenated string", "sliced string", "symbol",
                        "bigint"
                    ],
                    "string", "number", "number", "number"
                ],
                "edge_fields": ["type", "name_or_index", "to_node"],
                "edge_types": [
                    [
                        "context", "element", "property", "internal",
                        "hidden", "shortcut", "weak"
                    ],
                    "string_or_number", "node"
                ]
            },
            "node_count": dc.nodes.len(),
            "edge_count": dc.edges_len,
        },
        "nodes": nodes_flat,
        "edges": edges_flat,
        "strings": dc.strs,
    });
    serde_json::to_writer_pretty(&mut *w, &doc)?;
    w.flush()?;
    Ok(())
}

/// Write `Heap.YYYYMMDD.HHMMSS.mmm.heapsnapshot` in the working directory.
pub(crate) fn write_snapshot_file(rt: &RuntimeState, ctx_id: CellId) -> GcResult<PathBuf> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let name = snapshot_filename(now.as_secs() as i64, now.subsec_millis());
    let mut file = std::fs::File::create(&name)?;
    write_snapshot(rt, ctx_id, &mut file)?;
    Ok(PathBuf::from(name))
}

fn snapshot_filename(epoch_secs: i64, millis: u32) -> String {
    let days = epoch_secs.div_euclid(86_400);
    let sod = epoch_secs.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    format!(
        "Heap.{:04}{:02}{:02}.{:02}{:02}{:02}.{:03}.heapsnapshot",
        y,
        m,
        d,
        sod / 3600,
        (sod % 3600) / 60,
        sod % 60,
        millis
    )
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = yoe + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    struct Snapshot {
        nodes: Vec<u64>,
        edges: Vec<u64>,
        strings: Vec<String>,
    }

    fn take_snapshot(ctx: &crate::context::Context) -> Snapshot {
        let mut out = Vec::new();
        ctx.write_heap_snapshot(&mut out).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let nodes = doc["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect::<Vec<_>>();
        let edges = doc["edges"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect::<Vec<_>>();
        let strings = doc["strings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            doc["snapshot"]["node_count"].as_u64().unwrap() as usize,
            nodes.len() / 5
        );
        assert_eq!(
            doc["snapshot"]["edge_count"].as_u64().unwrap() as usize,
            edges.len() / 3
        );
        Snapshot {
            nodes,
            edges,
            strings,
        }
    }

    impl Snapshot {
        fn node_count(&self) -> usize {
            self.nodes.len() / 5
        }

        fn node_type(&self, i: usize) -> u64 {
            self.nodes[i * 5]
        }

        fn node_name(&self, i: usize) -> &str {
            &self.strings[self.nodes[i * 5 + 1] as usize]
        }

        fn edge_count_of(&self, i: usize) -> u64 {
            self.nodes[i * 5 + 4]
        }

        fn has_internal_edge(&self, i: usize, name: &str) -> bool {
            let mut edge_idx = 0usize;
            for node in 0..self.node_count() {
                let count = self.edge_count_of(node) as usize;
                if node == i {
                    for e in edge_idx..edge_idx + count {
                        let ty = self.edges[e * 3];
                        let label = self.edges[e * 3 + 1];
                        if ty == super::edge_type::INTERNAL as u64
                            && self.strings[label as usize] == name
                        {
                            return true;
                        }
                    }
                }
                edge_idx += count;
            }
            false
        }

        /// Follow the property edge named `name` out of node `i`.
        fn follow(&self, i: usize, name: &str) -> Option<usize> {
            let mut edge_idx = 0usize;
            for node in 0..self.node_count() {
                let count = self.edge_count_of(node) as usize;
                for e in edge_idx..edge_idx + count {
                    if node == i {
                        let ty = self.edges[e * 3];
                        let label = self.edges[e * 3 + 1];
                        let to = self.edges[e * 3 + 2];
                        if ty == super::edge_type::PROPERTY as u64
                            && self.strings[label as usize] == name
                        {
                            assert_eq!(to % 5, 0);
                            return Some((to / 5) as usize);
                        }
                    }
                }
                edge_idx += count;
            }
            None
        }
    }

    /// A three-object chain hangs off the global object and the snapshot
    /// exposes it as property edges from the context root.
    #[test]
    fn snapshot_of_object_chain() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let a = ctx.new_object().unwrap();
        let b = ctx.new_object().unwrap();
        let c = ctx.new_object().unwrap();
        ctx.set_property(b, ctx.atom("c").unwrap(), c).unwrap();
        ctx.set_property(a, ctx.atom("b").unwrap(), b).unwrap();
        ctx.set_property(ctx.global(), ctx.atom("a").unwrap(), a)
            .unwrap();

        let snap = take_snapshot(&ctx);
        assert!(snap.node_count() >= 4);

        // node 0 is the context, typed object and named like the global
        assert_eq!(snap.node_type(0), super::node_type::OBJECT as u64);
        assert_eq!(snap.node_name(0), "global");

        // every edge target is a valid node reference
        let limit = (snap.node_count() * 5) as u64;
        for e in 0..snap.edges.len() / 3 {
            let to = snap.edges[e * 3 + 2];
            assert_eq!(to % 5, 0);
            assert!(to < limit);
        }

        // property path: context -> global -> a -> b -> c
        let global = snap.follow(0, "global_obj").unwrap();
        let na = snap.follow(global, "a").unwrap();
        let nb = snap.follow(na, "b").unwrap();
        let nc = snap.follow(nb, "c").unwrap();
        assert_eq!(snap.node_type(nc), super::node_type::OBJECT as u64);
    }

    #[test]
    fn int_properties_become_string_nodes() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let obj = ctx.new_object().unwrap();
        ctx.set_property(obj, ctx.atom("answer").unwrap(), crate::value::Value::Int(42))
            .unwrap();
        ctx.set_property(ctx.global(), ctx.atom("holder").unwrap(), obj)
            .unwrap();

        let snap = take_snapshot(&ctx);
        let global = snap.follow(0, "global_obj").unwrap();
        let holder = snap.follow(global, "holder").unwrap();
        let answer = snap.follow(holder, "answer").unwrap();
        assert_eq!(snap.node_type(answer), super::node_type::STRING as u64);
        assert_eq!(snap.node_name(answer), "42");
    }

    #[test]
    fn arrays_get_element_edges_and_synthetic_groups_exist() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let arr = ctx.new_array().unwrap();
        let s = ctx.new_string("elem").unwrap();
        ctx.array_push(arr, s).unwrap();
        ctx.set_property(ctx.global(), ctx.atom("arr").unwrap(), arr)
            .unwrap();

        let snap = take_snapshot(&ctx);
        let global = snap.follow(0, "global_obj").unwrap();
        let narr = snap.follow(global, "arr").unwrap();
        assert_eq!(snap.node_type(narr), super::node_type::ARRAY as u64);

        // the two synthetic grouping nodes are present and named "Array"
        let synthetic: Vec<usize> = (0..snap.node_count())
            .filter(|&i| snap.node_type(i) == super::node_type::SYNTHETIC as u64)
            .collect();
        assert_eq!(synthetic.len(), 2);
        for i in synthetic {
            assert_eq!(snap.node_name(i), "Array");
        }
    }

    #[test]
    fn named_function_objects_use_their_name() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let snap = take_snapshot(&ctx);
        let eval = snap.follow(0, "eval_obj").unwrap();
        assert_eq!(snap.node_type(eval), super::node_type::CLOSURE as u64);
        assert_eq!(snap.node_name(eval), "eval");
    }

    #[test]
    fn closure_captures_appear_as_internal_edges() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let captured = ctx.new_var_ref(crate::value::Value::Int(5)).unwrap();
        let bytecode = ctx
            .new_function_bytecode("cb", Vec::new(), vec![0x00], None)
            .unwrap();
        let closure = ctx.new_closure(bytecode, &[captured]).unwrap();
        ctx.set_property(ctx.global(), ctx.atom("cb").unwrap(), closure)
            .unwrap();
        rt.release_cell(captured);
        rt.release_value(bytecode);

        let snap = take_snapshot(&ctx);
        let global = snap.follow(0, "global_obj").unwrap();
        let cb = snap.follow(global, "cb").unwrap();
        assert!(snap.has_internal_edge(cb, "var_ref"));
        assert!(snap.has_internal_edge(cb, "code"));

        // native functions point back into their realm
        let eval = snap.follow(0, "eval_obj").unwrap();
        assert!(snap.has_internal_edge(eval, "realm"));
    }

    #[test]
    fn proxies_are_named_proxy() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let target = ctx.new_object().unwrap();
        let handler = ctx.new_object().unwrap();
        let proxy = ctx.new_proxy(target, handler).unwrap();
        ctx.set_property(ctx.global(), ctx.atom("p").unwrap(), proxy)
            .unwrap();

        let snap = take_snapshot(&ctx);
        let global = snap.follow(0, "global_obj").unwrap();
        let p = snap.follow(global, "p").unwrap();
        assert_eq!(snap.node_name(p), "Proxy");
    }

    #[test]
    fn dump_writes_a_timestamped_file() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let path = ctx.dump_heap_snapshot().unwrap();
        let name = path.to_string_lossy().into_owned();
        assert!(name.starts_with("Heap."));
        assert!(name.ends_with(".heapsnapshot"));
        let data = std::fs::read(&path).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&data).is_ok());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn filename_format_matches_profiler_convention() {
        assert_eq!(
            snapshot_filename(0, 0),
            "Heap.19700101.000000.000.heapsnapshot"
        );
        // 2026-08-02 12:34:56.789 UTC
        assert_eq!(
            snapshot_filename(1_785_674_096, 789),
            "Heap.20260802.123456.789.heapsnapshot"
        );
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }
}
