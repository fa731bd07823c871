//! Memory-usage accounting walker.
//!
//! A read-only pass over the registry producing per-category counts and
//! byte totals. Multiply-referenced strings and var-refs are attributed by
//! fractional share `1 / ref_count` so they are not double-counted; the
//! fractions are rounded once at the end. Best-effort estimates, never
//! exact to the byte.

use std::io::Write;
use std::mem;

use crate::object::{
    CellData, ClosureVarDef, FunctionBytecode, JsObject, ListTag, ObjectPayload, Property, Shape,
    ShapeProperty, VarDef,
};
use crate::runtime::{JsString, RuntimeState};
use crate::value::{StringId, Value};

#[derive(Debug, Default, Clone)]
pub struct MemoryUsage {
    pub malloc_count: i64,
    pub malloc_size: i64,
    pub malloc_limit: i64,
    pub memory_used_count: i64,
    pub memory_used_size: i64,
    pub atom_count: i64,
    pub atom_size: i64,
    pub str_count: i64,
    pub str_size: i64,
    pub obj_count: i64,
    pub obj_size: i64,
    pub prop_count: i64,
    pub prop_size: i64,
    pub shape_count: i64,
    pub shape_size: i64,
    pub js_func_count: i64,
    pub js_func_size: i64,
    pub js_func_code_size: i64,
    pub js_func_pc2line_count: i64,
    pub js_func_pc2line_size: i64,
    pub c_func_count: i64,
    pub array_count: i64,
    pub fast_array_count: i64,
    pub fast_array_elements: i64,
    pub binary_object_count: i64,
    pub binary_object_size: i64,
}

#[derive(Default)]
struct UsageHelper {
    memory_used_count: f64,
    str_count: f64,
    str_size: f64,
    js_func_count: i64,
    js_func_size: f64,
    js_func_code_size: i64,
    js_func_pc2line_count: i64,
    js_func_pc2line_size: i64,
}

fn compute_string_size(rt: &RuntimeState, id: StringId, hp: &mut UsageHelper) {
    let s = rt.string(id);
    let ref_count = s.ref_count as f64;
    hp.str_count += 1.0 / ref_count;
    hp.str_size += (mem::size_of::<JsString>() + s.buf.len()) as f64 / ref_count;
}

fn compute_value_size(rt: &RuntimeState, v: Value, hp: &mut UsageHelper) {
    if let Value::String(id) = v {
        compute_string_size(rt, id, hp);
    }
}

fn compute_bytecode_size(rt: &RuntimeState, b: &FunctionBytecode, hp: &mut UsageHelper) {
    let mut memory_used_count = 0.0;
    let mut js_func_size = mem::size_of::<FunctionBytecode>();
    js_func_size += (b.arg_count as usize + b.vardefs.len()) * mem::size_of::<VarDef>();
    js_func_size += b.cpool.len() * mem::size_of::<Value>();
    for v in &b.cpool {
        compute_value_size(rt, *v, hp);
    }
    js_func_size += b.closure_vars.len() * mem::size_of::<ClosureVarDef>();
    hp.js_func_code_size += b.byte_code.len() as i64;
    if let Some(d) = &b.debug {
        if let Some(src) = d.source {
            memory_used_count += 1.0;
            js_func_size += rt.string(src).buf.len() + 1;
        }
        if !d.pc2line.is_empty() {
            memory_used_count += 1.0;
            hp.js_func_pc2line_count += 1;
            hp.js_func_pc2line_size += d.pc2line.len() as i64;
        }
    }
    hp.js_func_size += js_func_size as f64;
    hp.js_func_count += 1;
    hp.memory_used_count += memory_used_count;
}

fn compute_object_usage(
    rt: &RuntimeState,
    p: &JsObject,
    s: &mut MemoryUsage,
    hp: &mut UsageHelper,
) {
    s.obj_count += 1;
    if !p.props.is_empty() {
        s.memory_used_count += 1;
        s.prop_size += (p.props.capacity() * mem::size_of::<Property>()) as i64;
        s.prop_count += p.props.len() as i64;
        for prop in &p.props {
            if let Property::Value(v) = prop {
                compute_value_size(rt, *v, hp);
            }
        }
    }

    match &p.payload {
        ObjectPayload::FastArray(values) => {
            s.array_count += 1;
            if p.fast_array {
                s.fast_array_count += 1;
                if !values.is_empty() {
                    s.memory_used_count += 1;
                    s.memory_used_size += (values.len() * mem::size_of::<Value>()) as i64;
                    s.fast_array_elements += values.len() as i64;
                    for v in values {
                        compute_value_size(rt, *v, hp);
                    }
                }
            }
        }
        ObjectPayload::BoxedValue(v) => {
            compute_value_size(rt, *v, hp);
        }
        ObjectPayload::NativeFunction(_) => {
            s.c_func_count += 1;
        }
        ObjectPayload::Closure(c) => {
            // home_object and bytecode are accounted in the list scan
            if !c.var_refs.is_empty() {
                s.memory_used_count += 1;
                hp.js_func_size += (c.var_refs.len() * mem::size_of::<Option<crate::value::CellId>>()) as f64;
                for vr in c.var_refs.iter().flatten() {
                    let cell = rt.cell(*vr);
                    let ref_count = cell.header.ref_count as f64;
                    hp.memory_used_count += 1.0 / ref_count;
                    hp.js_func_size += mem::size_of::<crate::object::VarRef>() as f64 / ref_count;
                    if let CellData::VarRef(v) = &cell.data {
                        if v.detached {
                            // potential multiple count
                            compute_value_size(rt, v.value, hp);
                        }
                    }
                }
            }
        }
        ObjectPayload::BoundFunction(bf) => {
            // func_obj and this_val are objects, counted by the list scan
            for v in &bf.args {
                compute_value_size(rt, *v, hp);
            }
            s.memory_used_count += 1;
            s.memory_used_size += (mem::size_of::<crate::object::BoundFunction>()
                + bf.args.len() * mem::size_of::<Value>()) as i64;
        }
        ObjectPayload::RegExp(re) => {
            if let Some(id) = re.pattern {
                compute_string_size(rt, id, hp);
            }
            if let Some(id) = re.bytecode {
                compute_string_size(rt, id, hp);
            }
        }
        ObjectPayload::ForInIterator(it) => {
            compute_value_size(rt, it.obj, hp);
            s.memory_used_count += 1;
            s.memory_used_size += mem::size_of::<crate::object::ForInIterator>() as i64;
        }
        ObjectPayload::ArrayBuffer(ab) => {
            s.binary_object_count += 1;
            s.binary_object_size += ab.data.len() as i64;
            s.memory_used_count += 1;
        }
        ObjectPayload::Map(state) => {
            s.memory_used_count += 1;
            s.memory_used_size +=
                (state.len() * mem::size_of::<crate::object::MapEntry>()) as i64;
        }
        ObjectPayload::TypedArray(_) | ObjectPayload::Proxy(_) => {
            s.memory_used_count += 1;
        }
        ObjectPayload::None => {
            let hint = rt.classes[p.class_id.index()].def.opaque_size;
            if hint != 0 {
                s.memory_used_count += 1;
                s.memory_used_size += hint as i64;
            }
        }
    }
}

/// Compute per-category counts and sizes for the whole runtime. Read-only.
pub(crate) fn compute_memory_usage(rt: &RuntimeState) -> MemoryUsage {
    let mut s = MemoryUsage::default();
    let mut hp = UsageHelper::default();

    s.malloc_count = rt.allocator.state.malloc_count as i64;
    s.malloc_size = rt.allocator.state.malloc_size as i64;
    s.malloc_limit = if rt.allocator.state.malloc_limit == usize::MAX {
        -1
    } else {
        rt.allocator.state.malloc_limit as i64
    };

    // the runtime itself and its class table
    s.memory_used_count = 2;
    s.memory_used_size = (mem::size_of::<RuntimeState>()
        + rt.classes.len() * mem::size_of::<crate::object::ClassDef>()) as i64;

    for &ctx_id in &rt.contexts {
        let ctx = rt.context_data(ctx_id);
        s.memory_used_count += 2; // context + its class prototype table
        s.memory_used_size += (mem::size_of::<crate::context::JsContext>()
            + ctx.class_protos.len() * mem::size_of::<Value>()) as i64;
        for m in &ctx.modules {
            s.memory_used_count += 1;
            s.memory_used_size += mem::size_of::<crate::context::ModuleDef>() as i64;
            if !m.export_vars.is_empty() {
                s.memory_used_count += 1;
                s.memory_used_size +=
                    (m.export_vars.len() * mem::size_of::<crate::value::CellId>()) as i64;
                for vr in &m.export_vars {
                    // potential multiple count
                    s.memory_used_count += 1;
                    compute_value_size(rt, rt.var_ref(*vr).value, &mut hp);
                }
            }
            compute_value_size(rt, m.module_ns, &mut hp);
            compute_value_size(rt, m.func_obj, &mut hp);
        }
    }

    for id in rt.registry.iter(ListTag::Live) {
        match &rt.cell(id).data {
            CellData::Bytecode(b) => compute_bytecode_size(rt, b, &mut hp),
            CellData::Object(p) => compute_object_usage(rt, p, &mut s, &mut hp),
            _ => {}
        }
    }
    s.obj_size += s.obj_count * mem::size_of::<JsObject>() as i64;

    // deduplicated shapes live in the hash table
    s.memory_used_count += 1; // the table itself
    s.memory_used_size +=
        (rt.shape_hash.len() * mem::size_of::<Vec<crate::value::CellId>>()) as i64;
    for chain in rt.shape_hash.values() {
        for &sh_id in chain {
            let sh = rt.shape(sh_id);
            s.shape_count += 1;
            s.shape_size += (mem::size_of::<Shape>()
                + sh.props.len() * mem::size_of::<ShapeProperty>()) as i64;
        }
    }

    // atoms
    s.memory_used_count += 2; // atom array and hash
    s.atom_count = rt.atoms.len() as i64;
    s.atom_size = (rt.atoms.len() * mem::size_of::<Box<str>>()) as i64;
    for a in &rt.atoms {
        s.atom_size += a.len() as i64 + 1;
    }

    s.str_count = hp.str_count.round() as i64;
    s.str_size = hp.str_size.round() as i64;
    s.js_func_count = hp.js_func_count;
    s.js_func_size = hp.js_func_size.round() as i64;
    s.js_func_code_size = hp.js_func_code_size;
    s.js_func_pc2line_count = hp.js_func_pc2line_count;
    s.js_func_pc2line_size = hp.js_func_pc2line_size;
    s.memory_used_count += hp.memory_used_count.round() as i64
        + s.atom_count
        + s.str_count
        + s.obj_count
        + s.shape_count
        + s.js_func_count
        + s.js_func_pc2line_count;
    s.memory_used_size += s.atom_size
        + s.str_size
        + s.obj_size
        + s.prop_size
        + s.shape_size
        + s.js_func_size
        + s.js_func_code_size
        + s.js_func_pc2line_size;
    s
}

/// Render the usage report as a human-readable table.
pub(crate) fn dump_memory_usage(
    w: &mut dyn Write,
    s: &MemoryUsage,
    rt: &RuntimeState,
) -> std::io::Result<()> {
    writeln!(
        w,
        "js-gc memory usage -- {}-bit, malloc limit: {}",
        mem::size_of::<usize>() * 8,
        s.malloc_limit
    )?;
    writeln!(w)?;

    let struct_sizes: &[(&str, usize)] = &[
        ("Runtime", mem::size_of::<RuntimeState>()),
        ("Context", mem::size_of::<crate::context::JsContext>()),
        ("Object", mem::size_of::<JsObject>()),
        ("String", mem::size_of::<JsString>()),
        ("FunctionBytecode", mem::size_of::<FunctionBytecode>()),
    ];
    for (name, size) in struct_sizes {
        writeln!(w, "  {:4}  {}", size, name)?;
    }

    // per-class histogram of live objects
    let mut class_counts = vec![0i64; rt.classes.len()];
    for id in rt.registry.iter(ListTag::Live) {
        if let CellData::Object(p) = &rt.cell(id).data {
            let idx = p.class_id.index().min(rt.classes.len() - 1);
            class_counts[idx] += 1;
        }
    }
    writeln!(w)?;
    writeln!(w, "Object classes")?;
    for (idx, count) in class_counts.iter().enumerate() {
        if *count != 0 {
            writeln!(
                w,
                "  {:5}  {:2} {}",
                count,
                idx,
                rt.atom_str(rt.classes[idx].name_atom)
            )?;
        }
    }
    writeln!(w)?;

    writeln!(w, "{:<20} {:>8} {:>8}", "NAME", "COUNT", "SIZE")?;
    if s.malloc_count != 0 {
        writeln!(
            w,
            "{:<20} {:>8} {:>8}  ({:.1} per block)",
            "memory allocated",
            s.malloc_count,
            s.malloc_size,
            s.malloc_size as f64 / s.malloc_count as f64
        )?;
        writeln!(
            w,
            "{:<20} {:>8} {:>8}",
            "memory used", s.memory_used_count, s.memory_used_size
        )?;
    }
    if s.atom_count != 0 {
        writeln!(
            w,
            "{:<20} {:>8} {:>8}  ({:.1} per atom)",
            "atoms",
            s.atom_count,
            s.atom_size,
            s.atom_size as f64 / s.atom_count as f64
        )?;
    }
    if s.str_count != 0 {
        writeln!(
            w,
            "{:<20} {:>8} {:>8}  ({:.1} per string)",
            "strings",
            s.str_count,
            s.str_size,
            s.str_size as f64 / s.str_count as f64
        )?;
    }
    if s.obj_count != 0 {
        writeln!(
            w,
            "{:<20} {:>8} {:>8}  ({:.1} per object)",
            "objects",
            s.obj_count,
            s.obj_size,
            s.obj_size as f64 / s.obj_count as f64
        )?;
        writeln!(
            w,
            "{:<20} {:>8} {:>8}  ({:.1} per object)",
            "  properties",
            s.prop_count,
            s.prop_size,
            s.prop_count as f64 / s.obj_count as f64
        )?;
        writeln!(
            w,
            "{:<20} {:>8} {:>8}",
            "  shapes", s.shape_count, s.shape_size
        )?;
    }
    if s.js_func_count != 0 {
        writeln!(
            w,
            "{:<20} {:>8} {:>8}",
            "bytecode functions", s.js_func_count, s.js_func_size
        )?;
        writeln!(
            w,
            "{:<20} {:>8} {:>8}  ({:.1} per function)",
            "  bytecode",
            s.js_func_count,
            s.js_func_code_size,
            s.js_func_code_size as f64 / s.js_func_count as f64
        )?;
        if s.js_func_pc2line_count != 0 {
            writeln!(
                w,
                "{:<20} {:>8} {:>8}",
                "  pc2line", s.js_func_pc2line_count, s.js_func_pc2line_size
            )?;
        }
    }
    if s.c_func_count != 0 {
        writeln!(w, "{:<20} {:>8}", "C functions", s.c_func_count)?;
    }
    if s.array_count != 0 {
        writeln!(w, "{:<20} {:>8}", "arrays", s.array_count)?;
        if s.fast_array_count != 0 {
            writeln!(w, "{:<20} {:>8}", "  fast arrays", s.fast_array_count)?;
            writeln!(
                w,
                "{:<20} {:>8} {:>8}  ({:.1} per fast array)",
                "  elements",
                s.fast_array_elements,
                s.fast_array_elements * mem::size_of::<Value>() as i64,
                s.fast_array_elements as f64 / s.fast_array_count as f64
            )?;
        }
    }
    if s.binary_object_count != 0 {
        writeln!(
            w,
            "{:<20} {:>8} {:>8}",
            "binary objects", s.binary_object_count, s.binary_object_size
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;

    #[test]
    fn counts_track_the_heap() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let before = rt.compute_memory_usage();

        let obj = ctx.new_object().unwrap();
        let arr = ctx.new_array().unwrap();
        let s = ctx.new_string("payload").unwrap();
        ctx.array_push(arr, s).unwrap();
        ctx.set_property(obj, ctx.atom("list").unwrap(), arr).unwrap();

        let after = rt.compute_memory_usage();
        assert_eq!(after.obj_count, before.obj_count + 2);
        assert_eq!(after.array_count, before.array_count + 1);
        assert_eq!(after.fast_array_count, before.fast_array_count + 1);
        assert_eq!(after.fast_array_elements, before.fast_array_elements + 1);
        assert_eq!(after.str_count, before.str_count + 1);
        assert!(after.memory_used_size > before.memory_used_size);
        rt.release_value(obj);
    }

    /// A string referenced from two slots is attributed half to each, so
    /// the total count rises by one.
    #[test]
    fn shared_strings_are_fractionally_attributed() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let before = rt.compute_memory_usage();

        let a = ctx.new_object().unwrap();
        let s = ctx.new_string("shared").unwrap();
        rt.retain_value(s);
        ctx.set_property(a, ctx.atom("one").unwrap(), s).unwrap();
        ctx.set_property(a, ctx.atom("two").unwrap(), s).unwrap();

        let after = rt.compute_memory_usage();
        assert_eq!(after.str_count, before.str_count + 1);
        rt.release_value(a);
    }

    #[test]
    fn bytecode_debug_tables_are_split_out() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let bc = ctx
            .new_function_bytecode(
                "f",
                Vec::new(),
                vec![0x01, 0x02, 0x03],
                Some(("demo.js", "function f() {}")),
            )
            .unwrap();
        ctx.set_function_pc2line(bc, &[0, 1, 1, 2]).unwrap();

        let usage = rt.compute_memory_usage();
        assert_eq!(usage.js_func_count, 1);
        assert_eq!(usage.js_func_code_size, 3);
        assert_eq!(usage.js_func_pc2line_count, 1);
        assert_eq!(usage.js_func_pc2line_size, 4);
        rt.release_value(bc);
    }

    #[test]
    fn binary_objects_report_their_bytes() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let ab = ctx.new_array_buffer(&[0u8; 128]).unwrap();
        let usage = rt.compute_memory_usage();
        assert_eq!(usage.binary_object_count, 1);
        assert_eq!(usage.binary_object_size, 128);
        rt.release_value(ab);
    }

    #[test]
    fn dump_renders_the_table() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let obj = ctx.new_object().unwrap();
        ctx.set_property(ctx.global(), ctx.atom("keep").unwrap(), obj)
            .unwrap();

        let usage = rt.compute_memory_usage();
        let mut out = Vec::new();
        rt.dump_memory_usage(&mut out, &usage).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("js-gc memory usage"));
        assert!(text.contains("Object classes"));
        assert!(text.contains("memory allocated"));
        assert!(text.contains("objects"));
    }
}
