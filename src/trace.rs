//! Reference traversal.
//!
//! `mark_children` is the tracer capability every GC cell kind provides:
//! it invokes the callback exactly once for each outgoing strong reference.
//! The cycle collector, the snapshot writer and the memory-usage walker all
//! compose this traversal with different visitors.

use crate::object::{CellData, ClassId, JsObject, MapState, ObjectPayload, Property};
use crate::runtime::RuntimeState;
use crate::value::{Atom, CellId, StringId, Value};

pub(crate) fn visit_value(v: Value, visit: &mut dyn FnMut(CellId)) {
    if let Some(id) = v.gc_cell() {
        visit(id);
    }
}

/// Visit every GC cell directly referenced by `id`.
pub(crate) fn mark_children(rt: &RuntimeState, id: CellId, visit: &mut dyn FnMut(CellId)) {
    match &rt.cell(id).data {
        CellData::Object(p) => {
            if let Some(sh) = p.shape {
                visit(sh);
            }
            for prop in &p.props {
                match prop {
                    Property::Value(v) => visit_value(*v, visit),
                    Property::GetSet { getter, setter } => {
                        if let Some(g) = *getter {
                            visit(g);
                        }
                        if let Some(s) = *setter {
                            visit(s);
                        }
                    }
                    Property::VarRef(vr) => {
                        // only detached variable references are GC objects
                        if rt.var_ref(*vr).detached {
                            visit(*vr);
                        }
                    }
                    Property::AutoInit { realm } => visit(*realm),
                }
            }
            if p.class_id != ClassId::OBJECT {
                if let Some(tracer) = rt.classes[p.class_id.index()].def.tracer {
                    tracer(rt, p, visit);
                }
            }
        }
        CellData::Bytecode(b) => {
            // the template objects in the constant pool can be part of a cycle
            for v in &b.cpool {
                visit_value(*v, visit);
            }
            if let Some(realm) = b.realm {
                visit(realm);
            }
        }
        CellData::VarRef(vr) => {
            debug_assert!(vr.detached);
            visit_value(vr.value, visit);
        }
        CellData::AsyncFunction(s) => {
            if s.active {
                for v in &s.frame {
                    visit_value(*v, visit);
                }
            }
            visit_value(s.resolving_funcs[0], visit);
            visit_value(s.resolving_funcs[1], visit);
        }
        CellData::Shape(sh) => {
            if let Some(proto) = sh.proto {
                visit(proto);
            }
        }
        CellData::Context(ctx) => {
            // modules are not GC cells, so their contents are reached
            // directly through the context
            for m in &ctx.modules {
                for vr in &m.export_vars {
                    visit(*vr);
                }
                visit_value(m.module_ns, visit);
                visit_value(m.func_obj, visit);
                visit_value(m.eval_exception, visit);
                visit_value(m.meta_obj, visit);
            }
            visit_value(ctx.global_obj, visit);
            visit_value(ctx.global_var_obj, visit);
            visit_value(ctx.throw_type_error, visit);
            visit_value(ctx.eval_obj, visit);
            visit_value(ctx.array_proto_values, visit);
            for v in &ctx.native_error_protos {
                visit_value(*v, visit);
            }
            for v in &ctx.class_protos {
                visit_value(*v, visit);
            }
            visit_value(ctx.iterator_proto, visit);
            visit_value(ctx.async_iterator_proto, visit);
            visit_value(ctx.promise_ctor, visit);
            visit_value(ctx.array_ctor, visit);
            visit_value(ctx.regexp_ctor, visit);
            visit_value(ctx.function_ctor, visit);
            visit_value(ctx.function_proto, visit);
            if let Some(sh) = ctx.array_shape {
                visit(sh);
            }
        }
    }
}

/// Collect the children of `id` into `out` (cleared first). Convenience for
/// callers that need to mutate the heap while consuming the child set.
pub(crate) fn collect_children(rt: &RuntimeState, id: CellId, out: &mut Vec<CellId>) {
    out.clear();
    mark_children(rt, id, &mut |child| out.push(child));
}

// -- per-class tracers ------------------------------------------------------

pub(crate) fn js_array_trace(_rt: &RuntimeState, p: &JsObject, visit: &mut dyn FnMut(CellId)) {
    if let ObjectPayload::FastArray(values) = &p.payload {
        for v in values {
            visit_value(*v, visit);
        }
    }
}

pub(crate) fn js_object_data_trace(_rt: &RuntimeState, p: &JsObject, visit: &mut dyn FnMut(CellId)) {
    if let ObjectPayload::BoxedValue(v) = &p.payload {
        visit_value(*v, visit);
    }
}

pub(crate) fn js_c_function_trace(_rt: &RuntimeState, p: &JsObject, visit: &mut dyn FnMut(CellId)) {
    if let ObjectPayload::NativeFunction(data) = &p.payload {
        if let Some(realm) = data.realm {
            visit(realm);
        }
    }
}

pub(crate) fn js_closure_trace(rt: &RuntimeState, p: &JsObject, visit: &mut dyn FnMut(CellId)) {
    if let ObjectPayload::Closure(c) = &p.payload {
        if let Some(home) = c.home_object {
            visit(home);
        }
        for vr in c.var_refs.iter().flatten() {
            if rt.var_ref(*vr).detached {
                visit(*vr);
            }
        }
        // the bytecode must be marked because template objects may be
        // part of a cycle
        if let Some(bc) = c.bytecode {
            visit(bc);
        }
    }
}

pub(crate) fn js_bound_function_trace(
    _rt: &RuntimeState,
    p: &JsObject,
    visit: &mut dyn FnMut(CellId),
) {
    if let ObjectPayload::BoundFunction(bf) = &p.payload {
        visit_value(bf.func_obj, visit);
        visit_value(bf.this_val, visit);
        for v in &bf.args {
            visit_value(*v, visit);
        }
    }
}

pub(crate) fn js_for_in_iterator_trace(
    _rt: &RuntimeState,
    p: &JsObject,
    visit: &mut dyn FnMut(CellId),
) {
    if let ObjectPayload::ForInIterator(it) = &p.payload {
        visit_value(it.obj, visit);
    }
}

pub(crate) fn js_map_trace(rt: &RuntimeState, p: &JsObject, visit: &mut dyn FnMut(CellId)) {
    if let ObjectPayload::Map(state) = &p.payload {
        match &**state {
            MapState::Strong(entries) => {
                for e in entries.values() {
                    visit_value(e.key, visit);
                    visit_value(e.value, visit);
                }
            }
            MapState::Weak(records) => {
                // weak keys do not keep their target alive, but the stored
                // values are strong
                for rec_id in records.values() {
                    visit_value(rt.weak_record(*rec_id).value, visit);
                }
            }
        }
    }
}

pub(crate) fn js_typed_array_trace(_rt: &RuntimeState, p: &JsObject, visit: &mut dyn FnMut(CellId)) {
    if let ObjectPayload::TypedArray(ta) = &p.payload {
        if let Some(buf) = ta.buffer {
            visit(buf);
        }
    }
}

pub(crate) fn js_proxy_trace(_rt: &RuntimeState, p: &JsObject, visit: &mut dyn FnMut(CellId)) {
    if let ObjectPayload::Proxy(data) = &p.payload {
        visit_value(data.target, visit);
        visit_value(data.handler, visit);
    }
}

// -- snapshot traversal -----------------------------------------------------

/// A reference target as seen by the snapshot writer, which also walks
/// strings and number sentinels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SnapTarget {
    Cell(CellId),
    Str(StringId),
    Int(i32),
}

/// How an edge should be labelled in the snapshot.
#[derive(Debug, Clone, Copy)]
pub enum EdgeLabel {
    Prop(Atom),
    Name(&'static str),
    Elem(u32),
    Internal(&'static str),
    Weak(&'static str),
}

pub(crate) fn walk_value(v: Value, label: EdgeLabel, emit: &mut dyn FnMut(SnapTarget, EdgeLabel)) {
    match v {
        Value::Object(id) | Value::Bytecode(id) => emit(SnapTarget::Cell(id), label),
        Value::String(id) => emit(SnapTarget::Str(id), label),
        Value::Int(i) => emit(SnapTarget::Int(i), label),
        _ => {}
    }
}

/// Labelled edge enumeration for non-context cells. The context cell is
/// walked by the snapshot writer itself, which inserts synthetic grouping
/// nodes for its fixed-size arrays.
pub(crate) fn walk_cell_edges(
    rt: &RuntimeState,
    id: CellId,
    emit: &mut dyn FnMut(SnapTarget, EdgeLabel),
) {
    match &rt.cell(id).data {
        CellData::Object(p) => {
            let shape_props = p
                .shape
                .map(|sh| rt.shape(sh).props.clone())
                .unwrap_or_default();
            for (i, prop) in p.props.iter().enumerate() {
                let atom = shape_props
                    .get(i)
                    .map(|sp| sp.atom)
                    .unwrap_or(Atom::EMPTY);
                match prop {
                    Property::Value(v) => walk_value(*v, EdgeLabel::Prop(atom), emit),
                    Property::GetSet { getter, setter } => {
                        if let Some(g) = *getter {
                            emit(SnapTarget::Cell(g), EdgeLabel::Prop(atom));
                        }
                        if let Some(s) = *setter {
                            emit(SnapTarget::Cell(s), EdgeLabel::Prop(atom));
                        }
                    }
                    Property::VarRef(vr) => {
                        if rt.var_ref(*vr).detached {
                            emit(SnapTarget::Cell(*vr), EdgeLabel::Prop(atom));
                        }
                    }
                    Property::AutoInit { realm } => {
                        emit(SnapTarget::Cell(*realm), EdgeLabel::Prop(atom));
                    }
                }
            }
            if p.class_id != ClassId::OBJECT {
                if let Some(walker) = rt.classes[p.class_id.index()].def.snapshot_walker {
                    walker(rt, p, emit);
                }
            }
        }
        CellData::Bytecode(b) => {
            for (i, v) in b.cpool.iter().enumerate() {
                walk_value(*v, EdgeLabel::Elem(i as u32), emit);
            }
            if let Some(realm) = b.realm {
                emit(SnapTarget::Cell(realm), EdgeLabel::Internal("realm"));
            }
        }
        CellData::VarRef(vr) => {
            walk_value(vr.value, EdgeLabel::Internal("value"), emit);
        }
        CellData::AsyncFunction(s) => {
            if s.active {
                for (i, v) in s.frame.iter().enumerate() {
                    walk_value(*v, EdgeLabel::Elem(i as u32), emit);
                }
            }
            walk_value(s.resolving_funcs[0], EdgeLabel::Internal("resolve"), emit);
            walk_value(s.resolving_funcs[1], EdgeLabel::Internal("reject"), emit);
        }
        CellData::Shape(sh) => {
            if let Some(proto) = sh.proto {
                emit(SnapTarget::Cell(proto), EdgeLabel::Internal("proto"));
            }
        }
        CellData::Context(_) => {}
    }
}

pub(crate) fn js_c_function_walk(
    _rt: &RuntimeState,
    p: &JsObject,
    emit: &mut dyn FnMut(SnapTarget, EdgeLabel),
) {
    if let ObjectPayload::NativeFunction(data) = &p.payload {
        if let Some(realm) = data.realm {
            emit(SnapTarget::Cell(realm), EdgeLabel::Internal("realm"));
        }
    }
}

pub(crate) fn js_closure_walk(
    rt: &RuntimeState,
    p: &JsObject,
    emit: &mut dyn FnMut(SnapTarget, EdgeLabel),
) {
    if let ObjectPayload::Closure(c) = &p.payload {
        if let Some(home) = c.home_object {
            emit(SnapTarget::Cell(home), EdgeLabel::Internal("home_object"));
        }
        for vr in c.var_refs.iter().flatten() {
            if rt.var_ref(*vr).detached {
                emit(SnapTarget::Cell(*vr), EdgeLabel::Internal("var_ref"));
            }
        }
        // the bytecode edge itself is emitted by the writer as the "code"
        // internal edge
    }
}

pub(crate) fn js_bound_function_walk(
    _rt: &RuntimeState,
    p: &JsObject,
    emit: &mut dyn FnMut(SnapTarget, EdgeLabel),
) {
    if let ObjectPayload::BoundFunction(bf) = &p.payload {
        walk_value(bf.func_obj, EdgeLabel::Internal("bound_function"), emit);
        walk_value(bf.this_val, EdgeLabel::Internal("bound_this"), emit);
        for (i, v) in bf.args.iter().enumerate() {
            walk_value(*v, EdgeLabel::Elem(i as u32), emit);
        }
    }
}

pub(crate) fn js_for_in_iterator_walk(
    _rt: &RuntimeState,
    p: &JsObject,
    emit: &mut dyn FnMut(SnapTarget, EdgeLabel),
) {
    if let ObjectPayload::ForInIterator(it) = &p.payload {
        walk_value(it.obj, EdgeLabel::Internal("object"), emit);
    }
}

pub(crate) fn js_map_walk(
    rt: &RuntimeState,
    p: &JsObject,
    emit: &mut dyn FnMut(SnapTarget, EdgeLabel),
) {
    if let ObjectPayload::Map(state) = &p.payload {
        match &**state {
            MapState::Strong(entries) => {
                for e in entries.values() {
                    walk_value(e.key, EdgeLabel::Internal("key"), emit);
                    walk_value(e.value, EdgeLabel::Internal("value"), emit);
                }
            }
            MapState::Weak(records) => {
                for (key, rec_id) in records {
                    emit(SnapTarget::Cell(*key), EdgeLabel::Weak("key"));
                    walk_value(
                        rt.weak_record(*rec_id).value,
                        EdgeLabel::Internal("value"),
                        emit,
                    );
                }
            }
        }
    }
}

pub(crate) fn js_proxy_walk(
    _rt: &RuntimeState,
    p: &JsObject,
    emit: &mut dyn FnMut(SnapTarget, EdgeLabel),
) {
    if let ObjectPayload::Proxy(data) = &p.payload {
        walk_value(data.target, EdgeLabel::Internal("target"), emit);
        walk_value(data.handler, EdgeLabel::Internal("handler"), emit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn children_of(rt: &Runtime, id: CellId) -> Vec<CellId> {
        let state = rt.state.read();
        let mut out = Vec::new();
        mark_children(&state, id, &mut |c| out.push(c));
        out
    }

    fn noop_native(
        _rt: &mut RuntimeState,
        _ctx: CellId,
        _this: Value,
        _args: &[Value],
    ) -> crate::GcResult<Value> {
        Ok(Value::Undefined)
    }

    #[test]
    fn object_trace_covers_shape_and_properties() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let a = ctx.new_object().unwrap();
        let b = ctx.new_object().unwrap();
        ctx.set_property(a, ctx.atom("child").unwrap(), b).unwrap();

        let aid = a.gc_cell().unwrap();
        let bid = b.gc_cell().unwrap();
        let shape = rt.state.read().object(aid).shape.unwrap();
        let children = children_of(&rt, aid);
        assert!(children.contains(&shape));
        assert!(children.contains(&bid));
        rt.release_value(a);
    }

    #[test]
    fn getter_setter_pairs_are_both_traced() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let obj = ctx.new_object().unwrap();
        let getter = ctx.new_native_function("get", noop_native).unwrap();
        let setter = ctx.new_native_function("set", noop_native).unwrap();
        let gid = getter.gc_cell().unwrap();
        let sid = setter.gc_cell().unwrap();
        ctx.define_getset(obj, ctx.atom("accessor").unwrap(), getter, setter)
            .unwrap();

        let children = children_of(&rt, obj.gc_cell().unwrap());
        assert!(children.contains(&gid));
        assert!(children.contains(&sid));
        rt.release_value(obj);
    }

    #[test]
    fn detached_var_ref_traces_its_value() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let inner = ctx.new_object().unwrap();
        let iid = inner.gc_cell().unwrap();
        let vr = ctx.new_var_ref(inner).unwrap();
        assert_eq!(children_of(&rt, vr), vec![iid]);
        rt.release_cell(vr);
    }

    #[test]
    fn closure_traces_captures_and_bytecode() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let captured = ctx.new_var_ref(Value::Int(1)).unwrap();
        let bytecode = ctx
            .new_function_bytecode("f", Vec::new(), vec![0x00], None)
            .unwrap();
        let closure = ctx.new_closure(bytecode, &[captured]).unwrap();
        let bc_id = bytecode.gc_cell().unwrap();

        let children = children_of(&rt, closure.gc_cell().unwrap());
        assert!(children.contains(&captured));
        assert!(children.contains(&bc_id));

        // the bytecode itself reaches back into its realm
        let bc_children = children_of(&rt, bc_id);
        assert!(bc_children.contains(&ctx.cell_id()));

        rt.release_cell(captured);
        rt.release_value(bytecode);
        rt.release_value(closure);
    }

    #[test]
    fn weak_map_traces_values_but_not_keys() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let w = ctx.new_weak_map().unwrap();
        let k = ctx.new_object().unwrap();
        let v = ctx.new_object().unwrap();
        let kid = k.gc_cell().unwrap();
        let vid = v.gc_cell().unwrap();
        ctx.map_set(w, k, v).unwrap();

        let children = children_of(&rt, w.gc_cell().unwrap());
        assert!(children.contains(&vid));
        assert!(!children.contains(&kid));

        rt.release_value(k);
        rt.release_value(w);
    }

    #[test]
    fn async_state_traces_frame_and_resolvers() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let resolve = ctx.new_native_function("resolve", noop_native).unwrap();
        let reject = ctx.new_native_function("reject", noop_native).unwrap();
        let rid = resolve.gc_cell().unwrap();
        let jid = reject.gc_cell().unwrap();
        let state = ctx.new_async_state(resolve, reject).unwrap();
        let held = ctx.new_object().unwrap();
        let hid = held.gc_cell().unwrap();
        ctx.async_state_suspend(state, vec![held]).unwrap();

        let children = children_of(&rt, state);
        assert!(children.contains(&rid));
        assert!(children.contains(&jid));
        assert!(children.contains(&hid));

        rt.release_cell(state);
        assert!(!rt.is_live_object(held));
    }

    #[test]
    fn bound_functions_trace_their_target() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let f = ctx.new_native_function("f", noop_native).unwrap();
        let this_val = ctx.new_object().unwrap();
        let fid = f.gc_cell().unwrap();
        let tid = this_val.gc_cell().unwrap();
        let bf = ctx
            .new_bound_function(f, this_val, vec![Value::Int(1)])
            .unwrap();

        let children = children_of(&rt, bf.gc_cell().unwrap());
        assert!(children.contains(&fid));
        assert!(children.contains(&tid));
        rt.release_value(bf);
    }

    #[test]
    fn context_trace_reaches_the_standard_roots() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let state = rt.state.read();
        let ctx_data = state.context_data(ctx.id);
        let global = ctx_data.global_obj.gc_cell().unwrap();
        let fn_proto = ctx_data.function_proto.gc_cell().unwrap();
        let array_shape = ctx_data.array_shape.unwrap();
        drop(state);

        let children = children_of(&rt, ctx.cell_id());
        assert!(children.contains(&global));
        assert!(children.contains(&fn_proto));
        assert!(children.contains(&array_shape));
        // the context reaches a prototype per class plus the error table
        assert!(children.len() > crate::object::ClassId::STD_COUNT);
    }

    #[test]
    fn module_exports_are_reached_through_the_context() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let exported = ctx.new_var_ref(Value::Int(7)).unwrap();
        let ns = ctx.new_object().unwrap();
        ctx.register_module("util", vec![exported], ns, Value::Undefined)
            .unwrap();

        let children = children_of(&rt, ctx.cell_id());
        assert!(children.contains(&exported));
        assert!(children.contains(&ns.gc_cell().unwrap()));
    }
}
