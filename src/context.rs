//! Execution context (realm): the global object, standard prototypes and
//! well-known constructors, plus the embedder-facing object-model API.

use std::mem;

use crate::GcResult;
use crate::error::GcError;
use crate::object::{
    ArrayBufferData, AsyncFunctionState, BoundFunction, CellData, ClassId, ClosureData,
    ClosureVarDef, DebugInfo, ForInIterator, FunctionBytecode, JsObject, MapEntry, MapState,
    NativeFn, NativeFunctionData, ObjectPayload, ProxyData, RegExpData, TypedArrayData, VarRef,
};
use crate::runtime::{Runtime, RuntimeState};
use crate::value::{Atom, CellId, MapKey, Value};

pub(crate) const NATIVE_ERROR_COUNT: usize = 8;

pub(crate) struct ModuleDef {
    pub name: Atom,
    pub export_vars: Vec<CellId>,
    pub module_ns: Value,
    pub func_obj: Value,
    pub eval_exception: Value,
    pub meta_obj: Value,
}

/// Realm state stored in a `CellKind::Context` cell. Everything here is a
/// GC root for the snapshot writer and a traced strong reference for the
/// collector.
pub(crate) struct JsContext {
    pub global_obj: Value,
    pub global_var_obj: Value,
    pub throw_type_error: Value,
    pub eval_obj: Value,
    pub array_proto_values: Value,
    pub native_error_protos: [Value; NATIVE_ERROR_COUNT],
    pub class_protos: Vec<Value>,
    pub iterator_proto: Value,
    pub async_iterator_proto: Value,
    pub promise_ctor: Value,
    pub array_ctor: Value,
    pub regexp_ctor: Value,
    pub function_ctor: Value,
    pub function_proto: Value,
    pub array_shape: Option<CellId>,
    pub modules: Vec<ModuleDef>,
    pub pending_error: Option<GcError>,
}

impl JsContext {
    pub(crate) fn empty() -> Self {
        Self {
            global_obj: Value::Undefined,
            global_var_obj: Value::Undefined,
            throw_type_error: Value::Undefined,
            eval_obj: Value::Undefined,
            array_proto_values: Value::Undefined,
            native_error_protos: [Value::Undefined; NATIVE_ERROR_COUNT],
            class_protos: Vec::new(),
            iterator_proto: Value::Undefined,
            async_iterator_proto: Value::Undefined,
            promise_ctor: Value::Undefined,
            array_ctor: Value::Undefined,
            regexp_ctor: Value::Undefined,
            function_ctor: Value::Undefined,
            function_proto: Value::Undefined,
            array_shape: None,
            modules: Vec::new(),
            pending_error: None,
        }
    }
}

// -- native function stubs --------------------------------------------------

fn js_throw_type_error(
    _rt: &mut RuntimeState,
    _ctx: CellId,
    _this: Value,
    _args: &[Value],
) -> GcResult<Value> {
    Ok(Value::Undefined)
}

fn js_global_eval(
    _rt: &mut RuntimeState,
    _ctx: CellId,
    _this: Value,
    _args: &[Value],
) -> GcResult<Value> {
    Ok(Value::Undefined)
}

fn js_array_proto_values(
    _rt: &mut RuntimeState,
    _ctx: CellId,
    _this: Value,
    _args: &[Value],
) -> GcResult<Value> {
    Ok(Value::Undefined)
}

fn js_ctor_stub(
    _rt: &mut RuntimeState,
    _ctx: CellId,
    _this: Value,
    _args: &[Value],
) -> GcResult<Value> {
    Ok(Value::Undefined)
}

/// `__gc_dump_objects()` host binding: writes a timestamped heap snapshot
/// next to the process and returns null.
fn js_gc_dump_objects(
    rt: &mut RuntimeState,
    ctx: CellId,
    _this: Value,
    _args: &[Value],
) -> GcResult<Value> {
    crate::snapshot::write_snapshot_file(rt, ctx)?;
    Ok(Value::Null)
}

// -- context construction ---------------------------------------------------

impl RuntimeState {
    pub(crate) fn value_cell(&self, v: Value) -> GcResult<CellId> {
        match v {
            Value::Object(id) => Ok(id),
            _ => Err(GcError::NotAnObject),
        }
    }

    /// Create an object cell with the initial shape for `proto`. The
    /// returned reference is owned by the caller.
    pub(crate) fn new_object_cell(
        &mut self,
        class_id: ClassId,
        proto: Option<CellId>,
    ) -> GcResult<CellId> {
        let shape = self.initial_shape(proto)?;
        let obj = JsObject::new(class_id, shape);
        match self.new_cell(CellData::Object(Box::new(obj)), true) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.release_cell(shape);
                Err(e)
            }
        }
    }

    fn new_plain(&mut self, class_id: ClassId, proto: Option<CellId>) -> GcResult<Value> {
        Ok(Value::Object(self.new_object_cell(class_id, proto)?))
    }

    pub(crate) fn new_native_function_value(
        &mut self,
        name: &str,
        func: NativeFn,
        realm: Option<CellId>,
        proto: Option<CellId>,
    ) -> GcResult<Value> {
        let id = self.new_object_cell(ClassId::C_FUNCTION, proto)?;
        if let Some(realm) = realm {
            self.retain_cell(realm);
        }
        self.object_mut(id).payload = ObjectPayload::NativeFunction(NativeFunctionData {
            func,
            realm,
        });
        let name_val = Value::String(self.new_string_id(name)?);
        if let Err(e) = self.set_property(id, Atom::NAME, name_val) {
            self.release_cell(id);
            return Err(e);
        }
        Ok(Value::Object(id))
    }

    pub(crate) fn new_context_cell(&mut self) -> GcResult<CellId> {
        let ctx_id = self.new_cell(CellData::Context(Box::new(JsContext::empty())), true)?;
        self.contexts.push(ctx_id);

        let object_proto = self.new_plain(ClassId::OBJECT, None)?;
        let proto_cell = self.value_cell(object_proto)?;
        let function_proto = self.new_plain(ClassId::OBJECT, Some(proto_cell))?;

        let mut class_protos = Vec::with_capacity(self.classes.len());
        for i in 0..self.classes.len() {
            if i == ClassId::OBJECT.index() {
                // transfer our reference on Object.prototype into the table
                class_protos.push(object_proto);
            } else {
                class_protos.push(self.new_plain(ClassId::OBJECT, Some(proto_cell))?);
            }
        }

        let global_obj = self.new_plain(ClassId::OBJECT, Some(proto_cell))?;
        let global_var_obj = self.new_plain(ClassId::OBJECT, None)?;

        let mut native_error_protos = [Value::Undefined; NATIVE_ERROR_COUNT];
        for slot in native_error_protos.iter_mut() {
            *slot = self.new_plain(ClassId::ERROR, Some(proto_cell))?;
        }

        let throw_type_error =
            self.new_native_function_value("", js_throw_type_error, Some(ctx_id), Some(proto_cell))?;
        let eval_obj =
            self.new_native_function_value("eval", js_global_eval, Some(ctx_id), Some(proto_cell))?;
        let array_proto_values = self.new_native_function_value(
            "values",
            js_array_proto_values,
            Some(ctx_id),
            Some(proto_cell),
        )?;

        let iterator_proto = self.new_plain(ClassId::OBJECT, Some(proto_cell))?;
        let async_iterator_proto = self.new_plain(ClassId::OBJECT, Some(proto_cell))?;

        let promise_ctor =
            self.new_native_function_value("Promise", js_ctor_stub, Some(ctx_id), Some(proto_cell))?;
        let array_ctor =
            self.new_native_function_value("Array", js_ctor_stub, Some(ctx_id), Some(proto_cell))?;
        let regexp_ctor =
            self.new_native_function_value("RegExp", js_ctor_stub, Some(ctx_id), Some(proto_cell))?;
        let function_ctor =
            self.new_native_function_value("Function", js_ctor_stub, Some(ctx_id), Some(proto_cell))?;

        let array_proto_cell = self.value_cell(class_protos[ClassId::ARRAY.index()])?;
        let array_shape = self.initial_shape(Some(array_proto_cell))?;

        {
            let ctx = match &mut self.cell_mut(ctx_id).data {
                CellData::Context(c) => c,
                _ => panic!("not a context"),
            };
            ctx.global_obj = global_obj;
            ctx.global_var_obj = global_var_obj;
            ctx.throw_type_error = throw_type_error;
            ctx.eval_obj = eval_obj;
            ctx.array_proto_values = array_proto_values;
            ctx.native_error_protos = native_error_protos;
            ctx.class_protos = class_protos;
            ctx.iterator_proto = iterator_proto;
            ctx.async_iterator_proto = async_iterator_proto;
            ctx.promise_ctor = promise_ctor;
            ctx.array_ctor = array_ctor;
            ctx.regexp_ctor = regexp_ctor;
            ctx.function_ctor = function_ctor;
            ctx.function_proto = function_proto;
            ctx.array_shape = Some(array_shape);
        }

        // host binding for heap snapshots
        let dump_fn = self.new_native_function_value(
            "__gc_dump_objects",
            js_gc_dump_objects,
            Some(ctx_id),
            Some(proto_cell),
        )?;
        let dump_atom = self.intern_atom("__gc_dump_objects")?;
        let global_cell = self.value_cell(global_obj)?;
        self.set_property(global_cell, dump_atom, dump_fn)?;

        Ok(ctx_id)
    }

    pub(crate) fn context_data(&self, id: CellId) -> &JsContext {
        match &self.cell(id).data {
            CellData::Context(c) => c,
            _ => panic!("cell {:?} is not a context", id),
        }
    }

    pub(crate) fn context_data_mut(&mut self, id: CellId) -> &mut JsContext {
        match &mut self.cell_mut(id).data {
            CellData::Context(c) => c,
            _ => panic!("cell {:?} is not a context", id),
        }
    }

    fn class_proto_cell(&self, ctx: CellId, class_id: ClassId) -> Option<CellId> {
        self.context_data(ctx)
            .class_protos
            .get(class_id.index())
            .and_then(|v| v.gc_cell())
    }

    pub(crate) fn map_key(&self, v: Value) -> MapKey {
        match v {
            Value::Undefined => MapKey::Undefined,
            Value::Null => MapKey::Null,
            Value::Bool(b) => MapKey::Bool(b),
            Value::Int(i) => MapKey::Int(i),
            Value::Float(f) => MapKey::from_float(f),
            Value::String(id) => MapKey::Str(self.string_str(id).into()),
            Value::Object(id) | Value::Bytecode(id) => MapKey::Cell(id),
        }
    }
}

// -- class finalizers -------------------------------------------------------
//
// Finalizers take the payload out of the dying object and drop the
// references it owned. They are infallible and never allocate.

pub(crate) fn js_array_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::FastArray(values) =
        mem::take(&mut rt.object_mut(id).payload)
    {
        let cap = values.capacity() * mem::size_of::<Value>();
        for v in values {
            rt.release_value(v);
        }
        let _ = rt.allocator.recharge(cap, 0);
    }
}

pub(crate) fn js_object_data_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::BoxedValue(v) = mem::take(&mut rt.object_mut(id).payload) {
        rt.release_value(v);
    }
}

pub(crate) fn js_c_function_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::NativeFunction(data) = mem::take(&mut rt.object_mut(id).payload) {
        if let Some(realm) = data.realm {
            rt.release_cell(realm);
        }
    }
}

pub(crate) fn js_closure_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::Closure(c) = mem::take(&mut rt.object_mut(id).payload) {
        if let Some(home) = c.home_object {
            rt.release_cell(home);
        }
        for vr in c.var_refs.into_iter().flatten() {
            rt.release_cell(vr);
        }
        if let Some(bc) = c.bytecode {
            rt.release_cell(bc);
        }
    }
}

pub(crate) fn js_bound_function_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::BoundFunction(bf) = mem::take(&mut rt.object_mut(id).payload) {
        rt.release_value(bf.func_obj);
        rt.release_value(bf.this_val);
        for v in bf.args {
            rt.release_value(v);
        }
    }
}

pub(crate) fn js_regexp_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::RegExp(re) = mem::take(&mut rt.object_mut(id).payload) {
        if let Some(p) = re.pattern {
            rt.release_string(p);
        }
        if let Some(b) = re.bytecode {
            rt.release_string(b);
        }
    }
}

pub(crate) fn js_map_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::Map(state) = mem::take(&mut rt.object_mut(id).payload) {
        match *state {
            MapState::Strong(entries) => {
                for (_, e) in entries {
                    rt.release_value(e.key);
                    rt.release_value(e.value);
                }
            }
            MapState::Weak(records) => {
                for (key, rec) in records {
                    // the key may already be a zombie mid-destruction; its
                    // weak list was reset before this map was reached
                    if rt.registry.contains(key) {
                        rt.unlink_weak_record_from(key, rec);
                    }
                    let value = rt.weak_record(rec).value;
                    rt.release_value(value);
                    rt.free_weak_record_slot(rec);
                }
            }
        }
    }
}

pub(crate) fn js_array_buffer_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::ArrayBuffer(ab) = mem::take(&mut rt.object_mut(id).payload) {
        rt.allocator.free_buf(ab.data);
    }
}

pub(crate) fn js_typed_array_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::TypedArray(ta) = mem::take(&mut rt.object_mut(id).payload) {
        if let Some(buf) = ta.buffer {
            rt.release_cell(buf);
        }
    }
}

pub(crate) fn js_for_in_iterator_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::ForInIterator(it) = mem::take(&mut rt.object_mut(id).payload) {
        rt.release_value(it.obj);
    }
}

pub(crate) fn js_proxy_finalizer(rt: &mut RuntimeState, id: CellId) {
    if let ObjectPayload::Proxy(p) = mem::take(&mut rt.object_mut(id).payload) {
        rt.release_value(p.target);
        rt.release_value(p.handler);
    }
}

// -- embedder handle --------------------------------------------------------

/// Handle to one realm. Clones alias the same context cell; the runtime
/// owns the cell until [`Context::close`] or runtime teardown.
#[derive(Clone)]
pub struct Context {
    rt: Runtime,
    pub(crate) id: CellId,
}

impl Context {
    pub(crate) fn new(rt: Runtime) -> GcResult<Context> {
        let id = rt.state.write().new_context_cell()?;
        Ok(Context { rt, id })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn cell_id(&self) -> CellId {
        self.id
    }

    /// Drop the context's own reference. Existing handles become invalid.
    pub fn close(self) {
        self.rt.state.write().release_cell(self.id);
    }

    fn latch<T>(&self, r: GcResult<T>) -> GcResult<T> {
        if let Err(e) = &r {
            if matches!(e, GcError::OutOfMemory | GcError::MemoryLimitExceeded(_)) {
                let mut st = self.rt.state.write();
                let id = self.id;
                if st.registry.contains(id) {
                    st.context_data_mut(id).pending_error = Some(e.clone());
                }
            }
        }
        r
    }

    /// The pending out-of-memory condition, if an allocation failed on
    /// this context. Clears the latch.
    pub fn take_pending_error(&self) -> Option<GcError> {
        self.rt.state.write().context_data_mut(self.id).pending_error.take()
    }

    /// The realm's global object (borrowed; not retained).
    pub fn global(&self) -> Value {
        self.rt.state.read().context_data(self.id).global_obj
    }

    pub fn atom(&self, s: &str) -> GcResult<Atom> {
        let r = self.rt.state.write().intern_atom(s);
        self.latch(r)
    }

    pub fn new_string(&self, s: &str) -> GcResult<Value> {
        let r = self.rt.state.write().new_string_id(s).map(Value::String);
        self.latch(r)
    }

    pub fn new_object(&self) -> GcResult<Value> {
        self.new_object_class(ClassId::OBJECT)
    }

    pub fn new_object_class(&self, class_id: ClassId) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let proto = st.class_proto_cell(self.id, class_id);
            st.new_plain(class_id, proto)
        };
        self.latch(r)
    }

    pub fn new_array(&self) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let proto = st.class_proto_cell(self.id, ClassId::ARRAY);
            let id = st.new_object_cell(ClassId::ARRAY, proto)?;
            {
                let obj = st.object_mut(id);
                obj.fast_array = true;
                obj.payload = ObjectPayload::FastArray(Vec::new());
            }
            Ok(Value::Object(id))
        };
        self.latch(r)
    }

    /// Append to a fast array. Consumes the value reference.
    pub fn array_push(&self, array: Value, v: Value) -> GcResult<()> {
        let mut st = self.rt.state.write();
        let id = match st.value_cell(array) {
            Ok(id) => id,
            Err(e) => {
                st.release_value(v);
                return Err(e);
            }
        };
        let mut values = match &mut st.object_mut(id).payload {
            ObjectPayload::FastArray(values) => mem::take(values),
            _ => {
                st.release_value(v);
                return Err(GcError::NotAnObject);
            }
        };
        let new_len = values.len() + 1;
        let r = st.allocator.realloc_array(&mut values, new_len);
        match &r {
            Ok(()) => values.push(v),
            Err(_) => st.release_value(v),
        }
        if let ObjectPayload::FastArray(slot) = &mut st.object_mut(id).payload {
            *slot = values;
        }
        r
    }

    pub fn array_len(&self, array: Value) -> GcResult<usize> {
        let st = self.rt.state.read();
        let id = st.value_cell(array)?;
        match &st.object(id).payload {
            ObjectPayload::FastArray(values) => Ok(values.len()),
            _ => Err(GcError::NotAnObject),
        }
    }

    /// Store a value property. Consumes the value reference.
    pub fn set_property(&self, obj: Value, atom: Atom, v: Value) -> GcResult<()> {
        let r = {
            let mut st = self.rt.state.write();
            match st.value_cell(obj) {
                Ok(id) => st.set_property(id, atom, v),
                Err(e) => {
                    st.release_value(v);
                    Err(e)
                }
            }
        };
        self.latch(r)
    }

    /// Prototype-chain lookup; missing properties read as undefined. The
    /// result is retained.
    pub fn get_property(&self, obj: Value, atom: Atom) -> GcResult<Value> {
        let mut st = self.rt.state.write();
        let id = st.value_cell(obj)?;
        Ok(st.get_property(id, atom).unwrap_or(Value::Undefined))
    }

    /// Define an accessor property. Consumes both references.
    pub fn define_getset(
        &self,
        obj: Value,
        atom: Atom,
        getter: Value,
        setter: Value,
    ) -> GcResult<()> {
        let mut st = self.rt.state.write();
        let id = match st.value_cell(obj) {
            Ok(id) => id,
            Err(e) => {
                st.release_value(getter);
                st.release_value(setter);
                return Err(e);
            }
        };
        let g = getter.gc_cell();
        let s = setter.gc_cell();
        st.set_property_getset(id, atom, g, s)
    }

    pub fn new_native_function(&self, name: &str, func: NativeFn) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let proto = st.class_proto_cell(self.id, ClassId::C_FUNCTION);
            st.new_native_function_value(name, func, Some(self.id), proto)
        };
        self.latch(r)
    }

    /// Invoke a native function value.
    pub fn call(&self, func: Value, this: Value, args: &[Value]) -> GcResult<Value> {
        let mut st = self.rt.state.write();
        let id = st.value_cell(func).map_err(|_| GcError::NotCallable)?;
        let f = match &st.object(id).payload {
            ObjectPayload::NativeFunction(data) => data.func,
            _ => return Err(GcError::NotCallable),
        };
        f(&mut st, self.id, this, args)
    }

    /// Compile-side constructor for function bytecode. Consumes the
    /// constant-pool references.
    pub fn new_function_bytecode(
        &self,
        name: &str,
        cpool: Vec<Value>,
        byte_code: Vec<u8>,
        debug: Option<(&str, &str)>,
    ) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let func_name = st.intern_atom(name)?;
            let debug = match debug {
                Some((filename, source)) => {
                    let filename = st.intern_atom(filename)?;
                    let source = st.new_string_id(source)?;
                    Some(DebugInfo {
                        filename,
                        source: Some(source),
                        pc2line: Vec::new(),
                    })
                }
                None => None,
            };
            let extra = byte_code.capacity() + cpool.capacity() * mem::size_of::<Value>();
            if let Err(e) = st.allocator.recharge(0, extra) {
                for v in cpool {
                    st.release_value(v);
                }
                if let Some(d) = debug {
                    if let Some(src) = d.source {
                        st.release_string(src);
                    }
                }
                drop(st);
                return self.latch(Err(e));
            }
            let b = FunctionBytecode {
                func_name,
                cpool,
                closure_vars: Vec::new(),
                vardefs: Vec::new(),
                arg_count: 0,
                byte_code,
                realm: Some(self.id),
                debug,
            };
            match st.new_cell(CellData::Bytecode(Box::new(b)), true) {
                Ok(id) => {
                    st.retain_cell(self.id);
                    Ok(Value::Bytecode(id))
                }
                Err(e) => Err(e),
            }
        };
        self.latch(r)
    }

    /// Declare the closure variables a function captures; one slot per
    /// var-ref passed to [`Context::new_closure`].
    pub fn set_closure_vars(&self, bytecode: Value, names: &[&str]) -> GcResult<()> {
        let mut st = self.rt.state.write();
        let id = match bytecode {
            Value::Bytecode(id) => id,
            _ => return Err(GcError::NotAnObject),
        };
        let mut vars = Vec::with_capacity(names.len());
        for n in names {
            vars.push(ClosureVarDef {
                name: st.intern_atom(n)?,
            });
        }
        match &mut st.cell_mut(id).data {
            CellData::Bytecode(b) => b.closure_vars = vars,
            _ => return Err(GcError::NotAnObject),
        }
        Ok(())
    }

    /// Attach a pc-to-line table to compiled bytecode, creating the debug
    /// record if the function was compiled without one.
    pub fn set_function_pc2line(&self, bytecode: Value, table: &[u8]) -> GcResult<()> {
        let r = {
            let mut st = self.rt.state.write();
            let id = match bytecode {
                Value::Bytecode(id) => id,
                _ => return Err(GcError::NotAnObject),
            };
            let old_cap = match &st.cell(id).data {
                CellData::Bytecode(b) => b.debug.as_ref().map_or(0, |d| d.pc2line.capacity()),
                _ => return Err(GcError::NotAnObject),
            };
            let mut pc2line: Vec<u8> = Vec::new();
            if let Err(e) = st.allocator.realloc_array(&mut pc2line, table.len()) {
                drop(st);
                return self.latch(Err(e));
            }
            pc2line.extend_from_slice(table);
            let _ = st.allocator.recharge(old_cap, 0);
            if let CellData::Bytecode(b) = &mut st.cell_mut(id).data {
                match &mut b.debug {
                    Some(d) => d.pc2line = pc2line,
                    None => {
                        b.debug = Some(DebugInfo {
                            filename: Atom::EMPTY,
                            source: None,
                            pc2line,
                        })
                    }
                }
            }
            Ok(())
        };
        self.latch(r)
    }

    /// Instantiate a closure over `bytecode`. Retains the bytecode and
    /// each var-ref.
    pub fn new_closure(&self, bytecode: Value, var_refs: &[CellId]) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let bc = match bytecode {
                Value::Bytecode(id) => id,
                _ => return Err(GcError::NotAnObject),
            };
            let proto = st.class_proto_cell(self.id, ClassId::BYTECODE_FUNCTION);
            let id = st.new_object_cell(ClassId::BYTECODE_FUNCTION, proto)?;
            st.retain_cell(bc);
            for vr in var_refs {
                st.retain_cell(*vr);
            }
            st.object_mut(id).payload = ObjectPayload::Closure(Box::new(ClosureData {
                bytecode: Some(bc),
                home_object: None,
                var_refs: var_refs.iter().copied().map(Some).collect(),
            }));
            Ok(Value::Object(id))
        };
        self.latch(r)
    }

    /// Create a detached var-ref owning `v`. Consumes the reference.
    pub fn new_var_ref(&self, v: Value) -> GcResult<CellId> {
        let r = self.rt.state.write().new_cell(
            CellData::VarRef(VarRef {
                value: v,
                detached: true,
            }),
            true,
        );
        self.latch(r)
    }

    /// Create a var-ref that still aliases a live frame slot. It is not
    /// registered with the GC until detached.
    pub fn new_attached_var_ref(&self, v: Value) -> GcResult<CellId> {
        let r = self.rt.state.write().new_cell(
            CellData::VarRef(VarRef {
                value: v,
                detached: false,
            }),
            false,
        );
        self.latch(r)
    }

    /// Close an attached var-ref: it takes ownership of the value and
    /// joins the GC registry.
    pub fn detach_var_ref(&self, vr: CellId, v: Value) -> GcResult<()> {
        let mut st = self.rt.state.write();
        {
            let r = st.var_ref_mut(vr);
            if r.detached {
                return Ok(());
            }
            r.detached = true;
            r.value = v;
        }
        st.registry.push_back(crate::object::ListTag::Live, vr);
        Ok(())
    }

    pub fn new_map(&self) -> GcResult<Value> {
        self.new_map_class(ClassId::MAP)
    }

    pub fn new_weak_map(&self) -> GcResult<Value> {
        self.new_map_class(ClassId::WEAK_MAP)
    }

    pub fn new_set(&self) -> GcResult<Value> {
        self.new_map_class(ClassId::SET)
    }

    pub fn new_weak_set(&self) -> GcResult<Value> {
        self.new_map_class(ClassId::WEAK_SET)
    }

    fn new_map_class(&self, class_id: ClassId) -> GcResult<Value> {
        let weak = class_id == ClassId::WEAK_MAP || class_id == ClassId::WEAK_SET;
        let r = {
            let mut st = self.rt.state.write();
            let proto = st.class_proto_cell(self.id, class_id);
            let id = st.new_object_cell(class_id, proto)?;
            let state = if weak {
                MapState::Weak(Default::default())
            } else {
                MapState::Strong(Default::default())
            };
            st.object_mut(id).payload = ObjectPayload::Map(Box::new(state));
            Ok(Value::Object(id))
        };
        self.latch(r)
    }

    /// Insert into a map or set. Consumes the value reference. For strong
    /// maps the key reference is consumed too; weak maps never count their
    /// keys.
    pub fn map_set(&self, map: Value, key: Value, value: Value) -> GcResult<()> {
        let mut st = self.rt.state.write();
        let map_id = match st.value_cell(map) {
            Ok(id) => id,
            Err(e) => {
                st.release_value(key);
                st.release_value(value);
                return Err(e);
            }
        };
        let is_weak = match &st.object(map_id).payload {
            ObjectPayload::Map(state) => state.is_weak(),
            _ => {
                st.release_value(key);
                st.release_value(value);
                return Err(GcError::NotAnObject);
            }
        };
        if is_weak {
            let key_id = match st.value_cell(key) {
                Ok(id) => id,
                Err(e) => {
                    st.release_value(value);
                    return Err(e);
                }
            };
            let existing = match &st.object(map_id).payload {
                ObjectPayload::Map(state) => match &**state {
                    MapState::Weak(records) => records.get(&key_id).copied(),
                    _ => None,
                },
                _ => None,
            };
            if let Some(rec) = existing {
                let old = st.weak_records[rec.0 as usize]
                    .as_mut()
                    .map(|r| mem::replace(&mut r.value, value));
                if let Some(old) = old {
                    st.release_value(old);
                }
                return Ok(());
            }
            let rec = st.new_weak_record(map_id, key_id, value)?;
            if let ObjectPayload::Map(state) = &mut st.object_mut(map_id).payload {
                if let MapState::Weak(records) = &mut **state {
                    records.insert(key_id, rec);
                }
            }
            Ok(())
        } else {
            let map_key = st.map_key(key);
            let old = match &mut st.object_mut(map_id).payload {
                ObjectPayload::Map(state) => match &mut **state {
                    MapState::Strong(entries) => {
                        entries.insert(map_key, MapEntry { key, value })
                    }
                    _ => None,
                },
                _ => None,
            };
            if let Some(e) = old {
                // the slot keeps its original key object
                st.release_value(key);
                st.release_value(e.value);
            }
            Ok(())
        }
    }

    /// Lookup; the result is retained.
    pub fn map_get(&self, map: Value, key: Value) -> GcResult<Option<Value>> {
        let mut st = self.rt.state.write();
        let map_id = st.value_cell(map)?;
        let found = match &st.object(map_id).payload {
            ObjectPayload::Map(state) => match &**state {
                MapState::Strong(entries) => {
                    let k = st.map_key(key);
                    entries.get(&k).map(|e| e.value)
                }
                MapState::Weak(records) => match key.gc_cell() {
                    Some(key_id) => records
                        .get(&key_id)
                        .map(|rec| st.weak_record(*rec).value),
                    None => None,
                },
            },
            _ => return Err(GcError::NotAnObject),
        };
        if let Some(v) = found {
            st.retain_value(v);
        }
        Ok(found)
    }

    pub fn map_has(&self, map: Value, key: Value) -> GcResult<bool> {
        let st = self.rt.state.read();
        let map_id = st.value_cell(map)?;
        match &st.object(map_id).payload {
            ObjectPayload::Map(state) => match &**state {
                MapState::Strong(entries) => Ok(entries.contains_key(&st.map_key(key))),
                MapState::Weak(records) => Ok(match key.gc_cell() {
                    Some(key_id) => records.contains_key(&key_id),
                    None => false,
                }),
            },
            _ => Err(GcError::NotAnObject),
        }
    }

    pub fn map_delete(&self, map: Value, key: Value) -> GcResult<bool> {
        let mut st = self.rt.state.write();
        let map_id = st.value_cell(map)?;
        let is_weak = match &st.object(map_id).payload {
            ObjectPayload::Map(state) => state.is_weak(),
            _ => return Err(GcError::NotAnObject),
        };
        if is_weak {
            let key_id = match key.gc_cell() {
                Some(id) => id,
                None => return Ok(false),
            };
            let rec = match &mut st.object_mut(map_id).payload {
                ObjectPayload::Map(state) => match &mut **state {
                    MapState::Weak(records) => records.remove(&key_id),
                    _ => None,
                },
                _ => None,
            };
            match rec {
                Some(rec) => {
                    st.unlink_weak_record_from(key_id, rec);
                    let value = st.weak_record(rec).value;
                    st.release_value(value);
                    st.free_weak_record_slot(rec);
                    Ok(true)
                }
                None => Ok(false),
            }
        } else {
            let k = st.map_key(key);
            let removed = match &mut st.object_mut(map_id).payload {
                ObjectPayload::Map(state) => match &mut **state {
                    MapState::Strong(entries) => entries.remove(&k),
                    _ => None,
                },
                _ => None,
            };
            match removed {
                Some(e) => {
                    st.release_value(e.key);
                    st.release_value(e.value);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    pub fn map_size(&self, map: Value) -> GcResult<usize> {
        let st = self.rt.state.read();
        let map_id = st.value_cell(map)?;
        match &st.object(map_id).payload {
            ObjectPayload::Map(state) => Ok(state.len()),
            _ => Err(GcError::NotAnObject),
        }
    }

    pub fn new_array_buffer(&self, data: &[u8]) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let mut buf = st.alloc_buf_with_retry(data.len(), false)?;
            buf.as_bytes_mut().copy_from_slice(data);
            let proto = st.class_proto_cell(self.id, ClassId::ARRAY_BUFFER);
            let id = match st.new_object_cell(ClassId::ARRAY_BUFFER, proto) {
                Ok(id) => id,
                Err(e) => {
                    st.allocator.free_buf(buf);
                    return Err(e);
                }
            };
            st.object_mut(id).payload = ObjectPayload::ArrayBuffer(ArrayBufferData { data: buf });
            Ok(Value::Object(id))
        };
        self.latch(r)
    }

    /// `ArrayBuffer(len)` semantics: a zero-filled buffer.
    pub fn new_array_buffer_zeroed(&self, len: usize) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let buf = st.alloc_buf_with_retry(len, true)?;
            let proto = st.class_proto_cell(self.id, ClassId::ARRAY_BUFFER);
            let id = match st.new_object_cell(ClassId::ARRAY_BUFFER, proto) {
                Ok(id) => id,
                Err(e) => {
                    st.allocator.free_buf(buf);
                    return Err(e);
                }
            };
            st.object_mut(id).payload = ObjectPayload::ArrayBuffer(ArrayBufferData { data: buf });
            Ok(Value::Object(id))
        };
        self.latch(r)
    }

    /// Resize a buffer in place through the allocator function table.
    pub fn array_buffer_resize(&self, buffer: Value, new_len: usize) -> GcResult<()> {
        let mut st = self.rt.state.write();
        let id = st.value_cell(buffer)?;
        let mut data = match &mut st.object_mut(id).payload {
            ObjectPayload::ArrayBuffer(ab) => mem::replace(&mut ab.data, crate::alloc::MemBuf::empty()),
            _ => return Err(GcError::NotAnObject),
        };
        let r = st.allocator.realloc_buf(&mut data, new_len);
        if let ObjectPayload::ArrayBuffer(ab) = &mut st.object_mut(id).payload {
            ab.data = data;
        }
        r
    }

    pub fn array_buffer_len(&self, buffer: Value) -> GcResult<usize> {
        let st = self.rt.state.read();
        let id = st.value_cell(buffer)?;
        match &st.object(id).payload {
            ObjectPayload::ArrayBuffer(ab) => Ok(ab.data.len()),
            _ => Err(GcError::NotAnObject),
        }
    }

    /// A typed-array view over `buffer`. Retains the buffer.
    pub fn new_typed_array(&self, buffer: Value, offset: usize, length: usize) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let buf_id = st.value_cell(buffer)?;
            let proto = st.class_proto_cell(self.id, ClassId::TYPED_ARRAY);
            let id = st.new_object_cell(ClassId::TYPED_ARRAY, proto)?;
            st.retain_cell(buf_id);
            st.object_mut(id).payload = ObjectPayload::TypedArray(TypedArrayData {
                buffer: Some(buf_id),
                offset,
                length,
            });
            Ok(Value::Object(id))
        };
        self.latch(r)
    }

    /// Bind `this` and leading arguments. Consumes every reference.
    pub fn new_bound_function(
        &self,
        func: Value,
        this_val: Value,
        args: Vec<Value>,
    ) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let proto = st.class_proto_cell(self.id, ClassId::BOUND_FUNCTION);
            match st.new_object_cell(ClassId::BOUND_FUNCTION, proto) {
                Ok(id) => {
                    st.object_mut(id).payload =
                        ObjectPayload::BoundFunction(Box::new(BoundFunction {
                            func_obj: func,
                            this_val,
                            args,
                        }));
                    Ok(Value::Object(id))
                }
                Err(e) => {
                    st.release_value(func);
                    st.release_value(this_val);
                    for v in args {
                        st.release_value(v);
                    }
                    Err(e)
                }
            }
        };
        self.latch(r)
    }

    pub fn new_regexp(&self, pattern: &str) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let pat = st.new_string_id(pattern)?;
            let bc = st.new_string_id("")?;
            let proto = st.class_proto_cell(self.id, ClassId::REGEXP);
            let id = st.new_object_cell(ClassId::REGEXP, proto)?;
            st.object_mut(id).payload = ObjectPayload::RegExp(RegExpData {
                pattern: Some(pat),
                bytecode: Some(bc),
            });
            Ok(Value::Object(id))
        };
        self.latch(r)
    }

    /// For-in iteration state over `obj`. Consumes the reference.
    pub fn new_for_in_iterator(&self, obj: Value) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let keys = match obj {
                Value::Object(id) => match st.object(id).shape {
                    Some(sh) => st.shape(sh).props.iter().map(|p| p.atom).collect(),
                    None => Vec::new(),
                },
                _ => Vec::new(),
            };
            let proto = st.class_proto_cell(self.id, ClassId::FOR_IN_ITERATOR);
            match st.new_object_cell(ClassId::FOR_IN_ITERATOR, proto) {
                Ok(id) => {
                    st.object_mut(id).payload =
                        ObjectPayload::ForInIterator(Box::new(ForInIterator {
                            obj,
                            keys,
                            idx: 0,
                        }));
                    Ok(Value::Object(id))
                }
                Err(e) => {
                    st.release_value(obj);
                    Err(e)
                }
            }
        };
        self.latch(r)
    }

    /// Step a for-in iterator to its next enumerable key.
    pub fn for_in_next(&self, iter: Value) -> GcResult<Option<Atom>> {
        let mut st = self.rt.state.write();
        let id = st.value_cell(iter)?;
        match &mut st.object_mut(id).payload {
            ObjectPayload::ForInIterator(it) => {
                if it.idx < it.keys.len() {
                    let atom = it.keys[it.idx];
                    it.idx += 1;
                    Ok(Some(atom))
                } else {
                    Ok(None)
                }
            }
            _ => Err(GcError::NotAnObject),
        }
    }

    /// Byte offset and element length of a typed-array view.
    pub fn typed_array_range(&self, view: Value) -> GcResult<(usize, usize)> {
        let st = self.rt.state.read();
        let id = st.value_cell(view)?;
        match &st.object(id).payload {
            ObjectPayload::TypedArray(ta) => Ok((ta.offset, ta.length)),
            _ => Err(GcError::NotAnObject),
        }
    }

    /// Consumes both references.
    pub fn new_proxy(&self, target: Value, handler: Value) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let proto = st.class_proto_cell(self.id, ClassId::PROXY);
            match st.new_object_cell(ClassId::PROXY, proto) {
                Ok(id) => {
                    st.object_mut(id).payload = ObjectPayload::Proxy(ProxyData { target, handler });
                    Ok(Value::Object(id))
                }
                Err(e) => {
                    st.release_value(target);
                    st.release_value(handler);
                    Err(e)
                }
            }
        };
        self.latch(r)
    }

    /// Boxed primitive (`Number`, `String`, `Boolean` object). Consumes
    /// the reference.
    pub fn new_boxed(&self, class_id: ClassId, v: Value) -> GcResult<Value> {
        let r = {
            let mut st = self.rt.state.write();
            let proto = st.class_proto_cell(self.id, class_id);
            match st.new_object_cell(class_id, proto) {
                Ok(id) => {
                    st.object_mut(id).payload = ObjectPayload::BoxedValue(v);
                    Ok(Value::Object(id))
                }
                Err(e) => {
                    st.release_value(v);
                    Err(e)
                }
            }
        };
        self.latch(r)
    }

    /// Async-function bookkeeping cell. Consumes both resolver refs; the
    /// returned cell reference is owned by the caller.
    pub fn new_async_state(&self, resolve: Value, reject: Value) -> GcResult<CellId> {
        let r = self.rt.state.write().new_cell(
            CellData::AsyncFunction(Box::new(AsyncFunctionState {
                active: false,
                frame: Vec::new(),
                resolving_funcs: [resolve, reject],
            })),
            true,
        );
        self.latch(r)
    }

    /// Suspend: the state takes ownership of the frame values.
    pub fn async_state_suspend(&self, state: CellId, frame: Vec<Value>) -> GcResult<()> {
        let mut st = self.rt.state.write();
        match &mut st.cell_mut(state).data {
            CellData::AsyncFunction(s) => {
                debug_assert!(!s.active);
                s.active = true;
                s.frame = frame;
                Ok(())
            }
            _ => Err(GcError::NotAnObject),
        }
    }

    /// Register a loaded module. Consumes the namespace/function refs and
    /// the export var-ref references.
    pub fn register_module(
        &self,
        name: &str,
        export_vars: Vec<CellId>,
        module_ns: Value,
        func_obj: Value,
    ) -> GcResult<()> {
        let r = {
            let mut st = self.rt.state.write();
            let name = st.intern_atom(name)?;
            st.context_data_mut(self.id).modules.push(ModuleDef {
                name,
                export_vars,
                module_ns,
                func_obj,
                eval_exception: Value::Undefined,
                meta_obj: Value::Undefined,
            });
            Ok(())
        };
        self.latch(r)
    }

    /// Write a timestamped `*.heapsnapshot` file in the working directory
    /// and return its path.
    pub fn dump_heap_snapshot(&self) -> GcResult<std::path::PathBuf> {
        let st = self.rt.state.read();
        crate::snapshot::write_snapshot_file(&st, self.id)
    }

    /// Serialize the snapshot to any sink.
    pub fn write_heap_snapshot(&self, w: &mut dyn std::io::Write) -> GcResult<()> {
        let st = self.rt.state.read();
        crate::snapshot::write_snapshot(&st, self.id, w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn property_roundtrip() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let obj = ctx.new_object().unwrap();
        let name = ctx.atom("title").unwrap();
        let s = ctx.new_string("heap").unwrap();
        ctx.set_property(obj, name, s).unwrap();
        let got = ctx.get_property(obj, name).unwrap();
        assert_eq!(rt.value_to_string(got), Some("heap".to_owned()));
        rt.release_value(got);
        rt.release_value(obj);
    }

    #[test]
    fn prototype_chain_lookup() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        // Object.prototype carries the property; a fresh object sees it
        let proto_prop = ctx.atom("shared").unwrap();
        let object_proto = {
            let st = rt.state.read();
            st.context_data(ctx.id).class_protos[ClassId::OBJECT.index()]
        };
        ctx.set_property(object_proto, proto_prop, Value::Int(7))
            .unwrap();
        let obj = ctx.new_object().unwrap();
        assert_eq!(ctx.get_property(obj, proto_prop).unwrap(), Value::Int(7));
        rt.release_value(obj);
    }

    /// Dropping the only reference reclaims the object and its string
    /// immediately, with no collection.
    #[test]
    fn acyclic_drop_reclaims_string() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let base = rt.live_cell_count();

        let a = ctx.new_object().unwrap();
        let x = ctx.new_string("x").unwrap();
        ctx.set_property(a, ctx.atom("value").unwrap(), x).unwrap();
        assert_eq!(rt.ref_count(x), Some(1));

        rt.release_value(a);
        assert_eq!(rt.live_cell_count(), base);
        assert_eq!(rt.ref_count(x), None);
        assert_eq!(rt.stats().collections, 0);
    }

    /// Weak-map records are invalidated when their key dies.
    #[test]
    fn weak_map_cleanup_on_key_death() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let w = ctx.new_weak_map().unwrap();
        let k = ctx.new_object().unwrap();
        let v = ctx.new_string("v").unwrap();

        ctx.map_set(w, k, v).unwrap();
        assert!(ctx.map_has(w, k).unwrap());
        assert_eq!(ctx.map_size(w).unwrap(), 1);
        // the weak record does not count toward the key's refcount
        assert_eq!(rt.ref_count(k), Some(1));

        rt.release_value(k);
        rt.run_gc();
        assert!(!ctx.map_has(w, k).unwrap());
        assert_eq!(ctx.map_size(w).unwrap(), 0);
        assert_eq!(rt.ref_count(v), None);
        rt.release_value(w);
    }

    #[test]
    fn weak_map_death_unlinks_its_records() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let w = ctx.new_weak_map().unwrap();
        let k = ctx.new_object().unwrap();
        let v = ctx.new_string("payload").unwrap();
        ctx.map_set(w, k, v).unwrap();

        // dropping the map must excise the backlink from the live key
        rt.release_value(w);
        assert_eq!(rt.ref_count(v), None);
        {
            let st = rt.state.read();
            let kid = k.gc_cell().unwrap();
            assert!(st.object(kid).first_weak_ref.is_none());
        }
        rt.release_value(k);
    }

    #[test]
    fn strong_map_owns_keys_and_values() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let m = ctx.new_map().unwrap();
        let k = ctx.new_object().unwrap();
        let v = ctx.new_object().unwrap();
        rt.retain_value(k);
        ctx.map_set(m, k, v).unwrap();
        assert_eq!(rt.ref_count(k), Some(2));
        assert!(ctx.map_has(m, k).unwrap());
        let got = ctx.map_get(m, k).unwrap().unwrap();
        assert_eq!(got, v);
        rt.release_value(got);
        assert!(ctx.map_delete(m, k).unwrap());
        assert_eq!(rt.ref_count(k), Some(1));
        rt.release_value(k);
        rt.release_value(m);
    }

    #[test]
    fn array_buffer_bytes_go_through_the_table() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let before = rt.stats().bytes_in_use;
        let ab = ctx.new_array_buffer(&[1, 2, 3, 4]).unwrap();
        assert!(rt.stats().bytes_in_use >= before + 4);
        ctx.array_buffer_resize(ab, 16).unwrap();
        assert_eq!(ctx.array_buffer_len(ab).unwrap(), 16);
        rt.release_value(ab);
        assert_eq!(rt.stats().bytes_in_use, before);
    }

    #[test]
    fn attached_var_ref_joins_gc_on_detach() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let base = rt.live_cell_count();
        let vr = ctx.new_attached_var_ref(Value::Int(3)).unwrap();
        assert_eq!(rt.live_cell_count(), base);
        let owned = ctx.new_string("closed over").unwrap();
        ctx.detach_var_ref(vr, owned).unwrap();
        assert_eq!(rt.live_cell_count(), base + 1);
        rt.release_cell(vr);
        assert_eq!(rt.live_cell_count(), base);
        assert_eq!(rt.ref_count(owned), None);
    }

    #[test]
    fn native_function_binding_is_callable() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let dump = ctx
            .get_property(ctx.global(), ctx.atom("__gc_dump_objects").unwrap())
            .unwrap();
        assert!(matches!(dump, Value::Object(_)));
        rt.release_value(dump);
    }

    fn forty_two(
        _rt: &mut RuntimeState,
        _ctx: CellId,
        _this: Value,
        _args: &[Value],
    ) -> crate::GcResult<Value> {
        Ok(Value::Int(42))
    }

    #[test]
    fn native_call_dispatches() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let f = ctx.new_native_function("fortyTwo", forty_two).unwrap();
        let v = ctx.call(f, Value::Undefined, &[]).unwrap();
        assert_eq!(v, Value::Int(42));
        assert!(ctx.call(Value::Int(0), Value::Undefined, &[]).is_err());
        rt.release_value(f);
    }

    #[test]
    fn for_in_iterator_walks_keys() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let obj = ctx.new_object().unwrap();
        let x = ctx.atom("x").unwrap();
        let y = ctx.atom("y").unwrap();
        ctx.set_property(obj, x, Value::Int(1)).unwrap();
        ctx.set_property(obj, y, Value::Int(2)).unwrap();

        let it = ctx.new_for_in_iterator(obj).unwrap();
        assert_eq!(ctx.for_in_next(it).unwrap(), Some(x));
        assert_eq!(ctx.for_in_next(it).unwrap(), Some(y));
        assert_eq!(ctx.for_in_next(it).unwrap(), None);
        rt.release_value(it);
    }

    #[test]
    fn typed_array_views_retain_their_buffer() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let ab = ctx.new_array_buffer(&[0u8; 8]).unwrap();
        let ta = ctx.new_typed_array(ab, 0, 8).unwrap();
        assert_eq!(ctx.typed_array_range(ta).unwrap(), (0, 8));
        assert_eq!(rt.ref_count(ab), Some(2));
        rt.release_value(ab);
        assert_eq!(rt.ref_count(ab), Some(1));
        rt.release_value(ta);
        assert_eq!(rt.ref_count(ab), None);
    }

    #[test]
    fn boxed_and_regexp_payloads_release_cleanly() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let base = rt.live_cell_count();

        let s = ctx.new_string("wrapped").unwrap();
        let boxed = ctx.new_boxed(ClassId::STRING, s).unwrap();
        let re = ctx.new_regexp("a+b").unwrap();
        let set = ctx.new_set().unwrap();
        let member = ctx.new_object().unwrap();
        rt.retain_value(member);
        ctx.map_set(set, member, Value::Undefined).unwrap();
        rt.release_value(member);

        rt.release_value(boxed);
        rt.release_value(re);
        rt.release_value(set);
        assert_eq!(rt.live_cell_count(), base);
        assert_eq!(rt.ref_count(s), None);
    }

    #[test]
    fn oom_latches_pending_error_on_context() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        rt.set_memory_limit(rt.stats().bytes_in_use + 8);
        let err = ctx.new_string("definitely larger than eight bytes");
        assert!(err.is_err());
        assert!(ctx.take_pending_error().is_some());
        assert!(ctx.take_pending_error().is_none());
    }
}
