//! Runtime core: cell lifecycle, reference counting, strings, atoms,
//! shapes, weak references and the embedder-facing `Runtime` facade.

use std::mem;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use crate::GcResult;
use crate::alloc::{Allocator, MemBuf, MemoryFuncs};
use crate::context::Context;
use crate::error::GcError;
use crate::object::{
    CellData, CellKind, ClassDef, ClassEntry, ClassId, GcCell, JsObject, ListTag, MapState,
    ObjectPayload, Property, Shape, ShapeProperty, VarRef, WeakRecord, WeakRecordId,
};
use crate::registry::Registry;
use crate::value::{Atom, CellId, PREDEFINED_ATOMS, StringId, Value};

/// Debug flag bits for [`Runtime::set_debug_flags`].
pub mod debug_flags {
    /// Report every collection on stderr.
    pub const DUMP_GC: u32 = 1 << 0;
    /// Report cells reclaimed by the cycle sweep.
    pub const DUMP_GC_FREE: u32 = 1 << 1;
    /// Collect on every allocation.
    pub const FORCE_GC_AT_ALLOC: u32 = 1 << 2;
}

/// Sentinel for [`Runtime::set_gc_threshold`] that disables automatic
/// collection.
pub const GC_THRESHOLD_DISABLED: usize = usize::MAX;

const DEFAULT_GC_THRESHOLD: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcPhase {
    Idle,
    Decref,
    RemoveCycles,
}

pub(crate) struct JsString {
    pub ref_count: u32,
    pub buf: MemBuf,
}

#[derive(Debug, Clone)]
pub struct RuntimeStats {
    pub collections: usize,
    pub collected: usize,
    pub live_cells: usize,
    pub bytes_in_use: usize,
}

pub struct RuntimeState {
    pub(crate) allocator: Allocator,
    pub(crate) gc_threshold: usize,
    pub(crate) registry: Registry,
    pub(crate) phase: GcPhase,
    pub(crate) strings: Vec<Option<JsString>>,
    string_free: Vec<u32>,
    pub(crate) atoms: Vec<Box<str>>,
    atom_hash: FxHashMap<Box<str>, Atom>,
    pub(crate) classes: Vec<ClassEntry>,
    pub(crate) shape_hash: FxHashMap<u64, Vec<CellId>>,
    pub(crate) contexts: Vec<CellId>,
    pub(crate) weak_records: Vec<Option<WeakRecord>>,
    weak_free: Vec<u32>,
    pub(crate) debug_flags: u32,
    pub(crate) collections: usize,
    pub(crate) collected_total: usize,
}

impl RuntimeState {
    pub(crate) fn new(funcs: MemoryFuncs) -> Self {
        let mut state = Self {
            allocator: Allocator::new(funcs),
            gc_threshold: DEFAULT_GC_THRESHOLD,
            registry: Registry::new(),
            phase: GcPhase::Idle,
            strings: Vec::new(),
            string_free: Vec::new(),
            atoms: Vec::new(),
            atom_hash: FxHashMap::default(),
            classes: Vec::new(),
            shape_hash: FxHashMap::default(),
            contexts: Vec::new(),
            weak_records: Vec::new(),
            weak_free: Vec::new(),
            debug_flags: 0,
            collections: 0,
            collected_total: 0,
        };
        for s in PREDEFINED_ATOMS {
            let atom = Atom(state.atoms.len() as u32);
            state.atoms.push((*s).into());
            state.atom_hash.insert((*s).into(), atom);
        }
        state.init_std_classes();
        state
    }

    // -- accessors ---------------------------------------------------------

    pub(crate) fn cell(&self, id: CellId) -> &GcCell {
        self.registry.cell(id)
    }

    pub(crate) fn cell_mut(&mut self, id: CellId) -> &mut GcCell {
        self.registry.cell_mut(id)
    }

    pub(crate) fn object(&self, id: CellId) -> &JsObject {
        match &self.cell(id).data {
            CellData::Object(p) => p,
            _ => panic!("cell {:?} is not an object", id),
        }
    }

    pub(crate) fn object_mut(&mut self, id: CellId) -> &mut JsObject {
        match &mut self.cell_mut(id).data {
            CellData::Object(p) => p,
            _ => panic!("cell {:?} is not an object", id),
        }
    }

    pub(crate) fn shape(&self, id: CellId) -> &Shape {
        match &self.cell(id).data {
            CellData::Shape(s) => s,
            _ => panic!("cell {:?} is not a shape", id),
        }
    }

    pub(crate) fn var_ref(&self, id: CellId) -> &VarRef {
        match &self.cell(id).data {
            CellData::VarRef(v) => v,
            _ => panic!("cell {:?} is not a var-ref", id),
        }
    }

    pub(crate) fn var_ref_mut(&mut self, id: CellId) -> &mut VarRef {
        match &mut self.cell_mut(id).data {
            CellData::VarRef(v) => v,
            _ => panic!("cell {:?} is not a var-ref", id),
        }
    }

    pub(crate) fn string(&self, id: StringId) -> &JsString {
        match self.strings[id.0 as usize].as_ref() {
            Some(s) => s,
            None => panic!("dead string {:?}", id),
        }
    }

    pub(crate) fn string_str(&self, id: StringId) -> &str {
        self.string(id).buf.as_str()
    }

    pub(crate) fn weak_record(&self, id: WeakRecordId) -> &WeakRecord {
        match self.weak_records[id.0 as usize].as_ref() {
            Some(r) => r,
            None => panic!("dead weak record {:?}", id),
        }
    }

    pub(crate) fn atom_str(&self, a: Atom) -> &str {
        &self.atoms[a.0 as usize]
    }

    // -- atoms -------------------------------------------------------------

    pub(crate) fn intern_atom(&mut self, s: &str) -> GcResult<Atom> {
        if let Some(a) = self.atom_hash.get(s) {
            return Ok(*a);
        }
        let size = s.len() + mem::size_of::<Box<str>>();
        self.maybe_trigger_gc(size);
        match self.allocator.charge(size) {
            Ok(()) => {}
            Err(_) if self.phase == GcPhase::Idle => {
                self.run_gc();
                self.allocator.charge(size).map_err(|_| GcError::OutOfMemory)?;
            }
            Err(e) => return Err(e),
        }
        let atom = Atom(self.atoms.len() as u32);
        self.atoms.push(s.into());
        self.atom_hash.insert(s.into(), atom);
        Ok(atom)
    }

    // -- strings -----------------------------------------------------------

    pub(crate) fn new_string_id(&mut self, s: &str) -> GcResult<StringId> {
        self.maybe_trigger_gc(s.len());
        let buf = match self.allocator.strdup(s) {
            Ok(buf) => buf,
            Err(_) if self.phase == GcPhase::Idle => {
                // retry once after a forced collection
                self.run_gc();
                self.allocator.strdup(s).map_err(|_| GcError::OutOfMemory)?
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = self.allocator.charge(mem::size_of::<JsString>()) {
            self.allocator.free_buf(buf);
            return Err(e);
        }
        let string = JsString { ref_count: 1, buf };
        let id = if let Some(idx) = self.string_free.pop() {
            self.strings[idx as usize] = Some(string);
            StringId(idx)
        } else {
            self.strings.push(Some(string));
            StringId((self.strings.len() - 1) as u32)
        };
        Ok(id)
    }

    /// Raw buffer allocation with the standard trigger and one forced
    /// collection retry on failure.
    pub(crate) fn alloc_buf_with_retry(&mut self, len: usize, zeroed: bool) -> GcResult<MemBuf> {
        self.maybe_trigger_gc(len);
        let alloc = |a: &mut Allocator| {
            if zeroed {
                a.alloc_buf_zeroed(len)
            } else {
                a.alloc_buf(len)
            }
        };
        match alloc(&mut self.allocator) {
            Ok(buf) => Ok(buf),
            Err(_) if self.phase == GcPhase::Idle => {
                self.run_gc();
                alloc(&mut self.allocator).map_err(|_| GcError::OutOfMemory)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn retain_string(&mut self, id: StringId) {
        match self.strings[id.0 as usize].as_mut() {
            Some(s) => s.ref_count += 1,
            None => panic!("dead string {:?}", id),
        }
    }

    pub(crate) fn release_string(&mut self, id: StringId) {
        let dead = {
            let s = match self.strings[id.0 as usize].as_mut() {
                Some(s) => s,
                None => panic!("dead string {:?}", id),
            };
            debug_assert!(s.ref_count > 0);
            s.ref_count -= 1;
            s.ref_count == 0
        };
        if dead {
            let s = self.strings[id.0 as usize].take();
            if let Some(s) = s {
                self.allocator.free_buf(s.buf);
                self.allocator.discharge(mem::size_of::<JsString>());
            }
            self.string_free.push(id.0);
        }
    }

    // -- values ------------------------------------------------------------

    pub(crate) fn retain_value(&mut self, v: Value) {
        match v {
            Value::String(id) => self.retain_string(id),
            Value::Object(id) | Value::Bytecode(id) => self.retain_cell(id),
            _ => {}
        }
    }

    pub(crate) fn release_value(&mut self, v: Value) {
        match v {
            Value::String(id) => self.release_string(id),
            Value::Object(id) | Value::Bytecode(id) => self.release_cell(id),
            _ => {}
        }
    }

    // -- cell lifecycle ----------------------------------------------------

    /// Create a cell and (unless it is an attached var-ref) register it on
    /// the live list.
    pub(crate) fn new_cell(&mut self, data: CellData, register: bool) -> GcResult<CellId> {
        let size = data.struct_size();
        self.maybe_trigger_gc(size);
        match self.allocator.charge(size) {
            Ok(()) => {}
            Err(_) if self.phase == GcPhase::Idle => {
                self.run_gc();
                self.allocator.charge(size).map_err(|_| GcError::OutOfMemory)?;
            }
            Err(e) => return Err(e),
        }
        let id = self.registry.insert(data);
        if register {
            self.registry.push_back(ListTag::Live, id);
        }
        Ok(id)
    }

    pub(crate) fn retain_cell(&mut self, id: CellId) {
        self.cell_mut(id).header.ref_count += 1;
    }

    /// Drop one strong reference. Objects and bytecode reaching zero are
    /// staged on the pending-free list and drained when the collector is
    /// idle; the other cell kinds are freed in place by their own paths.
    pub(crate) fn release_cell(&mut self, id: CellId) {
        let kind = {
            let h = &mut self.cell_mut(id).header;
            debug_assert!(h.ref_count > 0, "refcount underflow on {:?}", id);
            h.ref_count -= 1;
            if h.ref_count > 0 {
                return;
            }
            h.kind
        };
        match kind {
            CellKind::Object | CellKind::FunctionBytecode => {
                if self.phase != GcPhase::RemoveCycles {
                    self.registry.unlink(id);
                    self.registry.push_front(ListTag::PendingFree, id);
                    if self.phase == GcPhase::Idle {
                        self.free_zero_refcount();
                    }
                }
                // during the cycle sweep the cell is already owned by the
                // collector; leave it where it is
            }
            CellKind::VarRef => self.free_var_ref(id),
            CellKind::Shape => self.free_shape(id),
            CellKind::Context => self.free_context(id),
            CellKind::AsyncFunction => self.free_async_state(id),
        }
    }

    /// Iterative drain of the pending-free list. The phase flag makes any
    /// re-entrant release stage its cell instead of recursing.
    pub(crate) fn free_zero_refcount(&mut self) {
        debug_assert_eq!(self.phase, GcPhase::Idle);
        self.phase = GcPhase::Decref;
        while let Some(id) = self.registry.first(ListTag::PendingFree) {
            debug_assert_eq!(self.cell(id).header.ref_count, 0);
            self.free_gc_object(id);
        }
        self.phase = GcPhase::Idle;
    }

    /// Sole dispatch point for reclaiming an object or bytecode cell.
    /// Called from the zero-refcount drain, the cycle sweep and runtime
    /// teardown.
    pub(crate) fn free_gc_object(&mut self, id: CellId) {
        match self.cell(id).header.kind {
            CellKind::Object => self.free_object(id),
            CellKind::FunctionBytecode => self.free_function_bytecode(id),
            kind => panic!("free_gc_object on {:?} cell", kind),
        }
    }

    fn free_object(&mut self, id: CellId) {
        let (props, shape) = {
            let obj = self.object_mut(id);
            // zombie flag: the object stays observable while cycles are
            // being freed
            obj.free_mark = true;
            (mem::take(&mut obj.props), obj.shape.take())
        };
        let prop_cap = props.capacity() * mem::size_of::<Property>();
        for prop in props {
            self.free_property(prop);
        }
        let _ = self.allocator.recharge(prop_cap, 0);
        if let Some(sh) = shape {
            self.release_cell(sh);
        }
        if self.object(id).first_weak_ref.is_some() {
            self.reset_weak_ref(id);
        }
        let class_id = self.object(id).class_id;
        if let Some(finalizer) = self.classes[class_id.index()].def.finalizer {
            finalizer(self, id);
        }
        // fail safe
        self.object_mut(id).payload = ObjectPayload::None;
        self.registry.unlink(id);
        if self.phase == GcPhase::RemoveCycles && self.cell(id).header.ref_count != 0 {
            // a finalizer re-acquired the zombie; keep the storage until
            // the sweep finishes
            self.registry.push_back(ListTag::PendingFree, id);
        } else {
            self.free_cell_storage(id);
        }
    }

    fn free_function_bytecode(&mut self, id: CellId) {
        let (cpool, realm, debug, extra) = {
            let b = match &mut self.cell_mut(id).data {
                CellData::Bytecode(b) => b,
                _ => panic!("not bytecode"),
            };
            let extra = b.byte_code.capacity() + b.cpool.capacity() * mem::size_of::<Value>();
            (
                mem::take(&mut b.cpool),
                b.realm.take(),
                b.debug.take(),
                extra,
            )
        };
        for v in cpool {
            self.release_value(v);
        }
        if let Some(realm) = realm {
            self.release_cell(realm);
        }
        if let Some(debug) = debug {
            let _ = self
                .allocator
                .recharge(debug.pc2line.capacity(), 0);
            if let Some(src) = debug.source {
                self.release_string(src);
            }
        }
        let _ = self.allocator.recharge(extra, 0);
        self.registry.unlink(id);
        if self.phase == GcPhase::RemoveCycles && self.cell(id).header.ref_count != 0 {
            self.registry.push_back(ListTag::PendingFree, id);
        } else {
            self.free_cell_storage(id);
        }
    }

    fn free_property(&mut self, prop: Property) {
        match prop {
            Property::Value(v) => self.release_value(v),
            Property::GetSet { getter, setter } => {
                if let Some(g) = getter {
                    self.release_cell(g);
                }
                if let Some(s) = setter {
                    self.release_cell(s);
                }
            }
            Property::VarRef(vr) => self.release_cell(vr),
            Property::AutoInit { realm } => self.release_cell(realm),
        }
    }

    /// Return a cell's storage to the arena and the accounting.
    pub(crate) fn free_cell_storage(&mut self, id: CellId) {
        let cell = self.registry.remove(id);
        self.allocator.discharge(cell.data.struct_size());
        // raw payload buffers are freed by the finalizers; anything still
        // here is Rust-managed storage
        drop(cell);
    }

    fn free_var_ref(&mut self, id: CellId) {
        let (value, detached) = {
            let vr = self.var_ref(id);
            (vr.value, vr.detached)
        };
        if detached {
            self.release_value(value);
        }
        // an attached var-ref aliases a stack slot; the frame owns the value
        self.registry.unlink(id);
        self.free_cell_storage(id);
    }

    fn free_shape(&mut self, id: CellId) {
        let (proto, hashed, hash) = {
            let sh = self.shape(id);
            (sh.proto, sh.hashed, sh.hash)
        };
        if hashed {
            if let Some(chain) = self.shape_hash.get_mut(&hash) {
                chain.retain(|&s| s != id);
                if chain.is_empty() {
                    self.shape_hash.remove(&hash);
                }
            }
        }
        if let Some(p) = proto {
            self.release_cell(p);
        }
        self.registry.unlink(id);
        self.free_cell_storage(id);
    }

    fn free_context(&mut self, id: CellId) {
        let ctx = {
            match &mut self.cell_mut(id).data {
                CellData::Context(c) => mem::replace(&mut **c, crate::context::JsContext::empty()),
                _ => panic!("not a context"),
            }
        };
        for m in ctx.modules {
            for vr in m.export_vars {
                self.release_cell(vr);
            }
            self.release_value(m.module_ns);
            self.release_value(m.func_obj);
            self.release_value(m.eval_exception);
            self.release_value(m.meta_obj);
        }
        self.release_value(ctx.global_obj);
        self.release_value(ctx.global_var_obj);
        self.release_value(ctx.throw_type_error);
        self.release_value(ctx.eval_obj);
        self.release_value(ctx.array_proto_values);
        for v in ctx.native_error_protos {
            self.release_value(v);
        }
        for v in ctx.class_protos {
            self.release_value(v);
        }
        self.release_value(ctx.iterator_proto);
        self.release_value(ctx.async_iterator_proto);
        self.release_value(ctx.promise_ctor);
        self.release_value(ctx.array_ctor);
        self.release_value(ctx.regexp_ctor);
        self.release_value(ctx.function_ctor);
        self.release_value(ctx.function_proto);
        if let Some(sh) = ctx.array_shape {
            self.release_cell(sh);
        }
        self.contexts.retain(|&c| c != id);
        self.registry.unlink(id);
        self.free_cell_storage(id);
    }

    fn free_async_state(&mut self, id: CellId) {
        let (frame, resolving) = {
            match &mut self.cell_mut(id).data {
                CellData::AsyncFunction(s) => (mem::take(&mut s.frame), s.resolving_funcs),
                _ => panic!("not an async state"),
            }
        };
        for v in frame {
            self.release_value(v);
        }
        self.release_value(resolving[0]);
        self.release_value(resolving[1]);
        self.registry.unlink(id);
        self.free_cell_storage(id);
    }

    // -- weak references ---------------------------------------------------

    pub(crate) fn new_weak_record(
        &mut self,
        map: CellId,
        key: CellId,
        value: Value,
    ) -> GcResult<WeakRecordId> {
        let size = mem::size_of::<WeakRecord>();
        self.maybe_trigger_gc(size);
        match self.allocator.charge(size) {
            Ok(()) => {}
            Err(_) if self.phase == GcPhase::Idle => {
                self.run_gc();
                self.allocator.charge(size).map_err(|_| GcError::OutOfMemory)?;
            }
            Err(e) => return Err(e),
        }
        let next = self.object(key).first_weak_ref;
        let record = WeakRecord {
            map,
            key,
            value,
            next,
        };
        let id = if let Some(idx) = self.weak_free.pop() {
            self.weak_records[idx as usize] = Some(record);
            WeakRecordId(idx)
        } else {
            self.weak_records.push(Some(record));
            WeakRecordId((self.weak_records.len() - 1) as u32)
        };
        self.object_mut(key).first_weak_ref = Some(id);
        Ok(id)
    }

    pub(crate) fn free_weak_record_slot(&mut self, id: WeakRecordId) {
        if self.weak_records[id.0 as usize].take().is_some() {
            self.allocator.discharge(mem::size_of::<WeakRecord>());
            self.weak_free.push(id.0);
        }
    }

    /// Remove `rec` from `target`'s backlink chain without touching the
    /// record itself.
    pub(crate) fn unlink_weak_record_from(&mut self, target: CellId, rec: WeakRecordId) {
        let mut cur = self.object(target).first_weak_ref;
        let mut prev: Option<WeakRecordId> = None;
        while let Some(rid) = cur {
            let next = self.weak_record(rid).next;
            if rid == rec {
                match prev {
                    Some(p) => {
                        if let Some(r) = self.weak_records[p.0 as usize].as_mut() {
                            r.next = next;
                        }
                    }
                    None => self.object_mut(target).first_weak_ref = next,
                }
                return;
            }
            prev = cur;
            cur = next;
        }
    }

    /// Invalidate every weak-map record keyed by a dying object. Two
    /// passes: the records must all be unlinked from their maps before any
    /// value release can re-enter the registry.
    fn reset_weak_ref(&mut self, obj_id: CellId) {
        let mut cur = self.object(obj_id).first_weak_ref;
        while let Some(rid) = cur {
            let (map, key, next) = {
                let r = self.weak_record(rid);
                (r.map, r.key, r.next)
            };
            debug_assert_eq!(key, obj_id);
            if let ObjectPayload::Map(state) = &mut self.object_mut(map).payload {
                match &mut **state {
                    MapState::Weak(records) => {
                        records.remove(&key);
                    }
                    MapState::Strong(_) => debug_assert!(false, "weak record in strong map"),
                }
            }
            cur = next;
        }
        let mut cur = self.object(obj_id).first_weak_ref;
        while let Some(rid) = cur {
            let (value, next) = {
                let r = self.weak_record(rid);
                (r.value, r.next)
            };
            self.release_value(value);
            self.free_weak_record_slot(rid);
            cur = next;
        }
        self.object_mut(obj_id).first_weak_ref = None;
    }

    // -- shapes ------------------------------------------------------------

    fn shape_content_hash(proto: Option<CellId>, props: &[ShapeProperty]) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = FxHasher::default();
        proto.hash(&mut h);
        for p in props {
            p.atom.hash(&mut h);
            p.flags.hash(&mut h);
        }
        h.finish()
    }

    fn find_hashed_shape(
        &self,
        hash: u64,
        proto: Option<CellId>,
        props: &[ShapeProperty],
    ) -> Option<CellId> {
        let chain = self.shape_hash.get(&hash)?;
        for &id in chain {
            let sh = self.shape(id);
            if sh.proto == proto
                && sh.props.len() == props.len()
                && sh
                    .props
                    .iter()
                    .zip(props)
                    .all(|(a, b)| a.atom == b.atom && a.flags == b.flags)
            {
                return Some(id);
            }
        }
        None
    }

    /// Find or create the deduplicated shape for `(proto, props)`. The
    /// returned reference is owned by the caller; the hash table itself
    /// holds shapes weakly.
    pub(crate) fn intern_shape(
        &mut self,
        proto: Option<CellId>,
        props: Vec<ShapeProperty>,
    ) -> GcResult<CellId> {
        let hash = Self::shape_content_hash(proto, &props);
        if let Some(id) = self.find_hashed_shape(hash, proto, &props) {
            self.retain_cell(id);
            return Ok(id);
        }
        let shape = Shape {
            proto,
            props,
            hashed: true,
            hash,
        };
        let id = self.new_cell(CellData::Shape(Box::new(shape)), true)?;
        if let Some(p) = proto {
            self.retain_cell(p);
        }
        self.shape_hash.entry(hash).or_default().push(id);
        Ok(id)
    }

    pub(crate) fn initial_shape(&mut self, proto: Option<CellId>) -> GcResult<CellId> {
        self.intern_shape(proto, Vec::new())
    }

    // -- properties --------------------------------------------------------

    pub(crate) fn find_own_prop(&self, obj_id: CellId, atom: Atom) -> Option<usize> {
        let obj = self.object(obj_id);
        let sh = self.shape(obj.shape?);
        sh.props.iter().position(|p| p.atom == atom)
    }

    /// Extend the object with one slot, transitioning its shape. The
    /// property payload is consumed even on failure.
    fn add_prop_slot(&mut self, obj_id: CellId, atom: Atom, prop: Property) -> GcResult<()> {
        let old_shape = match self.object(obj_id).shape {
            Some(s) => s,
            None => {
                self.free_property(prop);
                return Err(GcError::DeadCell);
            }
        };
        let mut props = self.shape(old_shape).props.clone();
        let proto = self.shape(old_shape).proto;
        props.push(ShapeProperty {
            atom,
            flags: crate::object::PROP_ENUMERABLE,
        });
        let new_shape = match self.intern_shape(proto, props) {
            Ok(s) => s,
            Err(e) => {
                self.free_property(prop);
                return Err(e);
            }
        };
        // grow the slot array before swapping shapes so a failed resize
        // leaves the object consistent
        let needed = self.object(obj_id).props.len() + 1;
        if needed > self.object(obj_id).props.capacity() {
            let mut vec = mem::take(&mut self.object_mut(obj_id).props);
            let r = self.allocator.realloc_array(&mut vec, needed);
            self.object_mut(obj_id).props = vec;
            if let Err(e) = r {
                self.release_cell(new_shape);
                self.free_property(prop);
                return Err(e);
            }
        }
        self.object_mut(obj_id).shape = Some(new_shape);
        self.release_cell(old_shape);
        self.object_mut(obj_id).props.push(prop);
        Ok(())
    }

    fn replace_prop_slot(&mut self, obj_id: CellId, idx: usize, prop: Property) {
        let old = mem::replace(&mut self.object_mut(obj_id).props[idx], prop);
        self.free_property(old);
    }

    /// Store a value property. Consumes the caller's reference on `value`.
    pub(crate) fn set_property(&mut self, obj_id: CellId, atom: Atom, value: Value) -> GcResult<()> {
        match self.find_own_prop(obj_id, atom) {
            Some(idx) => {
                self.replace_prop_slot(obj_id, idx, Property::Value(value));
                Ok(())
            }
            None => self.add_prop_slot(obj_id, atom, Property::Value(value)),
        }
    }

    /// Define a getter/setter pair. Consumes the references.
    pub(crate) fn set_property_getset(
        &mut self,
        obj_id: CellId,
        atom: Atom,
        getter: Option<CellId>,
        setter: Option<CellId>,
    ) -> GcResult<()> {
        let prop = Property::GetSet { getter, setter };
        match self.find_own_prop(obj_id, atom) {
            Some(idx) => {
                self.replace_prop_slot(obj_id, idx, prop);
                Ok(())
            }
            None => self.add_prop_slot(obj_id, atom, prop),
        }
    }

    /// Store a captured-variable property. Consumes the var-ref reference.
    pub(crate) fn set_property_var_ref(
        &mut self,
        obj_id: CellId,
        atom: Atom,
        var_ref: CellId,
    ) -> GcResult<()> {
        let prop = Property::VarRef(var_ref);
        match self.find_own_prop(obj_id, atom) {
            Some(idx) => {
                self.replace_prop_slot(obj_id, idx, prop);
                Ok(())
            }
            None => self.add_prop_slot(obj_id, atom, prop),
        }
    }

    pub(crate) fn set_property_autoinit(
        &mut self,
        obj_id: CellId,
        atom: Atom,
        realm: CellId,
    ) -> GcResult<()> {
        let prop = Property::AutoInit { realm };
        match self.find_own_prop(obj_id, atom) {
            Some(idx) => {
                self.replace_prop_slot(obj_id, idx, prop);
                Ok(())
            }
            None => self.add_prop_slot(obj_id, atom, prop),
        }
    }

    /// Own value property, without retaining. Getter/setter and var-ref
    /// slots read as absent.
    pub(crate) fn get_own_property(&self, obj_id: CellId, atom: Atom) -> Option<Value> {
        let idx = self.find_own_prop(obj_id, atom)?;
        match &self.object(obj_id).props[idx] {
            Property::Value(v) => Some(*v),
            Property::VarRef(vr) => Some(self.var_ref(*vr).value),
            _ => None,
        }
    }

    /// Property lookup along the prototype chain. The result is retained.
    pub(crate) fn get_property(&mut self, obj_id: CellId, atom: Atom) -> Option<Value> {
        let mut cur = Some(obj_id);
        while let Some(id) = cur {
            if let Some(v) = self.get_own_property(id, atom) {
                self.retain_value(v);
                return Some(v);
            }
            cur = self
                .object(id)
                .shape
                .and_then(|sh| self.shape(sh).proto);
        }
        None
    }

    // -- classes -----------------------------------------------------------

    fn init_std_classes(&mut self) {
        use crate::trace::*;
        let defs: Vec<ClassDef> = vec![
            ClassDef {
                name: "Object",
                finalizer: None,
                tracer: None,
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "Array",
                finalizer: Some(crate::context::js_array_finalizer),
                tracer: Some(js_array_trace),
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "Error",
                finalizer: None,
                tracer: None,
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "Number",
                finalizer: Some(crate::context::js_object_data_finalizer),
                tracer: Some(js_object_data_trace),
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "String",
                finalizer: Some(crate::context::js_object_data_finalizer),
                tracer: Some(js_object_data_trace),
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "Boolean",
                finalizer: Some(crate::context::js_object_data_finalizer),
                tracer: Some(js_object_data_trace),
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "Function",
                finalizer: Some(crate::context::js_c_function_finalizer),
                tracer: Some(js_c_function_trace),
                snapshot_walker: Some(js_c_function_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "Function",
                finalizer: Some(crate::context::js_closure_finalizer),
                tracer: Some(js_closure_trace),
                snapshot_walker: Some(js_closure_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "Function",
                finalizer: Some(crate::context::js_bound_function_finalizer),
                tracer: Some(js_bound_function_trace),
                snapshot_walker: Some(js_bound_function_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "RegExp",
                finalizer: Some(crate::context::js_regexp_finalizer),
                tracer: None,
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "Map",
                finalizer: Some(crate::context::js_map_finalizer),
                tracer: Some(js_map_trace),
                snapshot_walker: Some(js_map_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "Set",
                finalizer: Some(crate::context::js_map_finalizer),
                tracer: Some(js_map_trace),
                snapshot_walker: Some(js_map_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "WeakMap",
                finalizer: Some(crate::context::js_map_finalizer),
                tracer: Some(js_map_trace),
                snapshot_walker: Some(js_map_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "WeakSet",
                finalizer: Some(crate::context::js_map_finalizer),
                tracer: Some(js_map_trace),
                snapshot_walker: Some(js_map_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "ArrayBuffer",
                finalizer: Some(crate::context::js_array_buffer_finalizer),
                tracer: None,
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "TypedArray",
                finalizer: Some(crate::context::js_typed_array_finalizer),
                tracer: Some(js_typed_array_trace),
                snapshot_walker: None,
                opaque_size: 0,
            },
            ClassDef {
                name: "ForInIterator",
                finalizer: Some(crate::context::js_for_in_iterator_finalizer),
                tracer: Some(js_for_in_iterator_trace),
                snapshot_walker: Some(js_for_in_iterator_walk),
                opaque_size: 0,
            },
            ClassDef {
                name: "Proxy",
                finalizer: Some(crate::context::js_proxy_finalizer),
                tracer: Some(js_proxy_trace),
                snapshot_walker: Some(js_proxy_walk),
                opaque_size: 0,
            },
        ];
        debug_assert_eq!(defs.len(), ClassId::STD_COUNT);
        for def in defs {
            // predefined atoms plus class names are interned before any
            // allocation can fail meaningfully
            let name_atom = match self.intern_atom(def.name) {
                Ok(a) => a,
                Err(_) => Atom::EMPTY,
            };
            self.classes.push(ClassEntry { def, name_atom });
        }
    }

    pub(crate) fn register_class(&mut self, def: ClassDef) -> GcResult<ClassId> {
        let name_atom = self.intern_atom(def.name)?;
        let id = ClassId(self.classes.len() as u16);
        self.classes.push(ClassEntry { def, name_atom });
        // contexts carry a prototype slot per class
        let ctxs: Vec<CellId> = self.contexts.clone();
        for ctx in ctxs {
            if let CellData::Context(c) = &mut self.cell_mut(ctx).data {
                c.class_protos.push(Value::Undefined);
            }
        }
        Ok(id)
    }

    // -- GC trigger --------------------------------------------------------

    pub(crate) fn maybe_trigger_gc(&mut self, size: usize) {
        if self.phase != GcPhase::Idle {
            return;
        }
        let force = self.debug_flags & debug_flags::FORCE_GC_AT_ALLOC != 0;
        if !force {
            if self.gc_threshold == GC_THRESHOLD_DISABLED {
                return;
            }
            if self.allocator.bytes_in_use() + size <= self.gc_threshold {
                return;
            }
        }
        if self.debug_flags & debug_flags::DUMP_GC != 0 {
            eprintln!("GC: size={}", self.allocator.bytes_in_use());
        }
        self.run_gc();
        let in_use = self.allocator.bytes_in_use();
        self.gc_threshold = in_use + in_use / 2;
    }

    pub(crate) fn is_live_object(&self, v: Value) -> bool {
        match v {
            Value::Object(id) => self.registry.contains(id) && !self.object(id).free_mark,
            _ => false,
        }
    }

    pub(crate) fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            collections: self.collections,
            collected: self.collected_total,
            live_cells: self.registry.len(ListTag::Live),
            bytes_in_use: self.allocator.bytes_in_use(),
        }
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        // orderly teardown: run the real destructors for objects and
        // bytecode so finalizers return their raw buffers through the
        // function table, then sweep whatever storage remains
        self.phase = GcPhase::RemoveCycles;
        let ids: Vec<CellId> = self
            .registry
            .iter(ListTag::Live)
            .filter(|&id| {
                matches!(
                    self.cell(id).header.kind,
                    CellKind::Object | CellKind::FunctionBytecode
                )
            })
            .collect();
        for id in ids {
            if self.registry.contains(id) && self.cell(id).header.list == ListTag::Live {
                self.free_gc_object(id);
            }
        }
        let cells = self.registry.drain_cells();
        for cell in cells {
            if let CellData::Object(p) = cell.data {
                if let ObjectPayload::ArrayBuffer(ab) = p.payload {
                    self.allocator.free_buf(ab.data);
                }
            }
        }
        let strings = mem::take(&mut self.strings);
        for s in strings.into_iter().flatten() {
            self.allocator.free_buf(s.buf);
        }
    }
}

// -- embedder facade --------------------------------------------------------

/// Shared handle to one runtime. All operations serialize on an internal
/// lock; execution inside the lock is strictly single-threaded.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) state: Arc<RwLock<RuntimeState>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_memory_funcs(MemoryFuncs::default())
    }

    pub fn with_memory_funcs(funcs: MemoryFuncs) -> Self {
        Self {
            state: Arc::new(RwLock::new(RuntimeState::new(funcs))),
        }
    }

    /// Force a full collection. Returns the number of cells reclaimed.
    pub fn run_gc(&self) -> usize {
        self.state.write().run_gc()
    }

    /// Set the automatic-GC watermark. [`GC_THRESHOLD_DISABLED`] disables
    /// allocation-driven collection.
    pub fn set_gc_threshold(&self, bytes: usize) {
        self.state.write().gc_threshold = bytes;
    }

    pub fn set_memory_limit(&self, bytes: usize) {
        self.state.write().allocator.state.malloc_limit = bytes;
    }

    pub fn set_debug_flags(&self, flags: u32) {
        self.state.write().debug_flags = flags;
    }

    pub fn stats(&self) -> RuntimeStats {
        self.state.read().stats()
    }

    /// Number of cells currently on the live list.
    pub fn live_cell_count(&self) -> usize {
        self.state.read().registry.len(ListTag::Live)
    }

    pub fn new_context(&self) -> GcResult<Context> {
        Context::new(self.clone())
    }

    pub fn register_class(&self, def: ClassDef) -> GcResult<ClassId> {
        self.state.write().register_class(def)
    }

    pub fn new_string(&self, s: &str) -> GcResult<Value> {
        Ok(Value::String(self.state.write().new_string_id(s)?))
    }

    /// The text of a string value, if it is one.
    pub fn value_to_string(&self, v: Value) -> Option<String> {
        match v {
            Value::String(id) => Some(self.state.read().string_str(id).to_owned()),
            _ => None,
        }
    }

    pub fn retain_value(&self, v: Value) {
        self.state.write().retain_value(v);
    }

    pub fn release_value(&self, v: Value) {
        self.state.write().release_value(v);
    }

    pub fn retain_cell(&self, id: CellId) {
        self.state.write().retain_cell(id);
    }

    pub fn release_cell(&self, id: CellId) {
        self.state.write().release_cell(id);
    }

    /// False for non-objects and for zombie objects visible to finalizers
    /// while cycles are being freed.
    pub fn is_live_object(&self, v: Value) -> bool {
        self.state.read().is_live_object(v)
    }

    pub fn compute_memory_usage(&self) -> crate::usage::MemoryUsage {
        crate::usage::compute_memory_usage(&self.state.read())
    }

    pub fn dump_memory_usage(
        &self,
        w: &mut dyn std::io::Write,
        usage: &crate::usage::MemoryUsage,
    ) -> std::io::Result<()> {
        crate::usage::dump_memory_usage(w, usage, &self.state.read())
    }

    /// Reference count of a value's cell; test and diagnostics hook.
    pub fn ref_count(&self, v: Value) -> Option<u32> {
        let state = self.state.read();
        match v {
            Value::Object(id) | Value::Bytecode(id) => {
                if state.registry.contains(id) {
                    Some(state.cell(id).header.ref_count)
                } else {
                    None
                }
            }
            Value::String(id) => state.strings[id.0 as usize]
                .as_ref()
                .map(|s| s.ref_count),
            _ => None,
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
