//! GC cell layout: the shared header, the six cell kinds and the per-class
//! object payloads.

use rustc_hash::FxHashMap;

use crate::GcResult;
use crate::alloc::MemBuf;
use crate::context::JsContext;
use crate::runtime::RuntimeState;
use crate::trace::{EdgeLabel, SnapTarget};
use crate::value::{Atom, CellId, MapKey, StringId, Value};

/// Which registry list currently owns a cell. `Detached` covers cells that
/// are alive but not registered (attached var-refs) and cells mid-splice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListTag {
    Detached,
    Live,
    Tentative,
    PendingFree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Object,
    FunctionBytecode,
    VarRef,
    AsyncFunction,
    Shape,
    Context,
}

/// Header shared by every GC cell. `mark` is only nonzero inside a
/// collection; the link fields thread the cell onto its registry list.
#[derive(Debug)]
pub(crate) struct GcHeader {
    pub ref_count: u32,
    pub mark: u8,
    pub kind: CellKind,
    pub list: ListTag,
    pub prev: Option<CellId>,
    pub next: Option<CellId>,
}

impl GcHeader {
    pub(crate) fn new(kind: CellKind) -> Self {
        Self {
            ref_count: 1,
            mark: 0,
            kind,
            list: ListTag::Detached,
            prev: None,
            next: None,
        }
    }
}

pub(crate) struct GcCell {
    pub header: GcHeader,
    pub data: CellData,
}

pub(crate) enum CellData {
    Object(Box<JsObject>),
    Bytecode(Box<FunctionBytecode>),
    VarRef(VarRef),
    AsyncFunction(Box<AsyncFunctionState>),
    Shape(Box<Shape>),
    Context(Box<JsContext>),
}

impl CellData {
    pub(crate) fn kind(&self) -> CellKind {
        match self {
            CellData::Object(_) => CellKind::Object,
            CellData::Bytecode(_) => CellKind::FunctionBytecode,
            CellData::VarRef(_) => CellKind::VarRef,
            CellData::AsyncFunction(_) => CellKind::AsyncFunction,
            CellData::Shape(_) => CellKind::Shape,
            CellData::Context(_) => CellKind::Context,
        }
    }

    /// Structural size charged against the allocator accounting when the
    /// cell is created. Payload buffers (strings, array-buffer data) are
    /// charged separately by the function table.
    pub(crate) fn struct_size(&self) -> usize {
        let inner = match self {
            CellData::Object(_) => std::mem::size_of::<JsObject>(),
            CellData::Bytecode(_) => std::mem::size_of::<FunctionBytecode>(),
            CellData::VarRef(_) => 0,
            CellData::AsyncFunction(_) => std::mem::size_of::<AsyncFunctionState>(),
            CellData::Shape(_) => std::mem::size_of::<Shape>(),
            CellData::Context(_) => std::mem::size_of::<JsContext>(),
        };
        std::mem::size_of::<GcCell>() + inner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u16);

impl ClassId {
    pub const OBJECT: ClassId = ClassId(0);
    pub const ARRAY: ClassId = ClassId(1);
    pub const ERROR: ClassId = ClassId(2);
    pub const NUMBER: ClassId = ClassId(3);
    pub const STRING: ClassId = ClassId(4);
    pub const BOOLEAN: ClassId = ClassId(5);
    pub const C_FUNCTION: ClassId = ClassId(6);
    pub const BYTECODE_FUNCTION: ClassId = ClassId(7);
    pub const BOUND_FUNCTION: ClassId = ClassId(8);
    pub const REGEXP: ClassId = ClassId(9);
    pub const MAP: ClassId = ClassId(10);
    pub const SET: ClassId = ClassId(11);
    pub const WEAK_MAP: ClassId = ClassId(12);
    pub const WEAK_SET: ClassId = ClassId(13);
    pub const ARRAY_BUFFER: ClassId = ClassId(14);
    pub const TYPED_ARRAY: ClassId = ClassId(15);
    pub const FOR_IN_ITERATOR: ClassId = ClassId(16);
    pub const PROXY: ClassId = ClassId(17);

    pub(crate) const STD_COUNT: usize = 18;

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub type ClassFinalizer = fn(&mut RuntimeState, CellId);
pub type ClassTracer = fn(&RuntimeState, &JsObject, &mut dyn FnMut(CellId));
pub type ClassSnapshotWalker = fn(&RuntimeState, &JsObject, &mut dyn FnMut(SnapTarget, EdgeLabel));

/// Per-class descriptor. Hosts may register additional classes; the
/// finalizer must be infallible and must not allocate.
pub struct ClassDef {
    pub name: &'static str,
    pub finalizer: Option<ClassFinalizer>,
    pub tracer: Option<ClassTracer>,
    pub snapshot_walker: Option<ClassSnapshotWalker>,
    /// Size hint for opaque payloads, used by the memory-usage walker.
    pub opaque_size: usize,
}

pub(crate) struct ClassEntry {
    pub def: ClassDef,
    pub name_atom: Atom,
}

/// A property slot. The slot layout is described by the object's shape;
/// the object itself carries only the payloads, in shape order.
pub(crate) enum Property {
    Value(Value),
    GetSet {
        getter: Option<CellId>,
        setter: Option<CellId>,
    },
    VarRef(CellId),
    AutoInit {
        realm: CellId,
    },
}

pub(crate) const PROP_ENUMERABLE: u8 = 1 << 0;

#[derive(Debug, Clone)]
pub(crate) struct ShapeProperty {
    pub atom: Atom,
    pub flags: u8,
}

/// Hidden class: prototype edge plus the property table. Hashed shapes are
/// shared through the runtime's dedup table, which holds them weakly.
pub(crate) struct Shape {
    pub proto: Option<CellId>,
    pub props: Vec<ShapeProperty>,
    pub hashed: bool,
    pub hash: u64,
}

/// Captured-variable cell. Only detached var-refs are registered with the
/// GC; an attached one aliases a live frame slot and is traced through it.
pub(crate) struct VarRef {
    pub value: Value,
    pub detached: bool,
}

pub(crate) struct ClosureVarDef {
    pub name: Atom,
}

pub(crate) struct VarDef {
    pub name: Atom,
}

pub(crate) struct DebugInfo {
    pub filename: Atom,
    pub source: Option<StringId>,
    pub pc2line: Vec<u8>,
}

/// Compiled function. A first-class GC cell: template objects in the
/// constant pool can be part of reference cycles.
pub(crate) struct FunctionBytecode {
    pub func_name: Atom,
    pub cpool: Vec<Value>,
    pub closure_vars: Vec<ClosureVarDef>,
    pub vardefs: Vec<VarDef>,
    pub arg_count: u16,
    pub byte_code: Vec<u8>,
    pub realm: Option<CellId>,
    pub debug: Option<DebugInfo>,
}

pub(crate) struct AsyncFunctionState {
    pub active: bool,
    pub frame: Vec<Value>,
    pub resolving_funcs: [Value; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WeakRecordId(pub u32);

/// Weak-map entry. Owned by the map; the target object only indexes into
/// the chain through `first_weak_ref` so it can invalidate records when it
/// dies.
pub(crate) struct WeakRecord {
    pub map: CellId,
    pub key: CellId,
    pub value: Value,
    pub next: Option<WeakRecordId>,
}

pub(crate) enum MapState {
    Strong(FxHashMap<MapKey, MapEntry>),
    Weak(FxHashMap<CellId, WeakRecordId>),
}

impl MapState {
    pub(crate) fn is_weak(&self) -> bool {
        matches!(self, MapState::Weak(_))
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            MapState::Strong(m) => m.len(),
            MapState::Weak(m) => m.len(),
        }
    }
}

pub(crate) struct MapEntry {
    pub key: Value,
    pub value: Value,
}

pub(crate) struct ArrayBufferData {
    pub data: MemBuf,
}

pub(crate) struct TypedArrayData {
    pub buffer: Option<CellId>,
    pub offset: usize,
    pub length: usize,
}

pub(crate) struct BoundFunction {
    pub func_obj: Value,
    pub this_val: Value,
    pub args: Vec<Value>,
}

pub type NativeFn = fn(&mut RuntimeState, CellId, Value, &[Value]) -> GcResult<Value>;

pub(crate) struct NativeFunctionData {
    pub func: NativeFn,
    pub realm: Option<CellId>,
}

pub(crate) struct ClosureData {
    pub bytecode: Option<CellId>,
    pub home_object: Option<CellId>,
    pub var_refs: Vec<Option<CellId>>,
}

pub(crate) struct RegExpData {
    pub pattern: Option<StringId>,
    pub bytecode: Option<StringId>,
}

pub(crate) struct ForInIterator {
    pub obj: Value,
    pub keys: Vec<Atom>,
    pub idx: usize,
}

pub(crate) struct ProxyData {
    pub target: Value,
    pub handler: Value,
}

pub(crate) enum ObjectPayload {
    None,
    BoxedValue(Value),
    FastArray(Vec<Value>),
    ArrayBuffer(ArrayBufferData),
    TypedArray(TypedArrayData),
    Map(Box<MapState>),
    BoundFunction(Box<BoundFunction>),
    NativeFunction(NativeFunctionData),
    Closure(Box<ClosureData>),
    RegExp(RegExpData),
    ForInIterator(Box<ForInIterator>),
    Proxy(ProxyData),
}

impl Default for ObjectPayload {
    fn default() -> Self {
        ObjectPayload::None
    }
}

/// The dominant cell kind: a language object with a shape, parallel
/// property slots and a class payload. Opaque outside the crate; host
/// class hooks receive it by reference only.
pub struct JsObject {
    pub(crate) class_id: ClassId,
    pub(crate) shape: Option<CellId>,
    pub(crate) props: Vec<Property>,
    pub(crate) first_weak_ref: Option<WeakRecordId>,
    pub(crate) fast_array: bool,
    /// Set when destruction starts; zombie objects stay visible to
    /// finalizers while cycles are being freed.
    pub(crate) free_mark: bool,
    pub(crate) payload: ObjectPayload,
}

impl JsObject {
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }
}

impl JsObject {
    pub(crate) fn new(class_id: ClassId, shape: CellId) -> Self {
        Self {
            class_id,
            shape: Some(shape),
            props: Vec::new(),
            first_weak_ref: None,
            fast_array: false,
            free_mark: false,
            payload: ObjectPayload::None,
        }
    }
}
