//! Hybrid reference-counted heap for a JavaScript-like runtime.
//!
//! Reference counting reclaims the acyclic majority of cells
//! deterministically; a synchronous trial-deletion cycle collector
//! reclaims the rest. The crate also ships a heap-snapshot writer that
//! emits browser-inspector-compatible `.heapsnapshot` files and a
//! memory-usage walker for accounting reports.

pub mod alloc;
pub mod collector;
pub mod context;
pub mod error;
pub mod object;
mod registry;
pub mod runtime;
pub mod snapshot;
pub mod trace;
pub mod usage;
pub mod value;

pub use alloc::{MallocState, MemoryFuncs};
pub use context::Context;
pub use error::GcError;
pub use object::{
    CellKind, ClassDef, ClassFinalizer, ClassId, ClassSnapshotWalker, ClassTracer, JsObject,
    NativeFn,
};
pub use runtime::{GC_THRESHOLD_DISABLED, Runtime, RuntimeState, RuntimeStats, debug_flags};
pub use trace::{EdgeLabel, SnapTarget};
pub use usage::MemoryUsage;
pub use value::{Atom, CellId, StringId, Value};

pub type GcResult<T> = Result<T, GcError>;
