//! szl-core: the value system and heap of the szl runtime
//!
//! Key design principles:
//! - Val: one tagged machine word: smi, heap pointer, or null (undefined)
//! - Form: per-type operation table reached through every value header
//! - Heap: refcounted chunked arena with sliding compaction and pointer
//!   fix-up; read-only values are recognized by a sentinel refcount and
//!   never move

pub mod fingerprint;
pub mod form;
pub mod heap;
pub mod map;
pub mod tagged;
pub mod types;
pub mod val;

// Re-export the types nearly every consumer needs.
pub use heap::{Alloc, Heap, Relocation, StaticHeap};
pub use map::SzlMap;
pub use tagged::Val;
pub use types::{FieldSpec, ProtoEncoding, Type, TypeKind, TypeRef, Universe, universe};
pub use val::{InitMode, NullEnv, ValEnv};
