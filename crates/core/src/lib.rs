//! Ember Core: tagged values, heap, GC and persistent collections
//!
//! This crate is the language-agnostic foundation the rest of the Ember
//! workspace builds on: a safe tagged `Value`, a precise mark/sweep heap
//! with scoped-root tracking, and the persistent collections (HAMT,
//! vector, list, array-map/set, byte array) every other crate assumes.
//!
//! # Modules
//!
//! - `sym`: interned symbols and keywords
//! - `value`: the tagged `Value` enum, plus hashing/equality
//! - `heap`: the allocation arena, mark/sweep GC, and RAII root guards
//! - `payload`: the per-entity heap object shapes
//! - `collections`: HAMT, persistent vector, list, array-map/set, byte array
//! - `bytecode`: compiled function bodies, exception tables, opcodes
//! - `sha256`: content hashing for the bytecode cache
//! - `config`: runtime tuning knobs (GC frequency, call-depth cap, …)
//! - `error`: host-level error plumbing for embedders

pub mod bytecode;
pub mod collections;
pub mod config;
pub mod error;
pub mod heap;
pub mod payload;
pub mod sha256;
pub mod sym;
pub mod value;

pub use heap::{Forced, Heap, HeapObject, HeapRef, Root};
pub use payload::Payload;
pub use sym::{Keyword, Symbol};
pub use value::{NativeFnId, Value};
