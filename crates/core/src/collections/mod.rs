//! Persistent collections (§4.2, §4.3).
//!
//! Each collection's trie/spine is plain Rust data built from `Rc` sharing
//! rather than GC-heap nodes: only the collection as a whole (the
//! `Payload` variant wrapping it) is a tracked heap object, the same way
//! the teacher keeps `Rc`-shared substructure off the allocator for
//! anything that does not need identity or mutation. `Payload::children`
//! walks into these structures to find any `Value::Obj` leaves so the GC
//! still sees through them.

pub mod array_map;
pub mod byte_array;
pub mod hamt;
pub mod list;
pub mod vector;
