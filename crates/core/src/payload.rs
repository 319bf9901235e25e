//! Heap object payloads (§3).
//!
//! Every heap object is, conceptually, a type reference plus a
//! variable-length elements array plus an optional variable-length
//! integers array, in either a static (immutable) or dynamic (mutable
//! logical size) layout. Rather than force every concrete heap entity
//! (vectors, HAMT nodes, vars, bytecode bodies, …) through one untyped
//! `Vec<Value>` + `Vec<i64>` pair and re-deriving their shape at every use
//! site, this crate gives each entity its own `Payload` variant — the
//! uniform "elements + ints" model still holds, it is just expressed as a
//! sum type instead of reinterpreted bytes, which is the idiomatic-Rust
//! rendition of the same contract.

use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::collections::array_map::{GenericMap, GenericSet};
use crate::collections::byte_array::ByteArray;
use crate::collections::hamt::Hamt;
use crate::collections::list::List;
use crate::collections::vector::PersistentVector;

#[derive(Debug)]
pub enum Payload {
    /// Static layout: fixed shape, immutable after construction. Kept for
    /// entities whose shape genuinely is "just an elements array" and that
    /// have no dedicated variant below.
    Elements(Box<[Value]>),

    /// Dynamic layout: elements grow/shrink in place, used by transient
    /// collections. The `Vec`'s own length is the mutable logical size.
    Dynamic(RefCell<Vec<Value>>),

    /// Packed bytes with a mutable logical size — the transient phase of a
    /// ByteArray, before the type flip to [`Payload::ByteArray`] (§3).
    Bytes(RefCell<Vec<u8>>),

    /// A single mutable cell (Atom §3).
    Atom(RefCell<Value>),

    /// A persistent vector (§4.2).
    Vector(PersistentVector),

    /// A persistent, packed byte array; immutable after the transient→persistent flip (§3).
    ByteArray(ByteArray),

    /// A singly-linked persistent list (§4.2).
    ListVal(List),

    /// An array-map/HAMT-backed map, promotion handled transparently (§4.2, §4.3).
    Map(GenericMap),

    /// An array-set/HAMT-backed set, same promotion story as `Map` (§4.2, §4.3).
    Set(GenericSet),

    /// A persistent HAMT map/set (§4.3): logical size plus root trie node.
    /// Used directly by `Map`/`Set` above; kept as its own variant too for
    /// HAMT-only heap objects the VM's unit tests construct directly.
    HamtNode(Hamt),

    /// A Var: root value, meta map, dynamic-binding flag (§4.4).
    Var(VarPayload),

    /// A namespace's symbol→Var map (§4.4).
    Namespace(RefCell<HashMap<String, Value>>),

    /// A compiled function body for one arity (§4.6/§4.7).
    BytecodeFnBody(crate::bytecode::BytecodeFnBody),

    /// A function: a name plus bodies sorted by arity (§3).
    BytecodeFn(crate::bytecode::BytecodeFnData),

    /// A bootstrap type record (name + field-name table for `LDDF`).
    Type(TypePayload),
}

#[derive(Debug)]
pub struct VarPayload {
    pub root: RefCell<Value>,
    pub meta: RefCell<Value>,
    pub dynamic: bool,
    /// Per-binding-stack-frame overrides, pushed/popped in lockstep with
    /// the global binding stack (§4.4).
    pub bindings: RefCell<Vec<Value>>,
}

#[derive(Debug)]
pub struct TypePayload {
    pub name: String,
    /// field name -> index, for the `LDDF`/`STDF` family (§4.7, §9 open
    /// question resolved: object-field access by name).
    pub fields: Vec<String>,
}

impl Payload {
    /// Values directly reachable from this payload, for the GC mark phase.
    /// Returns owned clones rather than borrows so payloads stored behind
    /// a `RefCell` can be traced without holding the guard past this call.
    pub fn children(&self) -> Vec<Value> {
        match self {
            Payload::Elements(es) => es.to_vec(),
            Payload::Dynamic(es) => es.borrow().clone(),
            Payload::Bytes(_) => Vec::new(),
            Payload::Atom(v) => vec![v.borrow().clone()],
            Payload::Vector(v) => v.children(),
            Payload::ByteArray(_) => Vec::new(),
            Payload::ListVal(l) => l.children(),
            Payload::Map(m) => m.children(),
            Payload::Set(s) => s.children(),
            Payload::HamtNode(n) => n.children(),
            Payload::Var(v) => {
                let mut out = vec![v.root.borrow().clone(), v.meta.borrow().clone()];
                out.extend(v.bindings.borrow().iter().cloned());
                out
            }
            Payload::Namespace(ns) => ns.borrow().values().cloned().collect(),
            Payload::BytecodeFnBody(b) => b.consts.clone(),
            Payload::BytecodeFn(f) => f.bodies.iter().map(|r| Value::Obj(*r)).collect(),
            Payload::Type(_) => Vec::new(),
        }
    }
}
