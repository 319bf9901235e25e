//! The tagged value (§3).
//!
//! A real bit-packed tagged machine word (low tag bits + inline/pointer
//! payload in the high bits) needs raw pointer tagging to get the "free tag
//! bits on aligned allocations" trick spec.md describes. That is unsafe and,
//! per the instructions governing this crate, idiomatic safe Rust is
//! preferred over a hand-rolled unsafe encoding when the *behavior* being
//! tested (§8) does not depend on the bit layout itself. `Value` here is a
//! safe tagged enum with the same *distinctions* §3 requires:
//!
//! nil / native-fn / symbol / keyword / int64 / float64 / string / heap-object
//!
//! `HeapRef` (heap.rs) is a `Copy` index into the `Heap`'s allocation list,
//! playing the role of the "pointer" payload a heap-object tag would carry.
//! `Value::Int48` plays the role of the inline short-integer tag used by the
//! byte-array element accessor (§3: "an additional short-integer tag
//! (int48) supports embedding small integers inline").

use crate::heap::HeapRef;
use crate::sym::{Keyword, Symbol};
use std::rc::Rc;

/// A 21-bit Unicode scalar value, per the Non-goals ("numeric types beyond
/// 64-bit integer, 64-bit float, and 21-bit Unicode scalar").
pub type Char21 = char;

/// Opaque id for a native (host) function registered with the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeFnId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    NativeFn(NativeFnId),
    Symbol(Symbol),
    Keyword(Keyword),
    Int(i64),
    Float(f64),
    Char(Char21),
    /// Strings are not interned (§3) and carry their own tag rather than
    /// going through the generic heap-object layout.
    Str(Rc<str>),
    /// An inline 48-bit-range integer, used by the byte-array entry accessor.
    Int48(i64),
    /// The generic heap-object tag: everything with a type ref + elements
    /// (+ optional ints) lives behind this indirection.
    Obj(HeapRef),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Every value except nil is truthy (Clojure-style semantics: the
    /// compiler's `if`/`BNIL`/`BNNIL` only ever branch on nil-ness).
    pub fn is_truthy(&self) -> bool {
        !self.is_nil()
    }

    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::NativeFn(_) => "native-fn",
            Value::Symbol(_) => "symbol",
            Value::Keyword(_) => "keyword",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::Str(_) => "string",
            Value::Int48(_) => "int48",
            Value::Obj(_) => "object",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    /// There is no boolean tag in §3's tag list. `true`/`false` surface to
    /// Ember code as ordinary vars bound by the runtime prelude to the
    /// symbols `true`/`false`; this impl is a host-side convenience so
    /// builtins can answer a yes/no question with a value whose truthiness
    /// (§3: anything but nil is truthy) matches the Rust bool.
    fn from(v: bool) -> Self {
        if v {
            Value::Symbol(Symbol::unqualified("true"))
        } else {
            Value::Nil
        }
    }
}

/// §4.1: "hash_value(v) returns a 64-bit integer; for interned
/// symbols/keywords it may be the pointer hash; for strings it is a
/// byte-wise hash". Heap objects (vectors, nested maps used as keys) hash
/// by identity (their `HeapRef` index) — see DESIGN.md for why this crate
/// resolves that Open Question to identity rather than deep structural
/// hashing.
pub fn hash_value(v: &Value) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut h = DefaultHasher::new();
    match v {
        Value::Nil => 0u8.hash(&mut h),
        Value::NativeFn(id) => {
            1u8.hash(&mut h);
            id.0.hash(&mut h);
        }
        Value::Symbol(s) => {
            2u8.hash(&mut h);
            s.hash(&mut h);
        }
        Value::Keyword(k) => {
            3u8.hash(&mut h);
            k.hash(&mut h);
        }
        Value::Int(i) => {
            4u8.hash(&mut h);
            i.hash(&mut h);
        }
        Value::Float(f) => {
            5u8.hash(&mut h);
            f.to_bits().hash(&mut h);
        }
        Value::Char(c) => {
            6u8.hash(&mut h);
            c.hash(&mut h);
        }
        Value::Str(s) => {
            7u8.hash(&mut h);
            s.as_bytes().hash(&mut h);
        }
        Value::Int48(i) => {
            8u8.hash(&mut h);
            i.hash(&mut h);
        }
        Value::Obj(r) => {
            9u8.hash(&mut h);
            r.hash(&mut h);
        }
    }
    h.finish()
}

/// Recursive equality protocol (§4.2: "Equality for sequences is
/// length-aware and element-wise"). For the core tag set this is exactly
/// `PartialEq`; kept as a named function so collection code reads in the
/// spec's own vocabulary.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn hash_is_deterministic_and_type_aware() {
        assert_eq!(hash_value(&Value::Int(1)), hash_value(&Value::Int(1)));
        assert_ne!(hash_value(&Value::Int(1)), hash_value(&Value::Float(1.0)));
    }
}
