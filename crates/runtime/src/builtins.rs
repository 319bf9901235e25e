//! Primitive operations: overflow-checked arithmetic and the generic
//! collection protocol (§4.7 "Integer semantics", §9 "cached hot paths for
//! the common protocols").
//!
//! Every fallible primitive returns `Result<T, ExceptionKind>` rather than
//! panicking; the VM (vm.rs) is responsible for turning that into an
//! actual heap exception value and driving the exception table.

use crate::exception::ExceptionKind;
use ember_core::collections::array_map::GenericMap;
use ember_core::collections::hamt::Hamt;
use ember_core::collections::list::List;
use ember_core::collections::vector::PersistentVector;
use ember_core::value::value_eq;
use ember_core::{Heap, Payload, Value};

// -- overflow-checked arithmetic (§4.7, §8 property 7) -----------------

pub fn add_i64(a: i64, b: i64) -> Result<i64, ExceptionKind> {
    a.checked_add(b).ok_or(ExceptionKind::ArithmeticException)
}

pub fn sub_i64(a: i64, b: i64) -> Result<i64, ExceptionKind> {
    a.checked_sub(b).ok_or(ExceptionKind::ArithmeticException)
}

pub fn mul_i64(a: i64, b: i64) -> Result<i64, ExceptionKind> {
    a.checked_mul(b).ok_or(ExceptionKind::ArithmeticException)
}

pub fn neg_i64(a: i64) -> Result<i64, ExceptionKind> {
    a.checked_neg().ok_or(ExceptionKind::ArithmeticException)
}

/// Unbox a tagged `Value::Int` or raise `IllegalArgument` (§4.7 "Unboxing
/// checks tag and raises IllegalArgument otherwise").
pub fn unbox_i64(v: &Value) -> Result<i64, ExceptionKind> {
    match v {
        Value::Int(i) => Ok(*i),
        _ => Err(ExceptionKind::IllegalArgument),
    }
}

pub fn add(a: &Value, b: &Value) -> Result<Value, ExceptionKind> {
    Ok(Value::Int(add_i64(unbox_i64(a)?, unbox_i64(b)?)?))
}

pub fn sub(a: &Value, b: &Value) -> Result<Value, ExceptionKind> {
    Ok(Value::Int(sub_i64(unbox_i64(a)?, unbox_i64(b)?)?))
}

pub fn mul(a: &Value, b: &Value) -> Result<Value, ExceptionKind> {
    Ok(Value::Int(mul_i64(unbox_i64(a)?, unbox_i64(b)?)?))
}

pub fn neg(a: &Value) -> Result<Value, ExceptionKind> {
    Ok(Value::Int(neg_i64(unbox_i64(a)?)?))
}

// -- the generic collection protocol (§9) ------------------------------
//
// `seq`/`first`/`next`/`count`/`get`/`conj`/`assoc`/`dissoc`/`obj=` all
// dispatch on the heap object's `Payload` shape. This is the "primitive
// fast path" half of §9's multimethod story: built-in collection types
// are handled here directly rather than through a real multimethod table,
// leaving the table itself (multimethod.rs) free for user-level `deftype`
// dispatch that this crate does not model.

pub fn count(heap: &Heap, v: &Value) -> Result<i64, ExceptionKind> {
    match v {
        Value::Nil => Ok(0),
        Value::Str(s) => Ok(s.chars().count() as i64),
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::Vector(vec) => Ok(vec.len() as i64),
            Payload::ListVal(l) => Ok(l.size() as i64),
            Payload::Map(m) => Ok(m.size() as i64),
            Payload::Set(s) => Ok(s.size() as i64),
            Payload::HamtNode(h) => Ok(h.size() as i64),
            Payload::ByteArray(b) => Ok(b.len() as i64),
            Payload::Elements(es) => Ok(es.len() as i64),
            Payload::Dynamic(es) => Ok(es.borrow().len() as i64),
            _ => Err(ExceptionKind::IllegalArgument),
        },
        _ => Err(ExceptionKind::IllegalArgument),
    }
}

/// `seq` (§9 glossary): the element view of a collection, rendered as an
/// eager `Vec` — this crate has no separate lazy-seq heap type (an Open
/// Question resolution, see DESIGN.md). Maps have no single natural
/// per-element `Value`, so their iteration goes through [`map_entries`]
/// instead; `seq` covers every collection with a plain element sequence.
pub fn seq(heap: &Heap, v: &Value) -> Result<Vec<Value>, ExceptionKind> {
    match v {
        Value::Nil => Ok(Vec::new()),
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::Vector(vec) => Ok(vec.iter().cloned().collect()),
            Payload::ListVal(l) => Ok(l.iter().cloned().collect()),
            Payload::Set(s) => Ok(s.seq()),
            Payload::HamtNode(h) => Ok(h.iter().map(|(k, _)| k).collect()),
            Payload::Elements(es) => Ok(es.to_vec()),
            Payload::Dynamic(es) => Ok(es.borrow().clone()),
            _ => Err(ExceptionKind::IllegalArgument),
        },
        _ => Err(ExceptionKind::IllegalArgument),
    }
}

/// Key/value pairs of a map-shaped collection, in iteration order (§4.3:
/// "depth-first, left-to-right as laid out").
pub fn map_entries(heap: &Heap, v: &Value) -> Result<Vec<(Value, Value)>, ExceptionKind> {
    match v {
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::Map(m) => Ok(m.seq()),
            Payload::HamtNode(h) => Ok(h.iter().collect()),
            _ => Err(ExceptionKind::IllegalArgument),
        },
        _ => Err(ExceptionKind::IllegalArgument),
    }
}

pub fn first(heap: &Heap, v: &Value) -> Result<Value, ExceptionKind> {
    Ok(seq(heap, v)?.into_iter().next().unwrap_or(Value::Nil))
}

/// The remaining elements after the first, as a plain `Vec` — callers that
/// need the result as a `Value` (a fresh `List`) allocate it themselves
/// with a live `&mut Heap`, the same division of labour `map_entries` uses.
pub fn rest(heap: &Heap, v: &Value) -> Result<Vec<Value>, ExceptionKind> {
    let mut items = seq(heap, v)?;
    if !items.is_empty() {
        items.remove(0);
    }
    Ok(items)
}

pub fn get(heap: &Heap, coll: &Value, key: &Value, default: Value) -> Result<Value, ExceptionKind> {
    match coll {
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::Map(m) => Ok(m.get(key).unwrap_or(default)),
            Payload::HamtNode(h) => Ok(h.get(key).unwrap_or(default)),
            Payload::Vector(vec) => {
                let Value::Int(i) = key else {
                    return Err(ExceptionKind::IllegalArgument);
                };
                if *i < 0 {
                    return Ok(default);
                }
                Ok(vec.get(*i as usize).cloned().unwrap_or(default))
            }
            Payload::Set(s) => Ok(if s.contains(key) { key.clone() } else { default }),
            _ => Err(ExceptionKind::IllegalArgument),
        },
        Value::Nil => Ok(default),
        _ => Err(ExceptionKind::IllegalArgument),
    }
}

pub fn nth(heap: &Heap, coll: &Value, i: i64) -> Result<Value, ExceptionKind> {
    let Value::Obj(r) = coll else {
        return Err(ExceptionKind::IllegalArgument);
    };
    match &heap.get(*r).payload {
        Payload::Vector(vec) => {
            if i < 0 {
                return Err(ExceptionKind::IndexOutOfBounds);
            }
            vec.get(i as usize).cloned().ok_or(ExceptionKind::IndexOutOfBounds)
        }
        _ => Err(ExceptionKind::IllegalArgument),
    }
}

/// Recursive structural equality for the generic protocol's `obj=` (§4.2:
/// "equality for sequences is length-aware and element-wise").
pub fn obj_eq(heap: &Heap, a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Obj(ra), Value::Obj(rb)) => {
            match (&heap.get(*ra).payload, &heap.get(*rb).payload) {
                (Payload::Vector(va), Payload::Vector(vb)) => {
                    va.len() == vb.len()
                        && va.iter().zip(vb.iter()).all(|(x, y)| obj_eq(heap, x, y))
                }
                (Payload::ListVal(la), Payload::ListVal(lb)) => {
                    la.size() == lb.size()
                        && la.iter().zip(lb.iter()).all(|(x, y)| obj_eq(heap, x, y))
                }
                (Payload::Map(ma), Payload::Map(mb)) => {
                    ma.size() == mb.size()
                        && ma.seq().iter().all(|(k, v)| {
                            mb.get(k).is_some_and(|v2| obj_eq(heap, v, &v2))
                        })
                }
                (Payload::HamtNode(ha), Payload::HamtNode(hb)) => ha == hb,
                _ => value_eq(a, b),
            }
        }
        _ => value_eq(a, b),
    }
}

/// Allocate a fresh HAMT-backed empty map, matching `create_array` et al
/// in §6's embedding surface.
pub fn empty_map() -> GenericMap {
    GenericMap::empty()
}

pub fn empty_vector() -> PersistentVector {
    PersistentVector::empty()
}

pub fn empty_hamt() -> Hamt {
    Hamt::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_on_all_four_s3_scenarios() {
        assert_eq!(add_i64(i64::MAX, 1), Err(ExceptionKind::ArithmeticException));
        assert_eq!(sub_i64(i64::MIN, 1), Err(ExceptionKind::ArithmeticException));
        assert_eq!(mul_i64(i64::MAX, 2), Err(ExceptionKind::ArithmeticException));
        assert_eq!(add_i64(i64::MIN, -1), Err(ExceptionKind::ArithmeticException));
    }

    #[test]
    fn non_overflowing_arithmetic_is_exact() {
        assert_eq!(add_i64(2, 3), Ok(5));
        assert_eq!(sub_i64(5, 3), Ok(2));
        assert_eq!(mul_i64(4, 5), Ok(20));
    }

    #[test]
    fn unbox_rejects_non_int() {
        assert_eq!(unbox_i64(&Value::Float(1.0)), Err(ExceptionKind::IllegalArgument));
        assert_eq!(unbox_i64(&Value::Int(1)), Ok(1));
    }

    #[test]
    fn count_of_nil_and_string() {
        let heap = Heap::new(64);
        assert_eq!(count(&heap, &Value::Nil).unwrap(), 0);
        assert_eq!(count(&heap, &Value::str("abc")).unwrap(), 3);
    }

    #[test]
    fn count_of_vector_payload() {
        let mut heap = Heap::new(64);
        let ty = heap.bootstrap_meta_type();
        let v = PersistentVector::empty().conj(Value::Int(1)).conj(Value::Int(2));
        let forced = heap.alloc_static(ty, Payload::Vector(v));
        assert_eq!(count(&heap, &forced.value()).unwrap(), 2);
    }
}
