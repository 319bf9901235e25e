//! Multimethods and the type hierarchy (§4.5).
//!
//! Dispatch values are typically type tags (symbols/keywords) but the
//! protocol allows any `Value`; `ember_core::value::{hash_value, value_eq}`
//! already gives exactly the hash/equality discipline collections use, so
//! `DispatchKey` just borrows it to get a `Value`-keyed `HashMap` instead
//! of a linear scan.

use ember_core::value::{hash_value, value_eq};
use ember_core::{Heap, Payload, Value};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub struct DispatchKey(pub Value);

impl PartialEq for DispatchKey {
    fn eq(&self, other: &Self) -> bool {
        value_eq(&self.0, &other.0)
    }
}
impl Eq for DispatchKey {}

impl Hash for DispatchKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0).hash(state);
    }
}

/// The process-wide `child isa parent` table (§4.5). `derive` is
/// transitive: ancestors are recomputed whenever the relation grows.
#[derive(Debug, Default)]
pub struct Hierarchy {
    /// direct parents only; `ancestors` below is the transitive closure.
    parents: HashMap<DispatchKey, Vec<Value>>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derive(&mut self, child: Value, parent: Value) {
        self.parents
            .entry(DispatchKey(child))
            .or_default()
            .push(parent);
    }

    /// Transitive ancestor set of `tag`, recomputed on demand (§4.5:
    /// "ancestors are recomputed when the relation is extended" — rather
    /// than caching and invalidating, this crate simply derives it fresh
    /// each call, which is fine at the scale a single-threaded interpreter
    /// needs).
    pub fn ancestors(&self, tag: &Value) -> Vec<Value> {
        let mut seen: Vec<Value> = Vec::new();
        let mut queue: Vec<Value> = self
            .parents
            .get(&DispatchKey(tag.clone()))
            .cloned()
            .unwrap_or_default();
        while let Some(p) = queue.pop() {
            if seen.iter().any(|s| value_eq(s, &p)) {
                continue;
            }
            seen.push(p.clone());
            if let Some(grandparents) = self.parents.get(&DispatchKey(p)) {
                queue.extend(grandparents.iter().cloned());
            }
        }
        seen
    }

    /// `isa?` (§4.5): equal, in the transitive ancestor set, or — for
    /// vectors — elementwise `isa?` of equal length. Dispatch values are
    /// ordinarily bare tags (symbols/keywords), but `derive_method`'s
    /// multi-arg dispatch convention (`[Dog Mammal]` isa `[Animal Mammal]`)
    /// needs a heap to peer into a vector dispatch value's elements.
    pub fn isa(&self, heap: &Heap, child: &Value, parent: &Value) -> bool {
        if value_eq(child, parent) {
            return true;
        }
        if self.ancestors(child).iter().any(|a| value_eq(a, parent)) {
            return true;
        }
        if let (Value::Obj(cr), Value::Obj(pr)) = (child, parent) {
            if let (Payload::Vector(cv), Payload::Vector(pv)) = (&heap.get(*cr).payload, &heap.get(*pr).payload) {
                if cv.len() != pv.len() {
                    return false;
                }
                return cv.iter().zip(pv.iter()).all(|(c, p)| self.isa(heap, c, p));
            }
        }
        false
    }
}

struct Method {
    dispatch_val: Value,
    handler: Value,
}

/// One multimethod's dispatch table. The dispatch function itself is a
/// `Value` (ordinarily a `BytecodeFn`, invoked through the `apply`
/// callback passed to `dispatch`) rather than a Rust closure, per §9: "the
/// dispatch function is itself a value".
pub struct Multimethod {
    pub dispatch_fn: Value,
    pub default_val: Value,
    methods: Vec<Method>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    NoMatch,
    Ambiguous,
}

impl Multimethod {
    pub fn new(dispatch_fn: Value, default_val: Value) -> Self {
        Multimethod {
            dispatch_fn,
            default_val,
            methods: Vec::new(),
        }
    }

    /// `define_method(name, dispatch_val, fn)` (§4.5): adds or replaces.
    pub fn define_method(&mut self, dispatch_val: Value, handler: Value) {
        if let Some(m) = self.methods.iter_mut().find(|m| value_eq(&m.dispatch_val, &dispatch_val)) {
            m.handler = handler;
        } else {
            self.methods.push(Method { dispatch_val, handler });
        }
    }

    /// Resolve the handler for a dispatch value `v` already computed by
    /// applying `dispatch_fn` to the call's arguments (the caller owns
    /// that application since it may need to invoke bytecode).
    pub fn resolve(&self, heap: &Heap, hierarchy: &Hierarchy, v: &Value) -> Result<Value, DispatchError> {
        if let Some(m) = self.methods.iter().find(|m| value_eq(&m.dispatch_val, v)) {
            return Ok(m.handler.clone());
        }

        let ancestors = hierarchy.ancestors(v);
        let mut candidates: Vec<&Method> = self
            .methods
            .iter()
            .filter(|m| ancestors.iter().any(|a| value_eq(a, &m.dispatch_val)))
            .collect();

        if candidates.is_empty() {
            if !value_eq(&self.default_val, &Value::Nil) {
                if let Some(m) = self.methods.iter().find(|m| value_eq(&m.dispatch_val, &self.default_val)) {
                    return Ok(m.handler.clone());
                }
            }
            return Err(DispatchError::NoMatch);
        }

        // Most-specific: a candidate whose dispatch value is not itself an
        // ancestor of any other candidate's dispatch value.
        let most_specific: Vec<&&Method> = candidates
            .iter()
            .filter(|m| {
                !candidates.iter().any(|other| {
                    !std::ptr::eq(*other, **m)
                        && hierarchy.isa(heap, &other.dispatch_val, &m.dispatch_val)
                        && !value_eq(&other.dispatch_val, &m.dispatch_val)
                })
            })
            .collect();

        if most_specific.len() == 1 {
            candidates.retain(|m| value_eq(&m.dispatch_val, &most_specific[0].dispatch_val));
            return Ok(candidates[0].handler.clone());
        }
        Err(DispatchError::Ambiguous)
    }

    /// Distinct dispatch values with a defined method, for introspection/tests.
    pub fn dispatch_values(&self) -> HashSet<DispatchKey> {
        self.methods.iter().map(|m| DispatchKey(m.dispatch_val.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str) -> Value {
        Value::str(name)
    }

    #[test]
    fn derive_builds_transitive_ancestors() {
        let heap = Heap::new(64);
        let mut h = Hierarchy::new();
        h.derive(tag("dog"), tag("animal"));
        h.derive(tag("animal"), tag("being"));
        let ancestors = h.ancestors(&tag("dog"));
        assert!(ancestors.iter().any(|a| value_eq(a, &tag("animal"))));
        assert!(ancestors.iter().any(|a| value_eq(a, &tag("being"))));
        assert!(h.isa(&heap, &tag("dog"), &tag("being")));
    }

    #[test]
    fn dispatch_prefers_exact_match() {
        let heap = Heap::new(64);
        let mut mm = Multimethod::new(Value::Nil, Value::Nil);
        mm.define_method(tag("dog"), Value::str("bark"));
        mm.define_method(tag("animal"), Value::str("generic-sound"));
        let h = Hierarchy::new();
        assert_eq!(mm.resolve(&heap, &h, &tag("dog")).unwrap(), Value::str("bark"));
    }

    #[test]
    fn dispatch_falls_back_to_most_specific_ancestor() {
        let heap = Heap::new(64);
        let mut h = Hierarchy::new();
        h.derive(tag("dog"), tag("animal"));
        let mut mm = Multimethod::new(Value::Nil, Value::Nil);
        mm.define_method(tag("animal"), Value::str("generic-sound"));
        assert_eq!(mm.resolve(&heap, &h, &tag("dog")).unwrap(), Value::str("generic-sound"));
    }

    #[test]
    fn dispatch_with_no_match_and_no_default_fails() {
        let heap = Heap::new(64);
        let mm = Multimethod::new(Value::Nil, Value::Nil);
        let h = Hierarchy::new();
        assert_eq!(mm.resolve(&heap, &h, &tag("dog")), Err(DispatchError::NoMatch));
    }

    #[test]
    fn dispatch_uses_default_when_nothing_matches() {
        let heap = Heap::new(64);
        let mut mm = Multimethod::new(Value::Nil, tag("default"));
        mm.define_method(tag("default"), Value::str("fallback"));
        let h = Hierarchy::new();
        assert_eq!(mm.resolve(&heap, &h, &tag("unrelated")).unwrap(), Value::str("fallback"));
    }

    #[test]
    fn ambiguous_ancestors_fail() {
        let heap = Heap::new(64);
        let mut h = Hierarchy::new();
        h.derive(tag("dog"), tag("pet"));
        h.derive(tag("dog"), tag("mammal"));
        let mut mm = Multimethod::new(Value::Nil, Value::Nil);
        mm.define_method(tag("pet"), Value::str("a"));
        mm.define_method(tag("mammal"), Value::str("b"));
        assert_eq!(mm.resolve(&heap, &h, &tag("dog")), Err(DispatchError::Ambiguous));
    }

    #[test]
    fn isa_is_elementwise_over_equal_length_vectors() {
        let mut heap = Heap::new(64);
        let meta = heap.bootstrap_meta_type();
        let mut h = Hierarchy::new();
        h.derive(tag("dog"), tag("animal"));

        let child = ember_core::collections::vector::PersistentVector::from_vec(vec![tag("dog"), tag("mammal")]);
        let parent = ember_core::collections::vector::PersistentVector::from_vec(vec![tag("animal"), tag("mammal")]);
        let child_v = heap.alloc_static(meta, Payload::Vector(child)).value();
        let parent_v = heap.alloc_static(meta, Payload::Vector(parent)).value();
        assert!(h.isa(&heap, &child_v, &parent_v));

        let mismatched = ember_core::collections::vector::PersistentVector::from_vec(vec![tag("dog")]);
        let mismatched_v = heap.alloc_static(meta, Payload::Vector(mismatched)).value();
        assert!(!h.isa(&heap, &mismatched_v, &parent_v));
    }
}
