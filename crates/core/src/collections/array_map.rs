//! Array-map / array-set with transparent HAMT promotion (§4.2):
//! "linear-scan K-V or K stores used while size ≤ 16; above that threshold
//! they are transparently promoted to HAMTs. The promotion is hidden
//! behind the generic assoc/dissoc/get/contains/conj/seq dispatchers."

use crate::collections::hamt::Hamt;
use crate::value::{value_eq, Value};

/// Above this many entries, `GenericMap::assoc` promotes to a `Hamt`.
pub const PROMOTE_AT: usize = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayMap {
    pairs: Vec<(Value, Value)>,
}

impl ArrayMap {
    pub fn empty() -> Self {
        ArrayMap { pairs: Vec::new() }
    }

    pub fn size(&self) -> usize {
        self.pairs.len()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.pairs.iter().find(|(k, _)| value_eq(k, key)).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.pairs.iter()
    }

    fn assoc_in_place(&self, key: Value, value: Value) -> ArrayMap {
        let mut pairs = self.pairs.clone();
        match pairs.iter_mut().find(|(k, _)| value_eq(k, &key)) {
            Some(p) => p.1 = value,
            None => pairs.push((key, value)),
        }
        ArrayMap { pairs }
    }

    fn dissoc_in_place(&self, key: &Value) -> ArrayMap {
        ArrayMap {
            pairs: self
                .pairs
                .iter()
                .filter(|(k, _)| !value_eq(k, key))
                .cloned()
                .collect(),
        }
    }

    fn to_hamt(&self) -> Hamt {
        let mut m = Hamt::empty();
        for (k, v) in &self.pairs {
            m = m.assoc(k.clone(), v.clone());
        }
        m
    }
}

/// The dispatcher §4.2 describes: small maps stay a flat `ArrayMap`;
/// `assoc` past [`PROMOTE_AT`] entries promotes to a `Hamt` and every
/// subsequent operation routes there. Promotion is one-way — a `dissoc`
/// that shrinks a `Hamt` back under the threshold does not demote, the
/// same direction-of-travel the teacher's own growth-only data structures
/// take.
#[derive(Debug, Clone, PartialEq)]
pub enum GenericMap {
    Array(ArrayMap),
    Hamt(Hamt),
}

impl GenericMap {
    pub fn empty() -> Self {
        GenericMap::Array(ArrayMap::empty())
    }

    pub fn size(&self) -> usize {
        match self {
            GenericMap::Array(m) => m.size(),
            GenericMap::Hamt(m) => m.size(),
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        match self {
            GenericMap::Array(m) => m.get(key).cloned(),
            GenericMap::Hamt(m) => m.get(key),
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn assoc(&self, key: Value, value: Value) -> GenericMap {
        match self {
            GenericMap::Array(m) => {
                let is_new = m.get(&key).is_none();
                if is_new && m.size() >= PROMOTE_AT {
                    GenericMap::Hamt(m.to_hamt().assoc(key, value))
                } else {
                    GenericMap::Array(m.assoc_in_place(key, value))
                }
            }
            GenericMap::Hamt(m) => GenericMap::Hamt(m.assoc(key, value)),
        }
    }

    pub fn dissoc(&self, key: &Value) -> GenericMap {
        match self {
            GenericMap::Array(m) => GenericMap::Array(m.dissoc_in_place(key)),
            GenericMap::Hamt(m) => GenericMap::Hamt(m.dissoc(key)),
        }
    }

    pub fn seq(&self) -> Vec<(Value, Value)> {
        match self {
            GenericMap::Array(m) => m.iter().cloned().collect(),
            GenericMap::Hamt(m) => m.iter().collect(),
        }
    }

    pub fn children(&self) -> Vec<Value> {
        self.seq().into_iter().flat_map(|(k, v)| [k, v]).collect()
    }
}

impl Default for GenericMap {
    fn default() -> Self {
        Self::empty()
    }
}

/// Same promotion story as [`GenericMap`], for sets (§4.2, §3: "HashSet …
/// same shape as map").
#[derive(Debug, Clone, PartialEq)]
pub enum GenericSet {
    Array(Vec<Value>),
    Hamt(crate::collections::hamt::PersistentSet),
}

impl GenericSet {
    pub fn empty() -> Self {
        GenericSet::Array(Vec::new())
    }

    pub fn size(&self) -> usize {
        match self {
            GenericSet::Array(v) => v.len(),
            GenericSet::Hamt(s) => s.size(),
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        match self {
            GenericSet::Array(v) => v.iter().any(|k| value_eq(k, key)),
            GenericSet::Hamt(s) => s.contains(key),
        }
    }

    pub fn conj(&self, key: Value) -> GenericSet {
        match self {
            GenericSet::Array(v) => {
                if v.iter().any(|k| value_eq(k, &key)) {
                    GenericSet::Array(v.clone())
                } else if v.len() >= PROMOTE_AT {
                    let mut s = crate::collections::hamt::PersistentSet::empty();
                    for k in v {
                        s = s.conj(k.clone());
                    }
                    GenericSet::Hamt(s.conj(key))
                } else {
                    let mut v2 = v.clone();
                    v2.push(key);
                    GenericSet::Array(v2)
                }
            }
            GenericSet::Hamt(s) => GenericSet::Hamt(s.conj(key)),
        }
    }

    pub fn disj(&self, key: &Value) -> GenericSet {
        match self {
            GenericSet::Array(v) => {
                GenericSet::Array(v.iter().filter(|k| !value_eq(k, key)).cloned().collect())
            }
            GenericSet::Hamt(s) => GenericSet::Hamt(s.disj(key)),
        }
    }

    pub fn seq(&self) -> Vec<Value> {
        match self {
            GenericSet::Array(v) => v.clone(),
            GenericSet::Hamt(s) => s.iter().collect(),
        }
    }

    pub fn children(&self) -> Vec<Value> {
        self.seq()
    }
}

impl Default for GenericSet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_map_stays_array_backed() {
        let mut m = GenericMap::empty();
        for i in 0..16i64 {
            m = m.assoc(Value::Int(i), Value::Int(i));
        }
        assert!(matches!(m, GenericMap::Array(_)));
        assert_eq!(m.size(), 16);
    }

    #[test]
    fn crossing_the_threshold_promotes_to_hamt() {
        let mut m = GenericMap::empty();
        for i in 0..17i64 {
            m = m.assoc(Value::Int(i), Value::Int(i));
        }
        assert!(matches!(m, GenericMap::Hamt(_)));
        assert_eq!(m.size(), 17);
        for i in 0..17i64 {
            assert_eq!(m.get(&Value::Int(i)), Some(Value::Int(i)));
        }
    }

    #[test]
    fn updating_an_existing_key_never_promotes() {
        let mut m = GenericMap::empty();
        for i in 0..16i64 {
            m = m.assoc(Value::Int(i), Value::Int(0));
        }
        let m2 = m.assoc(Value::Int(0), Value::Int(99));
        assert!(matches!(m2, GenericMap::Array(_)));
        assert_eq!(m2.get(&Value::Int(0)), Some(Value::Int(99)));
    }

    #[test]
    fn set_promotion_mirrors_map_promotion() {
        let mut s = GenericSet::empty();
        for i in 0..20i64 {
            s = s.conj(Value::Int(i));
        }
        assert!(matches!(s, GenericSet::Hamt(_)));
        assert_eq!(s.size(), 20);
        assert!(s.contains(&Value::Int(5)));
    }
}
