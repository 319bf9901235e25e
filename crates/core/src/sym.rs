//! Interned symbols and keywords.
//!
//! Two symbols (or two keywords) with the same namespace/name parts must be
//! pointer-identical per the data model (§3): we approximate "pointer" with
//! a small interned integer id, which gives the same O(1) identity
//! comparison without needing raw pointers into the GC heap.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Parts {
    ns: Option<Rc<str>>,
    name: Rc<str>,
}

struct InternTable {
    ids: HashMap<Parts, u32>,
    entries: Vec<Parts>,
}

impl InternTable {
    fn new() -> Self {
        Self {
            ids: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn intern(&mut self, ns: Option<&str>, name: &str) -> u32 {
        let parts = Parts {
            ns: ns.map(Rc::from),
            name: Rc::from(name),
        };
        if let Some(&id) = self.ids.get(&parts) {
            return id;
        }
        let id = self.entries.len() as u32;
        self.entries.push(parts.clone());
        self.ids.insert(parts, id);
        id
    }
}

thread_local! {
    static SYMBOLS: RefCell<InternTable> = RefCell::new(InternTable::new());
    static KEYWORDS: RefCell<InternTable> = RefCell::new(InternTable::new());
}

/// An interned symbol. Copy + Eq by id, matching "pointer-identical" interning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

/// An interned keyword. Same interning discipline as `Symbol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keyword(u32);

impl Symbol {
    pub fn intern(ns: Option<&str>, name: &str) -> Self {
        SYMBOLS.with(|t| Symbol(t.borrow_mut().intern(ns, name)))
    }

    pub fn unqualified(name: &str) -> Self {
        Self::intern(None, name)
    }

    pub fn namespace(self) -> Option<Rc<str>> {
        SYMBOLS.with(|t| t.borrow().entries[self.0 as usize].ns.clone())
    }

    pub fn name(self) -> Rc<str> {
        SYMBOLS.with(|t| t.borrow().entries[self.0 as usize].name.clone())
    }

    pub fn is_qualified(self) -> bool {
        self.namespace().is_some()
    }
}

impl Keyword {
    pub fn intern(ns: Option<&str>, name: &str) -> Self {
        KEYWORDS.with(|t| Keyword(t.borrow_mut().intern(ns, name)))
    }

    pub fn unqualified(name: &str) -> Self {
        Self::intern(None, name)
    }

    pub fn namespace(self) -> Option<Rc<str>> {
        KEYWORDS.with(|t| t.borrow().entries[self.0 as usize].ns.clone())
    }

    pub fn name(self) -> Rc<str> {
        KEYWORDS.with(|t| t.borrow().entries[self.0 as usize].name.clone())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{}/{}", ns, self.name()),
            None => write!(f, "{}", self.name()),
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, ":{}/{}", ns, self.name()),
            None => write!(f, ":{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_intern_by_identity() {
        let a = Symbol::intern(Some("user"), "foo");
        let b = Symbol::intern(Some("user"), "foo");
        assert_eq!(a, b);
        let c = Symbol::intern(None, "foo");
        assert_ne!(a, c);
    }

    #[test]
    fn keyword_display() {
        let k = Keyword::intern(None, "ok");
        assert_eq!(format!("{k}"), ":ok");
        let k2 = Keyword::intern(Some("ns"), "ok");
        assert_eq!(format!("{k2}"), ":ns/ok");
    }
}
