//! Namespaces, vars and the dynamic binding stack (§4.4).

use ember_core::payload::VarPayload;
use ember_core::{Heap, HeapRef, Payload, Symbol, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::trace;

/// The process-wide `namespace name -> (unqualified name -> Var heap ref)`
/// registry (§3: "Namespace | mapping symbol→Var | Each process-wide
/// namespace registry entry is reachable"). Kept as a plain Rust map of
/// `HeapRef`s — the registry entries themselves are GC roots, supplied to
/// `Heap::collect_with_roots` by the embedder as `Value::Obj` wrappers.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    namespaces: HashMap<String, HashMap<String, HeapRef>>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_ns(&mut self, ns: &str) -> &mut HashMap<String, HeapRef> {
        self.namespaces.entry(ns.to_string()).or_default()
    }

    /// `define(sym, val, meta)` (§4.4): create or update the Var for
    /// `sym.name()` within `ns`.
    pub fn define(&mut self, heap: &mut Heap, meta_type: HeapRef, ns: &str, sym: Symbol, val: Value, meta: Value) -> HeapRef {
        let name = sym.name().to_string();
        if let Some(&existing) = self.namespaces.get(ns).and_then(|m| m.get(&name)) {
            if let Payload::Var(v) = &heap.get(existing).payload {
                *v.root.borrow_mut() = val;
                *v.meta.borrow_mut() = meta;
            }
            trace!(ns, name, "redefine var");
            return existing;
        }
        let forced = heap.alloc_static(
            meta_type,
            Payload::Var(VarPayload {
                root: RefCell::new(val),
                meta: RefCell::new(meta),
                dynamic: false,
                bindings: RefCell::new(Vec::new()),
            }),
        );
        let r = match forced.value() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        self.ensure_ns(ns).insert(name.clone(), r);
        trace!(ns, name, "define var");
        r
    }

    /// `resolve_var(ns, sym)` (§4.4): qualified symbols resolve directly
    /// against their own namespace; unqualified symbols resolve against
    /// the current namespace `ns`.
    pub fn resolve_var(&self, ns: &str, sym: Symbol) -> Option<HeapRef> {
        let target_ns = sym.namespace().map(|s| s.to_string()).unwrap_or_else(|| ns.to_string());
        self.namespaces.get(&target_ns)?.get(sym.name().as_ref()).copied()
    }

    /// Return the `HeapRef` of `sym`'s var within `ns`, creating it with a
    /// nil root/meta if it does not exist yet. Unlike [`Self::define`] this
    /// never touches an existing var's root — it exists for callers (the
    /// compiler's `def` codegen) that need a stable var identity to embed
    /// as a constant *before* the value that will be stored into it has
    /// been computed.
    pub fn ensure(&mut self, heap: &mut Heap, meta_type: HeapRef, ns: &str, sym: Symbol) -> HeapRef {
        let name = sym.name().to_string();
        if let Some(&existing) = self.namespaces.get(ns).and_then(|m| m.get(&name)) {
            return existing;
        }
        let forced = heap.alloc_static(
            meta_type,
            Payload::Var(VarPayload {
                root: RefCell::new(Value::Nil),
                meta: RefCell::new(Value::Nil),
                dynamic: false,
                bindings: RefCell::new(Vec::new()),
            }),
        );
        let r = match forced.value() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        self.ensure_ns(ns).insert(name, r);
        r
    }

    /// `refer(src_ns)` (§4.4): copy the source namespace's entries into
    /// `dst_ns`.
    pub fn refer(&mut self, dst_ns: &str, src_ns: &str) {
        let Some(src) = self.namespaces.get(src_ns).cloned() else {
            return;
        };
        self.ensure_ns(dst_ns).extend(src);
    }

    /// Every `HeapRef` currently registered, for GC root enumeration (§3:
    /// "every namespace registry entry is reachable").
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.namespaces
            .values()
            .flat_map(|m| m.values())
            .map(|r| Value::Obj(*r))
    }
}

/// The process-wide dynamic binding stack (§4.4, §5: "strictly paired,
/// scoped resource"). Each frame maps a Var's `HeapRef` to an override
/// value; lookup consults the top frame carrying an entry for the var,
/// else the var's root.
#[derive(Debug, Default)]
pub struct BindingStack {
    frames: Vec<HashMap<HeapRef, Value>>,
}

impl BindingStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bindings(&mut self, bindings: HashMap<HeapRef, Value>) {
        self.frames.push(bindings);
    }

    /// Panics if called with no open frame — paired misuse is a host bug,
    /// not a recoverable language-level condition (mirrors the Root/Drop
    /// discipline in `ember_core::heap`).
    pub fn pop_bindings(&mut self) {
        assert!(self.frames.pop().is_some(), "pop_bindings with no open frame");
    }

    pub fn lookup(&self, var: HeapRef) -> Option<&Value> {
        self.frames.iter().rev().find_map(|f| f.get(&var))
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Every bound value across every open frame, for GC root enumeration
    /// (§3: "the current binding stack").
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.frames.iter().flat_map(|f| f.values().cloned())
    }
}

/// Read a Var's effective value: the top binding-stack override if one
/// exists, else its root (§4.4).
pub fn var_value(heap: &Heap, bindings: &BindingStack, var: HeapRef) -> Value {
    if let Some(v) = bindings.lookup(var) {
        return v.clone();
    }
    match &heap.get(var).payload {
        Payload::Var(v) => v.root.borrow().clone(),
        _ => panic!("var_value called on a non-Var heap object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Symbol as Sym;

    #[test]
    fn define_then_resolve_unqualified() {
        let mut heap = Heap::new(64);
        let meta_ty = heap.bootstrap_meta_type();
        let mut reg = NamespaceRegistry::new();
        let sym = Sym::unqualified("x");
        let r = reg.define(&mut heap, meta_ty, "user", sym, Value::Int(1), Value::Nil);
        assert_eq!(reg.resolve_var("user", sym), Some(r));
    }

    #[test]
    fn redefine_updates_root_in_place() {
        let mut heap = Heap::new(64);
        let meta_ty = heap.bootstrap_meta_type();
        let mut reg = NamespaceRegistry::new();
        let sym = Sym::unqualified("x");
        let r1 = reg.define(&mut heap, meta_ty, "user", sym, Value::Int(1), Value::Nil);
        let r2 = reg.define(&mut heap, meta_ty, "user", sym, Value::Int(2), Value::Nil);
        assert_eq!(r1, r2, "redefine must reuse the existing Var");
        let bindings = BindingStack::new();
        assert_eq!(var_value(&heap, &bindings, r1), Value::Int(2));
    }

    #[test]
    fn binding_stack_overrides_root_until_popped() {
        let mut heap = Heap::new(64);
        let meta_ty = heap.bootstrap_meta_type();
        let mut reg = NamespaceRegistry::new();
        let r = reg.define(&mut heap, meta_ty, "user", Sym::unqualified("x"), Value::Int(1), Value::Nil);
        let mut bindings = BindingStack::new();
        assert_eq!(var_value(&heap, &bindings, r), Value::Int(1));
        let mut frame = HashMap::new();
        frame.insert(r, Value::Int(99));
        bindings.push_bindings(frame);
        assert_eq!(var_value(&heap, &bindings, r), Value::Int(99));
        bindings.pop_bindings();
        assert_eq!(var_value(&heap, &bindings, r), Value::Int(1));
    }

    #[test]
    fn refer_copies_entries() {
        let mut heap = Heap::new(64);
        let meta_ty = heap.bootstrap_meta_type();
        let mut reg = NamespaceRegistry::new();
        reg.define(&mut heap, meta_ty, "user.core", Sym::unqualified("f"), Value::Int(1), Value::Nil);
        reg.refer("user", "user.core");
        assert!(reg.resolve_var("user", Sym::unqualified("f")).is_some());
    }
}
