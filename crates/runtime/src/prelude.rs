//! The small set of builtin functions installed as ordinary vars (§4.6:
//! "all other call forms compile as calls" — arithmetic, `=`, `str` and
//! friends are not special forms, so they need to be *something* a `CALL`
//! can dispatch to). Each one is a `Value::NativeFn(id)` bound to a var;
//! `vm::call_value` resolves the id against [`Vm::natives`] the same way
//! it resolves a `BytecodeFn` ref against the heap.
//!
//! A native is a plain `fn` pointer rather than a boxed closure: several of
//! them (`apply*`) need to call back into the VM they were dispatched from,
//! and a `fn` pointer can be copied out of the dispatch table before that
//! reentrant call, sidestepping a `&mut self` borrow conflict a closure
//! capturing `&Vm` would hit.

use crate::exception::{self, ExceptionKind};
use crate::namespace::{BindingStack, NamespaceRegistry};
use crate::vm::{Vm, VmError};
use ember_core::value::NativeFnId;
use ember_core::{Heap, Payload, Symbol, Value};
use std::collections::HashMap;

pub type NativeImpl = fn(&mut Heap, &NamespaceRegistry, &mut BindingStack, &mut Vm, Vec<Value>) -> Result<Value, VmError>;

pub const ADD: u32 = 0;
pub const SUB: u32 = 1;
pub const MUL: u32 = 2;
pub const NEG_OR_SUB: u32 = 3;
pub const EQ: u32 = 4;
pub const STR: u32 = 5;
pub const GET_MESSAGE: u32 = 6;
pub const APPLY_FN: u32 = 7;
pub const PRINTLN: u32 = 8;
pub const CONJ: u32 = 9;
pub const COUNT: u32 = 10;
pub const FIRST: u32 = 11;
pub const REST: u32 = 12;
pub const GET: u32 = 13;
pub const NTH: u32 = 14;
pub const VECTOR: u32 = 15;
pub const HASH_MAP: u32 = 16;
pub const HASH_SET: u32 = 17;
pub const LIST: u32 = 18;
pub const ASSOC: u32 = 19;
pub const NEW_EXCEPTION: u32 = 20;

fn raise(heap: &mut Heap, meta_type: ember_core::HeapRef, kind: ExceptionKind, message: &str) -> VmError {
    VmError::Exception(exception::make_exception(heap, meta_type, kind, message, Value::Nil))
}

fn variadic_fold(
    heap: &mut Heap,
    vm: &Vm,
    args: Vec<Value>,
    identity: i64,
    op: fn(i64, i64) -> Result<i64, ExceptionKind>,
) -> Result<Value, VmError> {
    let mut acc = identity;
    for a in &args {
        let n = crate::builtins::unbox_i64(a).map_err(|k| raise(heap, vm.meta_type, k, "non-numeric argument"))?;
        acc = op(acc, n).map_err(|k| raise(heap, vm.meta_type, k, "integer overflow"))?;
    }
    Ok(Value::Int(acc))
}

fn native_add(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    variadic_fold(heap, vm, args, 0, crate::builtins::add_i64)
}

fn native_mul(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    variadic_fold(heap, vm, args, 1, crate::builtins::mul_i64)
}

/// `-`: unary negation with one arg, left-fold subtraction with two or more
/// (Clojure's own `-` semantics, the only sensible reading of "`-`" as a
/// variadic arithmetic primitive).
fn native_sub(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let mut it = args.into_iter();
    let Some(first) = it.next() else {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "- needs at least 1 argument"));
    };
    let first = crate::builtins::unbox_i64(&first).map_err(|k| raise(heap, vm.meta_type, k, "non-numeric argument"))?;
    let rest: Vec<Value> = it.collect();
    if rest.is_empty() {
        let v = crate::builtins::neg_i64(first).map_err(|k| raise(heap, vm.meta_type, k, "integer overflow"))?;
        return Ok(Value::Int(v));
    }
    let mut acc = first;
    for a in rest {
        let n = crate::builtins::unbox_i64(&a).map_err(|k| raise(heap, vm.meta_type, k, "non-numeric argument"))?;
        acc = crate::builtins::sub_i64(acc, n).map_err(|k| raise(heap, vm.meta_type, k, "integer overflow"))?;
    }
    Ok(Value::Int(acc))
}

fn native_eq(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 2 {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "= takes exactly 2 arguments"));
    }
    Ok(Value::from(crate::builtins::obj_eq(heap, &args[0], &args[1])))
}

/// A minimal, `str`-only stringifier for the atomic value kinds the
/// prelude's own callers (exception messages, `println`) plausibly need.
/// Full recursive printing of collections is the reader crate's job
/// (`pr_str`); this stays local to avoid `ember-runtime` depending on
/// `ember-reader` just to implement `str`.
fn human_str(heap: &Heap, v: &Value) -> String {
    match v {
        Value::Nil => String::new(),
        Value::Str(s) => s.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Int48(i) => i.to_string(),
        Value::Char(c) => c.to_string(),
        Value::Symbol(s) => s.to_string(),
        Value::Keyword(k) => k.to_string(),
        Value::NativeFn(id) => format!("#<native-fn {}>", id.0),
        Value::Obj(r) => match exception::type_name_of(heap, v) {
            Some(name) => format!("#<{name}>"),
            None => format!("#<object {}>", r.0),
        },
    }
}

fn native_str(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, _vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let mut out = String::new();
    for a in &args {
        out.push_str(&human_str(heap, a));
    }
    Ok(Value::str(out))
}

fn native_get_message(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(exc) = args.first() else {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "get-message takes exactly 1 argument"));
    };
    match exception::message_of(heap, exc) {
        Some(msg) => Ok(Value::str(msg)),
        None => Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, "get-message on a non-exception value")),
    }
}

/// `(apply* f a b ... more-seq)`: the last argument is spread as a seq, the
/// rest are passed positionally, exactly like `Op::Apply` — this is the
/// call-path version, for when `apply*` itself is reached through an
/// ordinary `CALL` rather than inlined by the compiler.
fn native_apply(heap: &mut Heap, registry: &NamespaceRegistry, bindings: &mut BindingStack, vm: &mut Vm, mut args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() < 2 {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "apply* needs at least 2 arguments"));
    }
    let seq_val = args.pop().unwrap();
    let f = args.remove(0);
    let tail = crate::builtins::seq(heap, &seq_val).map_err(|k| raise(heap, vm.meta_type, k, "apply*'s trailing arg is not a seq"))?;
    args.extend(tail);
    vm.call(heap, registry, bindings, f, args)
}

fn native_println(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, _vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let parts: Vec<String> = args.iter().map(|a| human_str(heap, a)).collect();
    println!("{}", parts.join(" "));
    Ok(Value::Nil)
}

fn native_count(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(v) = args.first() else {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "count takes exactly 1 argument"));
    };
    crate::builtins::count(heap, v).map(Value::Int).map_err(|k| raise(heap, vm.meta_type, k, "count on an uncountable value"))
}

fn native_first(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(v) = args.first() else {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "first takes exactly 1 argument"));
    };
    crate::builtins::first(heap, v).map_err(|k| raise(heap, vm.meta_type, k, "first on a non-seqable value"))
}

fn native_rest(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(v) = args.first() else {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "rest takes exactly 1 argument"));
    };
    let items = crate::builtins::rest(heap, v).map_err(|k| raise(heap, vm.meta_type, k, "rest on a non-seqable value"))?;
    let roots = vm.value_stack.clone();
    let list: ember_core::collections::list::List = items.into_iter().collect();
    Ok(heap.alloc_static_rooted(vm.meta_type, Payload::ListVal(list), &roots).value())
}

fn native_get(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let (coll, key, default) = match args.len() {
        2 => (args[0].clone(), args[1].clone(), Value::Nil),
        3 => (args[0].clone(), args[1].clone(), args[2].clone()),
        _ => return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "get takes 2 or 3 arguments")),
    };
    crate::builtins::get(heap, &coll, &key, default).map_err(|k| raise(heap, vm.meta_type, k, "get on a non-associative value"))
}

fn native_nth(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 2 {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "nth takes exactly 2 arguments"));
    }
    let i = crate::builtins::unbox_i64(&args[1]).map_err(|k| raise(heap, vm.meta_type, k, "nth's index is not an int"))?;
    crate::builtins::nth(heap, &args[0], i).map_err(|k| raise(heap, vm.meta_type, k, "nth out of range"))
}

fn native_conj(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 2 {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "conj takes exactly 2 arguments"));
    }
    let (coll, item) = (&args[0], &args[1]);
    let roots = vm.value_stack.clone();
    match coll {
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::Vector(v) => {
                let v2 = v.conj(item.clone());
                Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Vector(v2), &roots).value())
            }
            Payload::ListVal(l) => {
                let l2 = l.cons(item.clone());
                Ok(heap.alloc_static_rooted(vm.meta_type, Payload::ListVal(l2), &roots).value())
            }
            Payload::Set(s) => {
                let s2 = s.conj(item.clone());
                Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Set(s2), &roots).value())
            }
            _ => Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, "conj on a non-collection value")),
        },
        Value::Nil => {
            let l: ember_core::collections::list::List = std::iter::once(item.clone()).collect();
            Ok(heap.alloc_static_rooted(vm.meta_type, Payload::ListVal(l), &roots).value())
        }
        _ => Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, "conj on a non-collection value")),
    }
}

fn native_assoc(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 3 {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "assoc takes exactly 3 arguments"));
    }
    let roots = vm.value_stack.clone();
    match &args[0] {
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::Map(m) => {
                let m2 = m.assoc(args[1].clone(), args[2].clone());
                Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Map(m2), &roots).value())
            }
            Payload::Vector(v) => {
                let Value::Int(i) = args[1] else {
                    return Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, "assoc on a vector needs an int index"));
                };
                if i < 0 {
                    return Err(raise(heap, vm.meta_type, ExceptionKind::IndexOutOfBounds, "assoc index out of range"));
                }
                let Some(v2) = v.assoc(i as usize, args[2].clone()) else {
                    return Err(raise(heap, vm.meta_type, ExceptionKind::IndexOutOfBounds, "assoc index out of range"));
                };
                Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Vector(v2), &roots).value())
            }
            _ => Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, "assoc on a non-associative value")),
        },
        Value::Nil => {
            let m = ember_core::collections::array_map::GenericMap::empty().assoc(args[1].clone(), args[2].clone());
            Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Map(m), &roots).value())
        }
        _ => Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, "assoc on a non-associative value")),
    }
}

fn native_vector(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let roots = vm.value_stack.clone();
    let v = ember_core::collections::vector::PersistentVector::from_vec(args);
    Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Vector(v), &roots).value())
}

fn native_list(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let roots = vm.value_stack.clone();
    let l: ember_core::collections::list::List = args.into_iter().collect();
    Ok(heap.alloc_static_rooted(vm.meta_type, Payload::ListVal(l), &roots).value())
}

fn native_hash_map(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() % 2 != 0 {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "hash-map needs an even number of arguments"));
    }
    let mut m = ember_core::collections::array_map::GenericMap::empty();
    let mut it = args.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        m = m.assoc(k, v);
    }
    let roots = vm.value_stack.clone();
    Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Map(m), &roots).value())
}

fn native_hash_set(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let mut s = ember_core::collections::array_map::GenericSet::empty();
    for a in args {
        s = s.conj(a);
    }
    let roots = vm.value_stack.clone();
    Ok(heap.alloc_static_rooted(vm.meta_type, Payload::Set(s), &roots).value())
}

/// `(new TypeName msg)` / `(new TypeName msg payload)` — constructs one of
/// the fixed §7 exception kinds by name (`(new IllegalArgument "x")` per
/// the try/catch seed scenario). The compiler's `new` special form passes
/// the type name as a plain string constant, since it's always a bare
/// symbol in source and there is no user-extensible type system to resolve
/// it against at runtime (§4.5's hierarchy only covers `derive`d keywords).
fn native_new_exception(heap: &mut Heap, _reg: &NamespaceRegistry, _b: &mut BindingStack, vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() < 2 || args.len() > 3 {
        return Err(raise(heap, vm.meta_type, ExceptionKind::CallError, "new takes a type name, a message and an optional payload"));
    }
    let Value::Str(type_name) = &args[0] else {
        return Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, "new's type name must resolve to a string"));
    };
    let Some(kind) = ExceptionKind::from_name(type_name) else {
        return Err(raise(heap, vm.meta_type, ExceptionKind::IllegalArgument, &format!("unknown exception type: {type_name}")));
    };
    let message = human_str(heap, &args[1]);
    let payload = args.get(2).cloned().unwrap_or(Value::Nil);
    Ok(exception::make_exception(heap, vm.meta_type, kind, &message, payload))
}

pub fn default_natives() -> HashMap<u32, NativeImpl> {
    let mut m: HashMap<u32, NativeImpl> = HashMap::new();
    m.insert(ADD, native_add);
    m.insert(SUB, native_sub);
    m.insert(MUL, native_mul);
    m.insert(NEG_OR_SUB, native_sub);
    m.insert(EQ, native_eq);
    m.insert(STR, native_str);
    m.insert(GET_MESSAGE, native_get_message);
    m.insert(APPLY_FN, native_apply);
    m.insert(PRINTLN, native_println);
    m.insert(CONJ, native_conj);
    m.insert(COUNT, native_count);
    m.insert(FIRST, native_first);
    m.insert(REST, native_rest);
    m.insert(GET, native_get);
    m.insert(NTH, native_nth);
    m.insert(VECTOR, native_vector);
    m.insert(HASH_MAP, native_hash_map);
    m.insert(HASH_SET, native_hash_set);
    m.insert(LIST, native_list);
    m.insert(ASSOC, native_assoc);
    m.insert(NEW_EXCEPTION, native_new_exception);
    m
}

/// Bind every prelude name as a var in `ns`, holding `Value::NativeFn(id)`.
/// The compiler resolves ordinary call-form heads (`+`, `str`, ...) against
/// whatever namespace they're compiled in, so this has to run before
/// compiling code that uses them — normally once, against a shared
/// `ember.core` namespace that user namespaces `refer` into.
pub fn install_prelude(heap: &mut Heap, meta_type: ember_core::HeapRef, registry: &mut NamespaceRegistry, ns: &str) {
    let bindings: &[(&str, u32)] = &[
        ("+", ADD),
        ("-", SUB),
        ("*", MUL),
        ("=", EQ),
        ("str", STR),
        ("get-message", GET_MESSAGE),
        ("apply*", APPLY_FN),
        ("println", PRINTLN),
        ("conj", CONJ),
        ("assoc", ASSOC),
        ("count", COUNT),
        ("first", FIRST),
        ("rest", REST),
        ("get", GET),
        ("nth", NTH),
        ("vector", VECTOR),
        ("hash-map", HASH_MAP),
        ("hash-set", HASH_SET),
        ("list", LIST),
        ("new-exception", NEW_EXCEPTION),
    ];
    for (name, id) in bindings {
        registry.define(heap, meta_type, ns, Symbol::unqualified(name), Value::NativeFn(NativeFnId(*id)), Value::Nil);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_mul_round_trip() {
        let mut heap = Heap::new(64);
        let mut vm = Vm::new(&mut heap, 64);
        let registry = NamespaceRegistry::new();
        let mut bindings = BindingStack::new();
        let sum = native_add(&mut heap, &registry, &mut bindings, &mut vm, vec![Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(sum, Value::Int(5));
        let diff = native_sub(&mut heap, &registry, &mut bindings, &mut vm, vec![Value::Int(5), Value::Int(3)]).unwrap();
        assert_eq!(diff, Value::Int(2));
        let neg = native_sub(&mut heap, &registry, &mut bindings, &mut vm, vec![Value::Int(5)]).unwrap();
        assert_eq!(neg, Value::Int(-5));
    }

    #[test]
    fn add_overflow_raises_arithmetic_exception() {
        let mut heap = Heap::new(64);
        let mut vm = Vm::new(&mut heap, 64);
        let registry = NamespaceRegistry::new();
        let mut bindings = BindingStack::new();
        let err = native_add(&mut heap, &registry, &mut bindings, &mut vm, vec![Value::Int(i64::MAX), Value::Int(1)]).unwrap_err();
        match err {
            VmError::Exception(v) => assert_eq!(exception::type_name_of(&heap, &v).as_deref(), Some("ArithmeticException")),
            other => panic!("expected an exception, got {other:?}"),
        }
    }

    #[test]
    fn str_concatenates_human_readable_forms() {
        let mut heap = Heap::new(64);
        let mut vm = Vm::new(&mut heap, 64);
        let registry = NamespaceRegistry::new();
        let mut bindings = BindingStack::new();
        let s = native_str(&mut heap, &registry, &mut bindings, &mut vm, vec![Value::str("caught "), Value::str("boom")]).unwrap();
        assert_eq!(s, Value::str("caught boom"));
    }

    #[test]
    fn install_prelude_binds_plus_as_a_native_fn_var() {
        let mut heap = Heap::new(64);
        let meta = heap.bootstrap_meta_type();
        let mut registry = NamespaceRegistry::new();
        install_prelude(&mut heap, meta, &mut registry, "user");
        let r = registry.resolve_var("user", Symbol::unqualified("+")).unwrap();
        let bindings = BindingStack::new();
        assert_eq!(crate::namespace::var_value(&heap, &bindings, r), Value::NativeFn(NativeFnId(ADD)));
    }
}
