//! The `fn*`-form-to-bytecode compiler (§4.6).
//!
//! Special forms: `quote`, `if`, `do`, `let*`, `loop*`, `recur`, `fn*`,
//! `def`, `throw`, `try*`/`catch*`/`finally*` (the un-starred
//! `catch`/`finally` spellings are accepted too). Everything else in call
//! position compiles as an ordinary `CALL` — arithmetic, `=`, `str` and the
//! rest of the small builtin set are bound as [`ember_runtime::prelude`]
//! `NativeFn` vars, not inlined opcodes, so they need no special-casing
//! here at all.
//!
//! Nested `fn*` literals do not capture their enclosing scope: a reference
//! to an outer `let*`/`loop*`/parameter binding from inside a nested `fn*`
//! is a `CompilationError`, not silent miscompilation. Top-level `fn*`
//! forms (the only ones a namespace actually installs as a var's value)
//! never have an enclosing scope to begin with, so this only bites
//! interior closures — an explicit, documented scope decision (DESIGN.md)
//! rather than an oversight; `vm.rs`'s `IFN` opcode remains exercised only
//! by its own unit tests, same as `LDDF`/`STDF`/`LDSF`/`STSF`.

mod body;

use ember_core::config::Config;
use ember_core::{Heap, HeapRef, Payload, Value};
use ember_runtime::exception::{self, ExceptionKind};
use ember_runtime::namespace::{var_value, BindingStack, NamespaceRegistry};
use ember_runtime::vm::Vm;
use std::collections::HashSet;

fn compile_err(heap: &mut Heap, meta_type: HeapRef, msg: impl Into<String>) -> Value {
    exception::make_exception(heap, meta_type, ExceptionKind::CompilationError, &msg.into(), Value::Nil)
}

/// Compile a top-level `(fn* ...)` form into a `BytecodeFn` heap value.
/// Macroexpands first (§4.6: "compilation macroexpands the whole form,
/// repeatedly, up to `Config::max_macroexpand_depth`").
pub fn compile_fn(
    heap: &mut Heap,
    meta_type: HeapRef,
    registry: &mut NamespaceRegistry,
    bindings: &mut BindingStack,
    vm: &mut Vm,
    cfg: &Config,
    ns: &str,
    form: Value,
) -> Result<Value, Value> {
    let expanded = macroexpand(heap, meta_type, registry, bindings, vm, cfg, ns, form)?;
    body::compile_fn_form(heap, meta_type, registry, bindings, vm, cfg, ns, &HashSet::new(), expanded)
}

/// Compile an arbitrary top-level expression (not necessarily a `fn*`) by
/// wrapping it in a synthetic zero-arg `fn*` and returning the compiled
/// body's bytecode directly runnable via `vm.call(heap, ..., fn_value, [])`.
/// `emberc`'s `run` subcommand uses this for top-level forms in a script.
pub fn compile_toplevel(
    heap: &mut Heap,
    meta_type: HeapRef,
    registry: &mut NamespaceRegistry,
    bindings: &mut BindingStack,
    vm: &mut Vm,
    cfg: &Config,
    ns: &str,
    form: Value,
) -> Result<Value, Value> {
    compile_fn(heap, meta_type, registry, bindings, vm, cfg, ns, wrap_as_thunk(heap, meta_type, form))
}

fn wrap_as_thunk(heap: &mut Heap, meta_type: HeapRef, form: Value) -> Value {
    use ember_core::collections::list::List;
    use ember_core::collections::vector::PersistentVector;
    let params = heap.alloc_static(meta_type, Payload::Vector(PersistentVector::empty())).value();
    let clause: List = [params, form].into_iter().collect();
    let clause_val = heap.alloc_static(meta_type, Payload::ListVal(clause)).value();
    let thunk: List = [Value::Symbol(ember_core::Symbol::unqualified("fn*")), clause_val].into_iter().collect();
    heap.alloc_static(meta_type, Payload::ListVal(thunk)).value()
}

/// One macroexpansion step: if `form` is a call whose head resolves to a
/// var carrying truthy `:macro` metadata, invoke it with `(form, nil)` and
/// return its result; otherwise return `form` unchanged.
fn macroexpand1(
    heap: &mut Heap,
    _meta_type: HeapRef,
    registry: &NamespaceRegistry,
    bindings: &mut BindingStack,
    vm: &mut Vm,
    ns: &str,
    form: &Value,
) -> Result<(Value, bool), Value> {
    let Some(items) = body::list_items(heap, form) else {
        return Ok((form.clone(), false));
    };
    let Some(Value::Symbol(sym)) = items.first() else {
        return Ok((form.clone(), false));
    };
    let Some(var_ref) = registry.resolve_var(ns, *sym) else {
        return Ok((form.clone(), false));
    };
    let is_macro = match &heap.get(var_ref).payload {
        Payload::Var(v) => is_truthy_macro_meta(heap, &v.meta.borrow()),
        _ => false,
    };
    if !is_macro {
        return Ok((form.clone(), false));
    }
    let macro_fn = var_value(heap, bindings, var_ref);
    let expanded = vm
        .call(heap, registry, bindings, macro_fn, vec![form.clone(), Value::Nil])
        .map_err(|e| match e {
            ember_runtime::vm::VmError::Exception(v) => v,
            ember_runtime::vm::VmError::CorruptBytecode(msg) => Value::str(format!("macroexpansion failed: {msg}")),
        })?;
    Ok((expanded, true))
}

fn is_truthy_macro_meta(heap: &Heap, meta: &Value) -> bool {
    let Value::Obj(r) = meta else { return false };
    let Payload::Map(m) = &heap.get(*r).payload else { return false };
    m.get(&Value::Keyword(ember_core::Keyword::unqualified("macro"))).is_some_and(|v| v.is_truthy())
}

fn macroexpand(
    heap: &mut Heap,
    meta_type: HeapRef,
    registry: &NamespaceRegistry,
    bindings: &mut BindingStack,
    vm: &mut Vm,
    cfg: &Config,
    ns: &str,
    form: Value,
) -> Result<Value, Value> {
    let mut current = form;
    for _ in 0..cfg.max_macroexpand_depth {
        let (next, was_macro) = macroexpand1(heap, meta_type, registry, bindings, vm, ns, &current)?;
        if !was_macro {
            return Ok(next);
        }
        current = next;
    }
    Err(compile_err(heap, meta_type, "macroexpansion depth exceeded"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::sym::Symbol;
    use ember_runtime::vm::VmError;

    fn fresh() -> (Heap, HeapRef, NamespaceRegistry, BindingStack, Vm, Config) {
        let mut heap = Heap::new(64);
        let meta = heap.bootstrap_meta_type();
        let mut registry = NamespaceRegistry::new();
        ember_runtime::install_prelude(&mut heap, meta, &mut registry, "user");
        let bindings = BindingStack::new();
        let vm = Vm::new(&mut heap, 64);
        let cfg = Config::default();
        (heap, meta, registry, bindings, vm, cfg)
    }

    fn read1(heap: &mut Heap, meta: HeapRef, src: &str) -> Value {
        ember_reader::read(heap, meta, src).unwrap()
    }

    #[test]
    fn compiles_and_runs_identity_fn() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(&mut heap, meta, "(fn* [x] x)");
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![Value::Int(42)]).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn overflow_raises_arithmetic_exception_through_compiled_plus() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(&mut heap, meta, "(fn* [a b] (+ a b))");
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let err = vm.call(&mut heap, &registry, &mut bindings, f, vec![Value::Int(i64::MAX), Value::Int(1)]).unwrap_err();
        match err {
            VmError::Exception(v) => assert_eq!(exception::type_name_of(&heap, &v).as_deref(), Some("ArithmeticException")),
            other => panic!("expected an exception, got {other:?}"),
        }
    }

    #[test]
    fn recur_compiles_a_tail_loop() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(
            &mut heap,
            meta,
            "(fn* [n] (loop* [acc 0 i n] (if (= i 0) acc (recur (+ acc i) (- i 1)))))",
        );
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![Value::Int(5)]).unwrap();
        assert_eq!(result, Value::Int(15));
    }

    #[test]
    fn try_catch_binds_the_exception_and_runs_the_handler() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(
            &mut heap,
            meta,
            r#"(fn* [] (try* (+ 1 2) (catch* ArithmeticException e (str "caught " (get-message e)))))"#,
        );
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![]).unwrap();
        assert_eq!(result, Value::Int(3));
    }

    #[test]
    fn new_and_throw_are_caught_by_a_matching_catch_clause() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(
            &mut heap,
            meta,
            r#"(fn* [] (try* (throw (new IllegalArgument "x")) (catch IllegalArgument e (str "caught " (get-message e)))))"#,
        );
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![]).unwrap();
        assert_eq!(result, Value::str("caught x"));
    }

    #[test]
    fn try_catch_catches_a_thrown_arithmetic_overflow() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(
            &mut heap,
            meta,
            r#"(fn* [] (try* (+ 9223372036854775807 1) (catch ArithmeticException e (str "caught " (get-message e)))))"#,
        );
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![]).unwrap();
        match result {
            Value::Str(s) => assert!(s.starts_with("caught ")),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn recur_sums_ten_thousand_iterations_without_growing_the_frame() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(&mut heap, meta, "(fn* f [n acc] (if (= n 0) acc (recur (- n 1) (+ acc n))))");
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![Value::Int(10000), Value::Int(0)]).unwrap();
        assert_eq!(result, Value::Int(50005000));
    }

    #[test]
    fn apply_on_a_fixed_arity_fn_with_wrong_seq_length_raises_call_error() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(&mut heap, meta, "(fn* [xs two] (apply* two xs))");
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let seq = read1(&mut heap, meta, "(1 2 3)");
        let two_ary = read1(&mut heap, meta, "(fn* [a b] (+ a b))");
        let two_ary_fn = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", two_ary).unwrap();
        let err = vm.call(&mut heap, &registry, &mut bindings, f, vec![seq, two_ary_fn]).unwrap_err();
        match err {
            VmError::Exception(v) => assert_eq!(exception::type_name_of(&heap, &v).as_deref(), Some("CallError")),
            other => panic!("expected a CallError exception, got {other:?}"),
        }
    }

    #[test]
    fn apply_spreads_the_trailing_seq() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(&mut heap, meta, "(fn* [xs] (apply* + xs))");
        let f = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        let list_form = read1(&mut heap, meta, "(1 2 3)");
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![list_form]).unwrap();
        assert_eq!(result, Value::Int(6));
    }

    #[test]
    fn def_binds_a_var_whose_value_is_then_visible() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(&mut heap, meta, "(def answer 42)");
        let f = compile_toplevel(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap();
        vm.call(&mut heap, &registry, &mut bindings, f, vec![]).unwrap();
        let var_ref = registry.resolve_var("user", Symbol::unqualified("answer")).unwrap();
        assert_eq!(var_value(&heap, &bindings, var_ref), Value::Int(42));
    }

    #[test]
    fn closure_over_an_outer_let_binding_is_a_compile_error() {
        let (mut heap, meta, mut registry, mut bindings, mut vm, cfg) = fresh();
        let form = read1(&mut heap, meta, "(fn* [] (let* [x 1] (fn* [] x)))");
        let err = compile_fn(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, "user", form).unwrap_err();
        assert_eq!(exception::type_name_of(&heap, &err).as_deref(), Some("CompilationError"));
    }
}
