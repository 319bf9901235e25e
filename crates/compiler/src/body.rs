//! Per-arity body codegen (§4.6): locals/recur addressing, the virtual
//! stack-depth counter that drives exception-table construction, and the
//! special-form dispatch table. One [`BodyCompiler`] instance compiles
//! exactly one `fn*` clause into one [`BytecodeFnBody`].

use ember_core::bytecode::{BytecodeFnBody, BytecodeFnData, ExceptionEntry, ExceptionTable, Op};
use ember_core::collections::array_map::{GenericMap, GenericSet};
use ember_core::collections::vector::PersistentVector;
use ember_core::config::Config;
use ember_core::{Heap, HeapRef, Payload, Symbol, Value};
use ember_runtime::exception::{self, ExceptionKind};
use ember_runtime::namespace::{BindingStack, NamespaceRegistry};
use ember_runtime::vm::Vm;
use std::collections::{HashMap, HashSet};

/// An active `recur` target: the function's own entry, or a nested `loop*`.
struct RecurTarget {
    entry_ip: usize,
    slots: Vec<i16>,
}

fn compile_err(heap: &mut Heap, meta_type: HeapRef, msg: impl Into<String>) -> Value {
    exception::make_exception(heap, meta_type, ExceptionKind::CompilationError, &msg.into(), Value::Nil)
}

pub(crate) fn list_items(heap: &Heap, v: &Value) -> Option<Vec<Value>> {
    match v {
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::ListVal(l) => Some(l.iter().cloned().collect()),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn vector_items(heap: &Heap, v: &Value) -> Option<Vec<Value>> {
    match v {
        Value::Obj(r) => match &heap.get(*r).payload {
            Payload::Vector(vec) => Some(vec.iter().cloned().collect()),
            _ => None,
        },
        _ => None,
    }
}

fn as_symbol(v: &Value) -> Option<Symbol> {
    match v {
        Value::Symbol(s) => Some(*s),
        _ => None,
    }
}

/// A bare (unqualified-or-not, ignoring namespace) symbol name match — the
/// special-form heads are reserved words, never namespace-qualified in
/// practice, but resolving by name alone keeps this robust either way.
fn head_name(heap: &Heap, form: &Value) -> Option<String> {
    let items = list_items(heap, form)?;
    let first = items.first()?;
    as_symbol(first).map(|s| s.name().to_string())
}

pub struct BodyCompiler<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) meta_type: HeapRef,
    pub(crate) registry: &'a mut NamespaceRegistry,
    pub(crate) bindings: &'a mut BindingStack,
    pub(crate) vm: &'a mut Vm,
    pub(crate) cfg: &'a Config,
    pub(crate) ns: String,
    /// Names bound by enclosing `fn*`/`let*`/`loop*` scopes this body is
    /// nested within — used only to produce a clear diagnostic, since
    /// nested `fn*` literals here never capture (see module docs in lib.rs).
    enclosing_locals: HashSet<String>,
    scopes: Vec<HashMap<String, i16>>,
    next_local_slot: u16,
    locals_size: u16,
    consts: Vec<Value>,
    vars: Vec<String>,
    code: Vec<u8>,
    depth: i64,
    recur_targets: Vec<RecurTarget>,
    exception_table: Vec<ExceptionEntry>,
}

impl<'a> BodyCompiler<'a> {
    pub fn new(
        heap: &'a mut Heap,
        meta_type: HeapRef,
        registry: &'a mut NamespaceRegistry,
        bindings: &'a mut BindingStack,
        vm: &'a mut Vm,
        cfg: &'a Config,
        ns: String,
        enclosing_locals: HashSet<String>,
    ) -> Self {
        BodyCompiler {
            heap,
            meta_type,
            registry,
            bindings,
            vm,
            cfg,
            ns,
            enclosing_locals,
            scopes: vec![HashMap::new()],
            next_local_slot: 0,
            locals_size: 0,
            consts: Vec::new(),
            vars: Vec::new(),
            code: Vec::new(),
            depth: 0,
            recur_targets: Vec::new(),
            exception_table: Vec::new(),
        }
    }

    fn err(&mut self, msg: impl Into<String>) -> Value {
        compile_err(self.heap, self.meta_type, msg)
    }

    // -- emission -------------------------------------------------------

    fn emit_op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    fn emit_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    fn emit_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i16(&mut self, v: i16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    /// Patch a previously-emitted `i16` branch offset at `operand_at` so it
    /// lands at the current position (`here()`), relative to the first byte
    /// *after* the 2-byte operand (matching `Op::Br`'s `ip + off` convention
    /// in vm.rs, where `ip` has already moved past the operand by then).
    fn patch_branch(&mut self, operand_at: usize) {
        let target = self.here() as i64;
        let after_operand = (operand_at + 2) as i64;
        let off = (target - after_operand) as i16;
        self.code[operand_at..operand_at + 2].copy_from_slice(&off.to_le_bytes());
    }

    fn const_idx(&mut self, v: Value) -> u16 {
        if let Some(i) = self.consts.iter().position(|c| *c == v) {
            return i as u16;
        }
        self.consts.push(v);
        (self.consts.len() - 1) as u16
    }

    fn var_idx(&mut self, qualified: String) -> u16 {
        if let Some(i) = self.vars.iter().position(|v| *v == qualified) {
            return i as u16;
        }
        self.vars.push(qualified);
        (self.vars.len() - 1) as u16
    }

    fn qualify(&self, sym: Symbol) -> String {
        match sym.namespace() {
            Some(ns) => format!("{ns}/{}", sym.name()),
            None => format!("{}/{}", self.ns, sym.name()),
        }
    }

    // -- locals -----------------------------------------------------------

    fn alloc_local(&mut self) -> i16 {
        let slot = self.next_local_slot as i16;
        self.next_local_slot += 1;
        self.locals_size = self.locals_size.max(self.next_local_slot);
        slot
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: String, slot: i16) {
        self.scopes.last_mut().expect("at least one scope always open").insert(name, slot);
    }

    fn resolve_local(&self, name: &str) -> Option<i16> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    // -- entry point --------------------------------------------------

    /// Bind `params` at their negative slots and compile `body` as an
    /// implicit `do`, producing a finished [`BytecodeFnBody`].
    pub fn compile_clause(mut self, params: &[Value], is_variadic: bool, body: &[Value]) -> Result<BytecodeFnBody, Value> {
        let fixed_count = if is_variadic { params.len() - 1 } else { params.len() };
        let total_slots = fixed_count + usize::from(is_variadic);

        let mut param_slots = Vec::with_capacity(total_slots);
        for (i, p) in params.iter().enumerate() {
            let Some(sym) = as_symbol(p) else {
                return Err(self.err("fn* parameter must be a symbol"));
            };
            if sym.name().as_ref() == "&" {
                continue;
            }
            let slot = (i as i64 - total_slots as i64) as i16;
            self.bind(sym.name().to_string(), slot);
            param_slots.push(slot);
        }

        self.recur_targets.push(RecurTarget { entry_ip: 0, slots: param_slots });
        self.compile_do(body)?;
        self.emit_op(Op::Ret);
        self.recur_targets.pop();

        let arity = if is_variadic { -((fixed_count as i32) + 1) } else { fixed_count as i32 };
        Ok(BytecodeFnBody {
            arity,
            consts: self.consts,
            vars: self.vars,
            locals_size: self.locals_size,
            code: self.code,
            exception_table: ExceptionTable { entries: self.exception_table },
        })
    }

    // -- do / implicit sequencing ---------------------------------------

    /// Compile `forms` so that only the last one's value survives on the
    /// stack (net effect: `+1`); an empty sequence compiles to `nil`.
    fn compile_do(&mut self, forms: &[Value]) -> Result<(), Value> {
        if forms.is_empty() {
            self.emit_op(Op::Cnil);
            self.depth += 1;
            return Ok(());
        }
        for (i, f) in forms.iter().enumerate() {
            self.compile_expr(f.clone())?;
            if i + 1 < forms.len() {
                let was_throw = self.heap_matches_throw(f);
                if !was_throw {
                    self.emit_op(Op::Pop);
                    self.depth -= 1;
                }
            }
        }
        Ok(())
    }

    fn heap_matches_throw(&self, f: &Value) -> bool {
        head_name(self.heap, f).as_deref() == Some("throw")
    }

    // -- literal self-evaluation -----------------------------------------

    fn is_self_evaluating(&self, v: &Value) -> bool {
        match v {
            Value::Nil | Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Keyword(_) | Value::Char(_) | Value::Int48(_) | Value::NativeFn(_) => true,
            Value::Symbol(_) => false,
            Value::Obj(r) => match &self.heap.get(*r).payload {
                Payload::ListVal(l) => l.is_empty(),
                Payload::Vector(vec) => vec.iter().all(|e| self.is_self_evaluating(e)),
                Payload::Map(m) => m.seq().iter().all(|(k, v)| self.is_self_evaluating(k) && self.is_self_evaluating(v)),
                Payload::Set(s) => s.seq().iter().all(|e| self.is_self_evaluating(e)),
                _ => false,
            },
        }
    }

    // -- top-level expression dispatch -----------------------------------

    pub(crate) fn compile_expr(&mut self, form: Value) -> Result<(), Value> {
        match &form {
            Value::Nil | Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Keyword(_) | Value::Char(_) | Value::Int48(_) | Value::NativeFn(_) => {
                self.push_const(form);
                Ok(())
            }
            Value::Symbol(sym) => self.compile_symbol(*sym),
            Value::Obj(r) => {
                let payload_kind = match &self.heap.get(*r).payload {
                    Payload::ListVal(l) if !l.is_empty() => PayloadKind::Call,
                    Payload::ListVal(_) => PayloadKind::SelfEval,
                    Payload::Vector(_) | Payload::Map(_) | Payload::Set(_) => PayloadKind::Collection,
                    _ => PayloadKind::SelfEval,
                };
                match payload_kind {
                    PayloadKind::SelfEval => {
                        self.push_const(form);
                        Ok(())
                    }
                    PayloadKind::Collection => self.compile_collection(form),
                    PayloadKind::Call => self.compile_list(form),
                }
            }
        }
    }

    fn push_const(&mut self, v: Value) {
        let idx = self.const_idx(v);
        self.emit_op(Op::Ldc);
        self.emit_u16(idx);
        self.depth += 1;
    }

    fn compile_symbol(&mut self, sym: Symbol) -> Result<(), Value> {
        let name = sym.name().to_string();
        if sym.namespace().is_none() {
            if let Some(slot) = self.resolve_local(&name) {
                self.emit_op(Op::Ldl);
                self.emit_i16(slot);
                self.depth += 1;
                return Ok(());
            }
            if self.enclosing_locals.contains(&name) {
                return Err(self.err(format!("closures over enclosing locals are not supported: `{name}`")));
            }
        }
        let qualified = self.qualify(sym);
        let idx = self.var_idx(qualified);
        self.emit_op(Op::Lddv);
        self.emit_u16(idx);
        self.depth += 1;
        Ok(())
    }

    fn compile_collection(&mut self, form: Value) -> Result<(), Value> {
        if self.is_self_evaluating(&form) {
            self.push_const(form);
            return Ok(());
        }
        let Value::Obj(r) = &form else { unreachable!() };
        enum Kind {
            Vector(Vec<Value>),
            Set(Vec<Value>),
            Map(Vec<(Value, Value)>),
        }
        let kind = match &self.heap.get(*r).payload {
            Payload::Vector(vec) => Kind::Vector(vec.iter().cloned().collect()),
            Payload::Set(s) => Kind::Set(s.seq()),
            Payload::Map(m) => Kind::Map(m.seq()),
            _ => unreachable!("compile_collection called on a non-collection payload"),
        };
        match kind {
            Kind::Vector(elems) => {
                let empty = self.heap.alloc_static(self.meta_type, Payload::Vector(PersistentVector::empty())).value();
                self.build_via_conj(empty, elems)
            }
            Kind::Set(elems) => {
                let empty = self.heap.alloc_static(self.meta_type, Payload::Set(GenericSet::empty())).value();
                self.build_via_conj(empty, elems)
            }
            Kind::Map(entries) => self.build_map_via_assoc(entries),
        }
    }

    /// `let temp = empty; for each el: temp = (conj temp el); temp` — avoids
    /// needing a fn-pushed-before-args ordering trick by round-tripping the
    /// accumulator through a scratch local between iterations.
    fn build_via_conj(&mut self, empty: Value, elems: Vec<Value>) -> Result<(), Value> {
        let temp = self.alloc_local();
        self.push_const(empty);
        self.emit_op(Op::Stl);
        self.emit_i16(temp);
        self.depth -= 1;
        for el in elems {
            self.compile_symbol_ref_to_var("conj")?;
            self.emit_op(Op::Ldl);
            self.emit_i16(temp);
            self.depth += 1;
            self.compile_expr(el)?;
            self.emit_op(Op::Call);
            self.emit_u8(2);
            self.depth -= 2;
            self.emit_op(Op::Stl);
            self.emit_i16(temp);
            self.depth -= 1;
        }
        self.emit_op(Op::Ldl);
        self.emit_i16(temp);
        self.depth += 1;
        Ok(())
    }

    fn build_map_via_assoc(&mut self, entries: Vec<(Value, Value)>) -> Result<(), Value> {
        let empty = self.heap.alloc_static(self.meta_type, Payload::Map(GenericMap::empty())).value();
        let temp = self.alloc_local();
        self.push_const(empty);
        self.emit_op(Op::Stl);
        self.emit_i16(temp);
        self.depth -= 1;
        for (k, v) in entries {
            self.compile_symbol_ref_to_var("assoc")?;
            self.emit_op(Op::Ldl);
            self.emit_i16(temp);
            self.depth += 1;
            self.compile_expr(k)?;
            self.compile_expr(v)?;
            self.emit_op(Op::Call);
            self.emit_u8(3);
            self.depth -= 3;
            self.emit_op(Op::Stl);
            self.emit_i16(temp);
            self.depth -= 1;
        }
        self.emit_op(Op::Ldl);
        self.emit_i16(temp);
        self.depth += 1;
        Ok(())
    }

    /// Push a reference to a prelude var by bare name, in the current ns.
    fn compile_symbol_ref_to_var(&mut self, name: &str) -> Result<(), Value> {
        let qualified = format!("{}/{name}", self.ns);
        let idx = self.var_idx(qualified);
        self.emit_op(Op::Lddv);
        self.emit_u16(idx);
        self.depth += 1;
        Ok(())
    }

    // -- call forms: special forms + ordinary calls -----------------------

    fn compile_list(&mut self, form: Value) -> Result<(), Value> {
        let items = list_items(self.heap, &form).expect("checked non-empty ListVal above");
        if let Some(sym) = items.first().and_then(as_symbol) {
            if sym.namespace().is_none() {
                match sym.name().as_ref() {
                    "quote" => return self.compile_quote(&items),
                    "if" => return self.compile_if(&items),
                    "do" => return self.compile_do(&items[1..]),
                    "let*" => return self.compile_let(&items),
                    "loop*" => return self.compile_loop(&items),
                    "recur" => return self.compile_recur(&items),
                    "fn*" => return self.compile_fn_literal(form),
                    "def" => return self.compile_def(&items),
                    "throw" => return self.compile_throw(&items),
                    "try*" => return self.compile_try(&items),
                    "new" => return self.compile_new(&items),
                    _ => {}
                }
            }
        }
        self.compile_call(&items)
    }

    fn compile_quote(&mut self, items: &[Value]) -> Result<(), Value> {
        if items.len() != 2 {
            return Err(self.err("quote takes exactly 1 argument"));
        }
        self.push_const(items[1].clone());
        Ok(())
    }

    fn compile_if(&mut self, items: &[Value]) -> Result<(), Value> {
        if items.len() < 3 || items.len() > 4 {
            return Err(self.err("if takes a test, then-branch and optional else-branch"));
        }
        self.compile_expr(items[1].clone())?;
        self.depth -= 1;
        self.emit_op(Op::Bnil);
        let branch_to_else = self.here();
        self.emit_i16(0);

        let depth_before_then = self.depth;
        self.compile_expr(items[2].clone())?;
        self.emit_op(Op::Br);
        let branch_to_end = self.here();
        self.emit_i16(0);

        self.patch_branch(branch_to_else);
        self.depth = depth_before_then;
        match items.get(3) {
            Some(else_form) => self.compile_expr(else_form.clone())?,
            None => {
                self.emit_op(Op::Cnil);
                self.depth += 1;
            }
        }
        self.patch_branch(branch_to_end);
        Ok(())
    }

    /// `(let* [a v1 b v2 ...] body*)`.
    fn compile_let(&mut self, items: &[Value]) -> Result<(), Value> {
        if items.len() < 2 {
            return Err(self.err("let* needs a binding vector"));
        }
        let Some(bindings) = vector_items(self.heap, &items[1]) else {
            return Err(self.err("let*'s first argument must be a vector"));
        };
        if bindings.len() % 2 != 0 {
            return Err(self.err("let* binding vector must have an even number of forms"));
        }
        self.push_scope();
        let mut pairs = bindings.chunks(2);
        while let Some([name, val]) = pairs.next() {
            let Some(sym) = as_symbol(name) else {
                return Err(self.err("let* binding name must be a symbol"));
            };
            self.compile_expr(val.clone())?;
            let slot = self.alloc_local();
            self.emit_op(Op::Stl);
            self.emit_i16(slot);
            self.depth -= 1;
            self.bind(sym.name().to_string(), slot);
        }
        self.compile_do(&items[2..])?;
        self.pop_scope();
        Ok(())
    }

    /// `(loop* [a v1 b v2 ...] body*)` — same shape as `let*`, but
    /// establishes a `recur` target at the bindings' own slots.
    fn compile_loop(&mut self, items: &[Value]) -> Result<(), Value> {
        if items.len() < 2 {
            return Err(self.err("loop* needs a binding vector"));
        }
        let Some(bindings) = vector_items(self.heap, &items[1]) else {
            return Err(self.err("loop*'s first argument must be a vector"));
        };
        if bindings.len() % 2 != 0 {
            return Err(self.err("loop* binding vector must have an even number of forms"));
        }
        self.push_scope();
        let mut slots = Vec::new();
        let mut pairs = bindings.chunks(2);
        while let Some([name, val]) = pairs.next() {
            let Some(sym) = as_symbol(name) else {
                return Err(self.err("loop* binding name must be a symbol"));
            };
            self.compile_expr(val.clone())?;
            let slot = self.alloc_local();
            self.emit_op(Op::Stl);
            self.emit_i16(slot);
            self.depth -= 1;
            self.bind(sym.name().to_string(), slot);
            slots.push(slot);
        }
        let entry_ip = self.here();
        self.recur_targets.push(RecurTarget { entry_ip, slots });
        self.compile_do(&items[2..])?;
        self.recur_targets.pop();
        self.pop_scope();
        Ok(())
    }

    fn compile_recur(&mut self, items: &[Value]) -> Result<(), Value> {
        let Some(target) = self.recur_targets.last() else {
            return Err(self.err("recur outside of a fn* body or loop*"));
        };
        let slots = target.slots.clone();
        let entry_ip = target.entry_ip;
        let args = &items[1..];
        if args.len() != slots.len() {
            return Err(self.err(format!("recur arity mismatch: target takes {} args, got {}", slots.len(), args.len())));
        }
        for a in args {
            self.compile_expr(a.clone())?;
        }
        for &slot in slots.iter().rev() {
            self.emit_op(Op::Stl);
            self.emit_i16(slot);
            self.depth -= 1;
        }
        self.emit_op(Op::Br);
        let operand_at = self.here();
        self.emit_i16(0);
        let after_operand = (operand_at + 2) as i64;
        let off = (entry_ip as i64 - after_operand) as i16;
        self.code[operand_at..operand_at + 2].copy_from_slice(&off.to_le_bytes());
        Ok(())
    }

    /// `(def sym val?)` / `(def meta sym val?)`. The target var's heap
    /// identity is resolved at compile time (`NamespaceRegistry::ensure`)
    /// and embedded as a constant, since there is no bytecode opcode to
    /// push "a reference to the var named by this string" — only its
    /// current *value* (`LDV`/`LDDV`).
    fn compile_def(&mut self, items: &[Value]) -> Result<(), Value> {
        if items.len() < 2 {
            return Err(self.err("def needs at least a symbol"));
        }
        let (meta_form, sym, val_form): (Option<Value>, Symbol, Option<Value>) = if as_symbol(&items[1]).is_some() {
            (None, as_symbol(&items[1]).unwrap(), items.get(2).cloned())
        } else {
            let Some(sym) = items.get(2).and_then(as_symbol) else {
                return Err(self.err("def's second form must be a symbol when a meta map precedes it"));
            };
            (Some(items[1].clone()), sym, items.get(3).cloned())
        };

        let ns = self.ns.clone();
        let var_ref = self.registry.ensure(self.heap, self.meta_type, &ns, sym);
        self.push_const(Value::Obj(var_ref));
        match val_form {
            Some(v) => self.compile_expr(v)?,
            None => {
                self.emit_op(Op::Cnil);
                self.depth += 1;
            }
        }
        match meta_form {
            Some(m) => self.compile_expr(m)?,
            None => {
                self.emit_op(Op::Cnil);
                self.depth += 1;
            }
        }
        self.emit_op(Op::Setv);
        self.depth -= 3;
        // SETV leaves nothing on the stack; `def`'s own value in source
        // position is the var (mirroring Clojure's `def` returning the Var).
        self.push_const(Value::Obj(var_ref));
        Ok(())
    }

    fn compile_throw(&mut self, items: &[Value]) -> Result<(), Value> {
        if items.len() != 2 {
            return Err(self.err("throw takes exactly 1 argument"));
        }
        self.compile_expr(items[1].clone())?;
        self.emit_op(Op::Throw);
        // THROW never falls through; `depth` bookkeeping stays `+1` so any
        // caller treating this as an ordinary value-producing expression
        // (e.g. `do`'s "no POP after throw" rule, checked syntactically)
        // stays self-consistent even though the decrement never executes.
        Ok(())
    }

    /// `(new TypeName msg payload?)` — constructs one of the fixed exception
    /// kinds. `TypeName` is always a bare symbol in source, so its name is
    /// pushed as a compile-time string constant; only the message (and an
    /// optional payload) are evaluated at runtime.
    fn compile_new(&mut self, items: &[Value]) -> Result<(), Value> {
        if items.len() < 3 || items.len() > 4 {
            return Err(self.err("new takes a type name, a message and an optional payload"));
        }
        let Some(type_sym) = as_symbol(&items[1]) else {
            return Err(self.err("new's type name must be a symbol"));
        };
        self.compile_symbol_ref_to_var("new-exception")?;
        self.push_const(Value::str(type_sym.name().to_string()));
        self.compile_expr(items[2].clone())?;
        let n = if let Some(payload) = items.get(3) {
            self.compile_expr(payload.clone())?;
            3
        } else {
            2
        };
        self.emit_op(Op::Call);
        self.emit_u8(n);
        self.depth -= n as i64;
        Ok(())
    }

    /// `(try* expr* (catch* Type name handler*)* (finally* expr*)?)`. Also
    /// accepts the un-starred `catch`/`finally` spellings.
    fn compile_try(&mut self, items: &[Value]) -> Result<(), Value> {
        let mut body = Vec::new();
        let mut catches: Vec<(Option<String>, Symbol, Vec<Value>)> = Vec::new();
        let mut finally: Option<Vec<Value>> = None;
        for item in &items[1..] {
            let head = head_name(self.heap, item);
            match head.as_deref() {
                Some("catch*") | Some("catch") => {
                    let clause = list_items(self.heap, item).unwrap();
                    if clause.len() < 3 {
                        return Err(self.err("catch needs a type, a binding name, and a body"));
                    }
                    let type_name = match &clause[1] {
                        Value::Nil => None,
                        Value::Symbol(s) => Some(s.name().to_string()),
                        _ => return Err(self.err("catch's type must be a symbol or nil")),
                    };
                    let Some(bind_sym) = as_symbol(&clause[2]) else {
                        return Err(self.err("catch's binding must be a symbol"));
                    };
                    catches.push((type_name, bind_sym, clause[3..].to_vec()));
                }
                Some("finally*") | Some("finally") => {
                    let clause = list_items(self.heap, item).unwrap();
                    finally = Some(clause[1..].to_vec());
                }
                _ => body.push(item.clone()),
            }
        }

        let pre_try_depth = self.depth;
        let protected_start = self.here();
        self.compile_do(&body)?;
        self.emit_op(Op::Br);
        let branch_to_epilogue_from_body = self.here();
        self.emit_i16(0);
        let protected_end = self.here();
        self.depth = pre_try_depth;

        let mut branches_to_epilogue = vec![branch_to_epilogue_from_body];
        let mut handler_ips = Vec::new();
        for (type_name, bind_sym, handler_body) in &catches {
            handler_ips.push((self.here(), type_name.clone()));
            self.push_scope();
            self.depth = pre_try_depth + 1;
            let slot = self.alloc_local();
            self.emit_op(Op::Stl);
            self.emit_i16(slot);
            self.depth -= 1;
            self.bind(bind_sym.name().to_string(), slot);
            self.compile_do(handler_body)?;
            self.pop_scope();
            self.emit_op(Op::Br);
            branches_to_epilogue.push(self.here());
            self.emit_i16(0);
            self.depth = pre_try_depth;
        }

        let finally_catchall_ip = if let Some(fin) = &finally {
            let ip = self.here();
            self.depth = pre_try_depth + 1;
            let slot = self.alloc_local();
            self.emit_op(Op::Stl);
            self.emit_i16(slot);
            self.depth -= 1;
            self.compile_do(fin)?;
            self.emit_op(Op::Pop);
            self.depth -= 1;
            self.emit_op(Op::Ldl);
            self.emit_i16(slot);
            self.depth += 1;
            self.emit_op(Op::Throw);
            self.depth = pre_try_depth;
            Some(ip)
        } else {
            None
        };

        let epilogue_ip = self.here();
        for at in branches_to_epilogue {
            self.patch_branch(at);
        }
        self.depth = pre_try_depth;
        if let Some(fin) = &finally {
            self.compile_do(fin)?;
            self.emit_op(Op::Pop);
            self.depth -= 1;
        }
        self.depth = pre_try_depth + 1;

        for (ip, type_name) in handler_ips {
            self.exception_table.push(ExceptionEntry {
                start: protected_start as u32,
                end: protected_end as u32,
                handler: ip as u32,
                saved_stack_depth: pre_try_depth as u32,
                exc_type: type_name,
            });
        }
        if let Some(ip) = finally_catchall_ip {
            self.exception_table.push(ExceptionEntry {
                start: protected_start as u32,
                end: epilogue_ip as u32,
                handler: ip as u32,
                saved_stack_depth: pre_try_depth as u32,
                exc_type: None,
            });
        }
        Ok(())
    }

    /// A nested `fn*` literal. It never captures enclosing locals (see
    /// module docs), so the whole function value is a compile-time
    /// constant: compile it fully now and `LDC` the finished value.
    fn compile_fn_literal(&mut self, form: Value) -> Result<(), Value> {
        let mut enclosing = self.enclosing_locals.clone();
        for scope in &self.scopes {
            enclosing.extend(scope.keys().cloned());
        }
        let fn_value = compile_fn_form(
            self.heap,
            self.meta_type,
            self.registry,
            self.bindings,
            self.vm,
            self.cfg,
            &self.ns,
            &enclosing,
            form,
        )?;
        self.push_const(fn_value);
        Ok(())
    }

    fn compile_call(&mut self, items: &[Value]) -> Result<(), Value> {
        self.compile_expr(items[0].clone())?;
        let n = items.len() - 1;
        for a in &items[1..] {
            self.compile_expr(a.clone())?;
        }
        if n > u8::MAX as usize {
            return Err(self.err("call has too many arguments"));
        }
        self.emit_op(Op::Call);
        self.emit_u8(n as u8);
        self.depth -= n as i64;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum PayloadKind {
    SelfEval,
    Collection,
    Call,
}

/// Parse and compile a `(fn* name? clause+)` form into a finished
/// `BytecodeFn` heap value. Shared between the top-level entry point
/// ([`crate::compile_fn`]) and nested `fn*` literals.
pub(crate) fn compile_fn_form(
    heap: &mut Heap,
    meta_type: HeapRef,
    registry: &mut NamespaceRegistry,
    bindings: &mut BindingStack,
    vm: &mut Vm,
    cfg: &Config,
    ns: &str,
    enclosing_locals: &HashSet<String>,
    form: Value,
) -> Result<Value, Value> {
    let items = list_items(heap, &form).ok_or_else(|| compile_err(heap, meta_type, "fn* form must be a list"))?;
    if items.is_empty() {
        return Err(compile_err(heap, meta_type, "empty fn* form"));
    }
    let mut rest = &items[1..];
    let name = if let Some(Value::Symbol(s)) = rest.first() {
        let n = s.name().to_string();
        rest = &rest[1..];
        Some(n)
    } else {
        None
    };
    if rest.is_empty() {
        return Err(compile_err(heap, meta_type, "fn* needs at least one arity clause"));
    }

    let clauses: Vec<(Vec<Value>, Vec<Value>)> = if vector_items(heap, &rest[0]).is_some() {
        let params = vector_items(heap, &rest[0]).unwrap();
        vec![(params, rest[1..].to_vec())]
    } else {
        let mut out = Vec::new();
        for clause_form in rest {
            let clause_items = list_items(heap, clause_form).ok_or_else(|| compile_err(heap, meta_type, "fn* arity clause must be a list"))?;
            if clause_items.is_empty() {
                return Err(compile_err(heap, meta_type, "fn* arity clause needs a parameter vector"));
            }
            let params = vector_items(heap, &clause_items[0]).ok_or_else(|| compile_err(heap, meta_type, "fn* arity clause's first form must be a parameter vector"))?;
            out.push((params, clause_items[1..].to_vec()));
        }
        out
    };

    let mut body_refs: Vec<(u32, bool, HeapRef)> = Vec::new();
    let mut seen_variadic = false;
    for (params, body) in clauses {
        let is_variadic = params.iter().any(|p| as_symbol(p).is_some_and(|s| s.name().as_ref() == "&"));
        if is_variadic {
            if seen_variadic {
                return Err(compile_err(heap, meta_type, "fn* can have at most one variadic arity clause"));
            }
            seen_variadic = true;
        }
        let fixed_count = if is_variadic { params.len() - 1 } else { params.len() };

        let compiler = BodyCompiler::new(heap, meta_type, registry, bindings, vm, cfg, ns.to_string(), enclosing_locals.clone());
        let compiled = compiler.compile_clause(&params, is_variadic, &body)?;
        let body_ref = match heap.alloc_static(meta_type, Payload::BytecodeFnBody(compiled)).value() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        body_refs.push((fixed_count as u32, is_variadic, body_ref));
    }
    body_refs.sort_by_key(|(n, variadic, _)| (*variadic, *n));
    if body_refs.iter().filter(|(_, v, _)| *v).count() > 0 {
        let variadic_pos = body_refs.iter().position(|(_, v, _)| *v).unwrap();
        if variadic_pos != body_refs.len() - 1 {
            return Err(compile_err(heap, meta_type, "fn*'s variadic clause must sort last by fixed arity"));
        }
    }

    let data = BytecodeFnData { name, bodies: body_refs.into_iter().map(|(_, _, r)| r).collect() };
    Ok(heap.alloc_static(meta_type, Payload::BytecodeFn(data)).value())
}
