//! The stack-based bytecode interpreter (§4.7).
//!
//! Two operand stacks per the spec: `value_stack` (tagged `Value`s) and
//! `int_stack` (raw `i64`s used only by the overflow-checked arithmetic
//! opcodes, untagged and therefore not a GC root). Locals addressing
//! follows the compiler's convention (§4.6): parameters sit at negative
//! slots `-arity..-1` below a frame's `frame_base`, and `let*`/`loop*`
//! temporaries sit at `0..locals_size` at and above it — so a frame's
//! args are pushed first, then `frame_base` is recorded, then
//! `locals_size` more slots are reserved for the body's own bindings.
//!
//! A `BytecodeFnBody` is cloned out of the heap once per dispatched
//! instruction rather than held as a borrow across the match arms — the
//! arms need a live `&mut Heap` for allocation and var mutation, and a
//! held immutable borrow of the body would conflict with that. The body
//! itself is small (an opcode stream, a const pool, a name table) so the
//! clone is cheap relative to the dispatch it guards.

use crate::exception::{self, ExceptionKind};
use crate::namespace::{var_value, BindingStack, NamespaceRegistry};
use ember_core::bytecode::{BytecodeFnBody, BytecodeFnData, Op};
use ember_core::collections::list::List;
use ember_core::{Heap, HeapRef, Payload, Symbol, Value};
use tracing::trace;

/// One call-stack entry (§4.7: "`body`, `frame_base`, `ip`").
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub body: HeapRef,
    pub frame_base: usize,
    pub ip: usize,
}

/// An exception that escaped every frame on the current call stack, or a
/// host-level VM invariant failure (corrupt bytecode, blown call depth).
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// An Ember-level exception `Value` with no matching `catch*`.
    Exception(Value),
    /// Malformed bytecode: bad opcode byte, `ip` past the end of `code`,
    /// a frame whose `body`/`BytecodeFn` heap slot holds the wrong payload.
    CorruptBytecode(String),
}

pub struct Vm {
    pub value_stack: Vec<Value>,
    pub int_stack: Vec<i64>,
    pub frames: Vec<Frame>,
    pub max_call_depth: usize,
    /// Placeholder type ref used for every heap object the VM allocates on
    /// its own behalf (packed variadic-arg tails, exception values, IFN
    /// closures) — the compiler/prelude owns real type identity for
    /// everything reachable from source code; the VM only needs *a*
    /// self-consistent type ref to satisfy `Heap::alloc_static`.
    pub meta_type: HeapRef,
    /// Dispatch table for `Value::NativeFn` callees (§9's "primitive fast
    /// paths" — ordinary builtin functions like `+`/`str`, not the foreign
    /// native trampoline of §4.8). Keyed by `NativeFnId.0`; a plain `fn`
    /// pointer rather than a closure so it can be copied out of the map
    /// before a reentrant call back into the VM (e.g. `apply*`).
    pub natives: std::collections::HashMap<u32, crate::prelude::NativeImpl>,
}

impl Vm {
    pub fn new(heap: &mut Heap, max_call_depth: usize) -> Self {
        Vm {
            value_stack: Vec::new(),
            int_stack: Vec::new(),
            frames: Vec::new(),
            max_call_depth,
            meta_type: heap.bootstrap_meta_type(),
            natives: crate::prelude::default_natives(),
        }
    }

    /// Every live root the VM itself contributes to a GC cycle (§3: "the
    /// operand stack of the VM"; the int stack is explicitly excluded,
    /// it holds untagged ints).
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.value_stack.iter().cloned()
    }

    fn raise(&self, heap: &mut Heap, kind: ExceptionKind, message: &str) -> VmError {
        VmError::Exception(exception::make_exception(heap, self.meta_type, kind, message, Value::Nil))
    }

    /// Invoke `callee` with `args` from scratch (no enclosing frame) — the
    /// entry point an embedder (the `emberc` driver, tests) calls.
    pub fn call(
        &mut self,
        heap: &mut Heap,
        registry: &NamespaceRegistry,
        bindings: &mut BindingStack,
        callee: Value,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        self.call_value(heap, registry, bindings, callee, args)
    }

    /// The generic call path (§4.7: "for non-bytecode callables ... the
    /// runtime calls into the generic path"): bytecode functions resolve a
    /// body and run it; keywords/collections act as 1-2 arg accessors.
    fn call_value(
        &mut self,
        heap: &mut Heap,
        registry: &NamespaceRegistry,
        bindings: &mut BindingStack,
        callee: Value,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        match callee {
            Value::Obj(r) if matches!(&heap.get(r).payload, Payload::BytecodeFn(_)) => {
                self.call_bytecode_fn(heap, registry, bindings, r, args)
            }
            Value::NativeFn(id) => {
                let Some(f) = self.natives.get(&id.0).copied() else {
                    return Err(self.raise(heap, ExceptionKind::CallError, "unknown native fn id"));
                };
                f(heap, registry, bindings, self, args)
            }
            Value::Keyword(_) | Value::Symbol(_) => {
                let (coll, default) = match args.len() {
                    1 => (args[0].clone(), Value::Nil),
                    2 => (args[0].clone(), args[1].clone()),
                    _ => return Err(self.raise(heap, ExceptionKind::CallError, "keyword/symbol callable takes 1 or 2 args")),
                };
                crate::builtins::get(heap, &coll, &callee, default).map_err(|k| self.raise(heap, k, "keyword lookup failed"))
            }
            Value::Obj(r) if matches!(&heap.get(r).payload, Payload::Map(_) | Payload::Set(_) | Payload::Vector(_) | Payload::HamtNode(_)) => {
                let (key, default) = match args.len() {
                    1 => (args[0].clone(), Value::Nil),
                    2 => (args[0].clone(), args[1].clone()),
                    _ => return Err(self.raise(heap, ExceptionKind::CallError, "collection callable takes 1 or 2 args")),
                };
                crate::builtins::get(heap, &Value::Obj(r), &key, default).map_err(|k| self.raise(heap, k, "collection lookup failed"))
            }
            _ => Err(self.raise(heap, ExceptionKind::CallError, "value is not callable")),
        }
    }

    /// Resolve and run a `BytecodeFn`'s matching body for `args.len()`,
    /// per §4.7's `find_body` algorithm.
    fn call_bytecode_fn(
        &mut self,
        heap: &mut Heap,
        registry: &NamespaceRegistry,
        bindings: &mut BindingStack,
        fn_ref: HeapRef,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        if self.frames.len() >= self.max_call_depth {
            return Err(self.raise(heap, ExceptionKind::IllegalState, "stack overflow: max call depth exceeded"));
        }

        let fn_data = match &heap.get(fn_ref).payload {
            Payload::BytecodeFn(f) => f.clone(),
            _ => return Err(VmError::CorruptBytecode("call target is not a BytecodeFn".into())),
        };

        let (body_ref, fixed_arity, is_variadic) = {
            let resolved = fn_data.find_body(args.len() as u32, |r| match &heap.get(r).payload {
                Payload::BytecodeFnBody(b) => b,
                _ => panic!("BytecodeFn body slot does not hold a BytecodeFnBody"),
            });
            match resolved {
                Some((r, b)) => (r, b.fixed_arity(), b.is_variadic()),
                None => return Err(self.raise(heap, ExceptionKind::CallError, "no matching arity")),
            }
        };

        let mut final_args = args;
        if is_variadic && final_args.len() > fixed_arity as usize {
            let tail_elems = final_args.split_off(fixed_arity as usize);
            let tail: List = tail_elems.iter().cloned().collect();
            // `final_args`'s remaining fixed prefix and `tail_elems` are off
            // the value stack at this point; root them explicitly so a
            // collection triggered by this very allocation can't sweep them.
            let mut roots: Vec<Value> = self.value_stack.clone();
            roots.extend(final_args.iter().cloned());
            roots.extend(tail_elems);
            let tail_forced = heap.alloc_static_rooted(self.meta_type, Payload::ListVal(tail), &roots);
            final_args.push(tail_forced.value());
        } else if is_variadic && final_args.len() == fixed_arity as usize {
            let roots = self.value_stack.clone();
            let empty_tail = heap.alloc_static_rooted(self.meta_type, Payload::ListVal(List::empty()), &roots);
            final_args.push(empty_tail.value());
        }

        let locals_size = match &heap.get(body_ref).payload {
            Payload::BytecodeFnBody(b) => b.locals_size as usize,
            _ => return Err(VmError::CorruptBytecode("resolved body slot is not a BytecodeFnBody".into())),
        };

        // Params occupy negative slots `-arity..-1`; `let*`/`loop*` locals
        // occupy `0..locals_size` (§4.6). So `frame_base` sits *after* the
        // pushed args, not at their start.
        self.value_stack.extend(final_args);
        let frame_base = self.value_stack.len();
        self.value_stack.resize(frame_base + locals_size, Value::Nil);

        trace!(fn_ref = ?fn_ref, frame_base, locals_size, "call bytecode fn");
        self.frames.push(Frame { body: body_ref, frame_base, ip: 0 });
        let result = self.run_frame(heap, registry, bindings);
        match &result {
            Ok(_) => {
                self.frames.pop();
            }
            Err(VmError::Exception(_)) => {
                // Unhandled within the callee: its frame and locals are
                // already gone from `self.frames`/`value_stack` by the
                // time `run_frame` returns an error (see below), so the
                // caller's own CALL-site exception-table lookup takes over.
            }
            Err(VmError::CorruptBytecode(_)) => {}
        }
        result
    }

    /// Execute the top frame until it returns (`RET`) or an exception
    /// escapes every handler on the call stack below it too.
    fn run_frame(&mut self, heap: &mut Heap, registry: &NamespaceRegistry, bindings: &mut BindingStack) -> Result<Value, VmError> {
        let floor = self.frames.len() - 1;
        loop {
            match self.step(heap, registry, bindings) {
                Ok(Some(v)) => {
                    self.frames.truncate(floor);
                    return Ok(v);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.frames.truncate(floor);
                    return Err(e);
                }
            }
        }
    }

    /// Execute exactly one instruction (or one exception-table jump) on
    /// the top frame. `Ok(Some(v))` means the frame hit `RET` with result
    /// `v`; `Ok(None)` means keep stepping; `Err` means the exception
    /// escaped this whole frame (no matching handler anywhere in it).
    fn step(&mut self, heap: &mut Heap, registry: &NamespaceRegistry, bindings: &mut BindingStack) -> Result<Option<Value>, VmError> {
        let frame = *self.frames.last().expect("step called with no active frame");
        let body = match &heap.get(frame.body).payload {
            Payload::BytecodeFnBody(b) => b.clone(),
            _ => return Err(VmError::CorruptBytecode("frame body is not a BytecodeFnBody".into())),
        };

        let start_ip = frame.ip;
        let outcome = self.execute_one(heap, registry, bindings, &body, frame);

        match outcome {
            Ok(StepResult::Continue(new_ip)) => {
                self.frames.last_mut().unwrap().ip = new_ip;
                Ok(None)
            }
            Ok(StepResult::Return(v)) => Ok(Some(v)),
            Err(exc_value) => self.handle_exception(heap, &body, frame, start_ip, exc_value),
        }
    }

    /// Scan the current body's exception table for a handler covering
    /// `offset`; on a match, truncate the stacks and jump, per §4.7.
    fn handle_exception(
        &mut self,
        heap: &mut Heap,
        body: &BytecodeFnBody,
        frame: Frame,
        offset: usize,
        exc_value: Value,
    ) -> Result<Option<Value>, VmError> {
        let thrown_type = exception::type_name_of(heap, &exc_value).unwrap_or_default();
        let entry = body.exception_table.find(offset as u32, |candidate| candidate == thrown_type);
        match entry {
            Some(entry) => {
                let target = frame.frame_base + body.locals_size as usize + entry.saved_stack_depth as usize;
                self.value_stack.truncate(target);
                self.value_stack.push(exc_value);
                self.int_stack.clear();
                self.frames.last_mut().unwrap().ip = entry.handler as usize;
                Ok(None)
            }
            None => Err(VmError::Exception(exc_value)),
        }
    }

    fn execute_one(
        &mut self,
        heap: &mut Heap,
        registry: &NamespaceRegistry,
        bindings: &mut BindingStack,
        body: &BytecodeFnBody,
        frame: Frame,
    ) -> Result<StepResult, Value> {
        let code = &body.code;
        let mut ip = frame.ip;
        let op_byte = *code.get(ip).ok_or_else(|| {
            exception::make_exception(heap, self.meta_type, ExceptionKind::IllegalState, "ip past end of code", Value::Nil)
        })?;
        let op = Op::from_byte(op_byte).ok_or_else(|| {
            exception::make_exception(
                heap,
                self.meta_type,
                ExceptionKind::IllegalState,
                &format!("unknown opcode byte {op_byte}"),
                Value::Nil,
            )
        })?;
        ip += 1;

        macro_rules! pop {
            () => {
                self.value_stack.pop().ok_or_else(|| {
                    exception::make_exception(heap, self.meta_type, ExceptionKind::IllegalState, "value stack underflow", Value::Nil)
                })?
            };
        }
        macro_rules! raise {
            ($kind:expr, $msg:expr) => {
                return Err(exception::make_exception(heap, self.meta_type, $kind, $msg, Value::Nil))
            };
        }
        // Immediates are trusted to fit: `code` is compiler output, not
        // untrusted input, so a truncated immediate panics rather than
        // raising a catchable exception.
        let read_u16 = |ip: usize| -> usize { u16::from_le_bytes([code[ip], code[ip + 1]]) as usize };
        let read_i16 = |ip: usize| -> i64 { i16::from_le_bytes([code[ip], code[ip + 1]]) as i64 };
        let read_u8 = |ip: usize| -> usize { code[ip] as usize };

        match op {
            Op::Cnil => {
                self.value_stack.push(Value::Nil);
            }
            Op::Pop => {
                pop!();
            }
            Op::Ldc => {
                let idx = read_u16(ip);
                ip += 2;
                let Some(c) = body.consts.get(idx) else { raise!(ExceptionKind::IllegalState, "const index out of range") };
                self.value_stack.push(c.clone());
            }
            Op::Ldl => {
                let slot = read_i16(ip);
                ip += 2;
                let idx = frame.frame_base as i64 + slot;
                let Some(v) = (idx >= 0).then(|| self.value_stack.get(idx as usize)).flatten() else {
                    raise!(ExceptionKind::IllegalState, "local slot out of range")
                };
                self.value_stack.push(v.clone());
            }
            Op::Stl => {
                let slot = read_i16(ip);
                ip += 2;
                let v = pop!();
                let idx = frame.frame_base as i64 + slot;
                if idx < 0 || idx as usize >= self.value_stack.len() {
                    raise!(ExceptionKind::IllegalState, "local slot out of range");
                }
                self.value_stack[idx as usize] = v;
            }
            Op::Ldv => {
                let idx = read_u16(ip);
                ip += 2;
                let Some(name) = body.vars.get(idx) else { raise!(ExceptionKind::IllegalState, "var index out of range") };
                let Some(var_ref) = resolve_var_ref(registry, name) else { raise!(ExceptionKind::SymbolNotFound, name) };
                let v = match &heap.get(var_ref).payload {
                    Payload::Var(v) => v.root.borrow().clone(),
                    _ => raise!(ExceptionKind::IllegalState, "resolved symbol is not a Var"),
                };
                self.value_stack.push(v);
            }
            Op::Lddv => {
                let idx = read_u16(ip);
                ip += 2;
                let Some(name) = body.vars.get(idx) else { raise!(ExceptionKind::IllegalState, "var index out of range") };
                let Some(var_ref) = resolve_var_ref(registry, name) else { raise!(ExceptionKind::SymbolNotFound, name) };
                self.value_stack.push(var_value(heap, bindings, var_ref));
            }
            Op::Stvv => {
                let value = pop!();
                let var_val = pop!();
                let Value::Obj(var_ref) = var_val else { raise!(ExceptionKind::IllegalArgument, "STVV target is not a var") };
                match &heap.get(var_ref).payload {
                    Payload::Var(v) => *v.root.borrow_mut() = value,
                    _ => raise!(ExceptionKind::IllegalArgument, "STVV target is not a var"),
                }
            }
            Op::Stvm => {
                let meta = pop!();
                let var_val = pop!();
                let Value::Obj(var_ref) = var_val else { raise!(ExceptionKind::IllegalArgument, "STVM target is not a var") };
                match &heap.get(var_ref).payload {
                    Payload::Var(v) => *v.meta.borrow_mut() = meta,
                    _ => raise!(ExceptionKind::IllegalArgument, "STVM target is not a var"),
                }
            }
            Op::Setv => {
                let meta = pop!();
                let val = pop!();
                let var_val = pop!();
                let Value::Obj(var_ref) = var_val else { raise!(ExceptionKind::IllegalArgument, "SETV target is not a var") };
                match &heap.get(var_ref).payload {
                    Payload::Var(v) => {
                        *v.root.borrow_mut() = val;
                        *v.meta.borrow_mut() = meta;
                    }
                    _ => raise!(ExceptionKind::IllegalArgument, "SETV target is not a var"),
                }
            }
            Op::Lddf => {
                let field = pop!();
                let obj = pop!();
                let v = get_field(heap, &obj, &field)?;
                self.value_stack.push(v);
            }
            Op::Stdf => {
                let value = pop!();
                let field = pop!();
                let obj = pop!();
                set_field(heap, &obj, &field, value)?;
            }
            Op::Ldsf => {
                let idx = read_u16(ip);
                ip += 2;
                let obj = pop!();
                let v = get_field_by_index(heap, &obj, idx).map_err(to_exc_value)?;
                self.value_stack.push(v);
            }
            Op::Stsf => {
                let idx = read_u16(ip);
                ip += 2;
                let value = pop!();
                let obj = pop!();
                set_field_by_index(heap, &obj, idx, value).map_err(to_exc_value)?;
            }
            Op::Br => {
                let off = read_i16(ip);
                ip += 2;
                ip = (ip as i64 + off) as usize;
            }
            Op::Bnil => {
                let off = read_i16(ip);
                ip += 2;
                let v = pop!();
                if v.is_nil() {
                    ip = (ip as i64 + off) as usize;
                }
            }
            Op::Bnnil => {
                let off = read_i16(ip);
                ip += 2;
                let v = pop!();
                if !v.is_nil() {
                    ip = (ip as i64 + off) as usize;
                }
            }
            Op::Call => {
                let n = read_u8(ip);
                ip += 1;
                if self.value_stack.len() < n + 1 {
                    raise!(ExceptionKind::IllegalState, "value stack underflow on CALL");
                }
                let args: Vec<Value> = self.value_stack.split_off(self.value_stack.len() - n);
                let callee = pop!();
                let result = self.call_value(heap, registry, bindings, callee, args).map_err(to_exc_value);
                self.value_stack.push(result?);
            }
            Op::Apply => {
                let n = read_u8(ip);
                ip += 1;
                if self.value_stack.len() < n + 2 {
                    raise!(ExceptionKind::IllegalState, "value stack underflow on APPLY");
                }
                let seq_val = pop!();
                let mut fixed: Vec<Value> = self.value_stack.split_off(self.value_stack.len() - n);
                let callee = pop!();
                let tail = crate::builtins::seq(heap, &seq_val).map_err(|k| {
                    exception::make_exception(heap, self.meta_type, k, "APPLY trailing arg is not a seq", Value::Nil)
                })?;
                fixed.extend(tail);
                let result = self.call_value(heap, registry, bindings, callee, fixed).map_err(to_exc_value);
                self.value_stack.push(result?);
            }
            Op::Throw => {
                let v = pop!();
                return Err(v);
            }
            Op::Ifn => {
                let n = read_u8(ip);
                ip += 1;
                if self.value_stack.len() < n + 1 {
                    raise!(ExceptionKind::IllegalState, "value stack underflow on IFN");
                }
                let mut captured: Vec<Value> = self.value_stack.split_off(self.value_stack.len() - n);
                let fn_val = pop!();
                let Value::Obj(fn_ref) = fn_val else { raise!(ExceptionKind::IllegalArgument, "IFN target is not a fn") };
                let fn_data = match &heap.get(fn_ref).payload {
                    Payload::BytecodeFn(f) => f.clone(),
                    _ => raise!(ExceptionKind::IllegalArgument, "IFN target is not a BytecodeFn"),
                };
                if fn_data.bodies.len() != 1 {
                    raise!(ExceptionKind::IllegalState, "IFN only supports a single-body nested fn");
                }
                let mut new_body = match &heap.get(fn_data.bodies[0]).payload {
                    Payload::BytecodeFnBody(b) => b.clone(),
                    _ => raise!(ExceptionKind::IllegalState, "IFN target's body slot is corrupt"),
                };
                let len = new_body.consts.len();
                if captured.len() > len {
                    raise!(ExceptionKind::IllegalArgument, "IFN captures more values than the fn has const slots");
                }
                let start = len - captured.len();
                let mut roots: Vec<Value> = self.value_stack.clone();
                roots.extend(captured.iter().cloned());
                for (slot, v) in new_body.consts[start..].iter_mut().zip(captured.drain(..)) {
                    *slot = v;
                }
                let new_body_ref = match heap.alloc_static_rooted(self.meta_type, Payload::BytecodeFnBody(new_body), &roots).value() {
                    Value::Obj(r) => r,
                    _ => unreachable!(),
                };
                let new_fn = BytecodeFnData { name: fn_data.name.clone(), bodies: vec![new_body_ref] };
                self.value_stack.push(heap.alloc_static_rooted(self.meta_type, Payload::BytecodeFn(new_fn), &roots).value());
            }
            Op::Ubxi64 => {
                let v = pop!();
                match v {
                    Value::Int(i) => self.int_stack.push(i),
                    _ => raise!(ExceptionKind::IllegalArgument, "UBXI64 on a non-int value"),
                }
            }
            Op::Bxi64 => {
                let Some(i) = self.int_stack.pop() else { raise!(ExceptionKind::IllegalState, "int stack underflow on BXI64") };
                self.value_stack.push(Value::Int(i));
            }
            Op::Addi64 => {
                let Some(b) = self.int_stack.pop() else { raise!(ExceptionKind::IllegalState, "int stack underflow on ADDI64") };
                let Some(a) = self.int_stack.pop() else { raise!(ExceptionKind::IllegalState, "int stack underflow on ADDI64") };
                match crate::builtins::add_i64(a, b) {
                    Ok(sum) => self.int_stack.push(sum),
                    Err(k) => raise!(k, "integer overflow in ADDI64"),
                }
            }
            Op::Ret => {
                let v = pop!();
                return Ok(StepResult::Return(v));
            }
        }
        Ok(StepResult::Continue(ip))
    }
}

enum StepResult {
    Continue(usize),
    Return(Value),
}

fn to_exc_value(e: VmError) -> Value {
    match e {
        VmError::Exception(v) => v,
        VmError::CorruptBytecode(msg) => Value::str(format!("corrupt bytecode: {msg}")),
    }
}

/// `body.vars` entries are always fully-qualified `ns/name` strings (§4.7
/// design addition); split once rather than parsing a general symbol.
fn resolve_var_ref(registry: &NamespaceRegistry, qualified: &str) -> Option<HeapRef> {
    let (ns, name) = qualified.rsplit_once('/')?;
    registry.resolve_var(ns, Symbol::intern(Some(ns), name))
}

fn field_index(heap: &Heap, obj_ref: HeapRef, field_name: &str) -> Option<usize> {
    let type_ref = heap.get(obj_ref).type_ref();
    match &heap.get(type_ref).payload {
        Payload::Type(t) => t.fields.iter().position(|f| f == field_name),
        _ => None,
    }
}

fn field_name_of(v: &Value) -> Option<String> {
    match v {
        Value::Keyword(k) => Some(k.name().to_string()),
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn get_field(heap: &Heap, obj: &Value, field: &Value) -> Result<Value, Value> {
    let Value::Obj(obj_ref) = obj else { return Err(Value::str("LDDF target is not an object")) };
    let Some(name) = field_name_of(field) else { return Err(Value::str("LDDF field is not a name")) };
    let Some(idx) = field_index(heap, *obj_ref, &name) else { return Err(Value::str("no such field")) };
    get_field_by_index(heap, obj, idx).map_err(to_exc_value)
}

fn get_field_by_index(heap: &Heap, obj: &Value, idx: usize) -> Result<Value, VmError> {
    let Value::Obj(obj_ref) = obj else {
        return Err(VmError::CorruptBytecode("LDSF target is not an object".into()));
    };
    match &heap.get(*obj_ref).payload {
        Payload::Elements(es) => es.get(idx).cloned().ok_or_else(|| VmError::CorruptBytecode("field index out of range".into())),
        Payload::Dynamic(es) => es.borrow().get(idx).cloned().ok_or_else(|| VmError::CorruptBytecode("field index out of range".into())),
        _ => Err(VmError::CorruptBytecode("object payload has no indexed fields".into())),
    }
}

fn set_field(heap: &mut Heap, obj: &Value, field: &Value, value: Value) -> Result<(), Value> {
    let Value::Obj(obj_ref) = obj else { return Err(Value::str("STDF target is not an object")) };
    let Some(name) = field_name_of(field) else { return Err(Value::str("STDF field is not a name")) };
    let Some(idx) = field_index(heap, *obj_ref, &name) else { return Err(Value::str("no such field")) };
    set_field_by_index(heap, obj, idx, value).map_err(to_exc_value)
}

fn set_field_by_index(heap: &mut Heap, obj: &Value, idx: usize, value: Value) -> Result<(), VmError> {
    let Value::Obj(obj_ref) = obj else {
        return Err(VmError::CorruptBytecode("STSF target is not an object".into()));
    };
    match &heap.get(*obj_ref).payload {
        Payload::Dynamic(es) => {
            let mut es = es.borrow_mut();
            if idx >= es.len() {
                return Err(VmError::CorruptBytecode("field index out of range".into()));
            }
            es[idx] = value;
            Ok(())
        }
        _ => Err(VmError::CorruptBytecode("field is not mutable (expected a Dynamic-backed object)".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::bytecode::ExceptionTable;
    use ember_core::Heap;

    fn body(code: Vec<u8>, consts: Vec<Value>, arity: i32, locals_size: u16) -> BytecodeFnBody {
        BytecodeFnBody {
            arity,
            consts,
            vars: Vec::new(),
            locals_size,
            code,
            exception_table: ExceptionTable::empty(),
        }
    }

    fn make_fn(heap: &mut Heap, meta: HeapRef, b: BytecodeFnBody) -> Value {
        let body_ref = match heap.alloc_static(meta, Payload::BytecodeFnBody(b)).value() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        heap.alloc_static(meta, Payload::BytecodeFn(BytecodeFnData { name: None, bodies: vec![body_ref] })).value()
    }

    #[test]
    fn ldc_and_ret_returns_a_constant() {
        let mut heap = Heap::new(64);
        let meta = heap.bootstrap_meta_type();
        let code = vec![Op::Ldc as u8, 0, 0, Op::Ret as u8];
        let f = make_fn(&mut heap, meta, body(code, vec![Value::Int(42)], 0, 0));
        let mut vm = Vm::new(&mut heap, 64);
        let registry = NamespaceRegistry::new();
        let mut bindings = BindingStack::new();
        let result = vm.call(&mut heap, &registry, &mut bindings, f, vec![]).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn addi64_overflow_raises_arithmetic_exception() {
        let mut heap = Heap::new(64);
        let meta = heap.bootstrap_meta_type();
        let code = vec![
            Op::Ldc as u8, 0, 0,
            Op::Ubxi64 as u8,
            Op::Ldc as u8, 1, 0,
            Op::Ubxi64 as u8,
            Op::Addi64 as u8,
            Op::Bxi64 as u8,
            Op::Ret as u8,
        ];
        let consts = vec![Value::Int(i64::MAX), Value::Int(1)];
        let f = make_fn(&mut heap, meta, body(code, consts, 0, 0));
        let mut vm = Vm::new(&mut heap, 64);
        let registry = NamespaceRegistry::new();
        let mut bindings = BindingStack::new();
        let err = vm.call(&mut heap, &registry, &mut bindings, f, vec![]).unwrap_err();
        match err {
            VmError::Exception(v) => {
                assert_eq!(exception::type_name_of(&heap, &v).as_deref(), Some("ArithmeticException"));
            }
            other => panic!("expected an exception value, got {other:?}"),
        }
    }

    #[test]
    fn call_depth_limit_raises_illegal_state() {
        let mut heap = Heap::new(64);
        let meta = heap.bootstrap_meta_type();
        // A one-arg function whose single param (slot -1) holds itself; it
        // calls itself with itself as the argument, forever.
        let slot_neg1 = (-1i16).to_le_bytes();
        let code = vec![
            Op::Ldl as u8, slot_neg1[0], slot_neg1[1],
            Op::Ldl as u8, slot_neg1[0], slot_neg1[1],
            Op::Call as u8, 1,
            Op::Ret as u8,
        ];
        let f = make_fn(&mut heap, meta, body(code, vec![], 1, 0));
        let mut vm = Vm::new(&mut heap, 8);
        let registry = NamespaceRegistry::new();
        let mut bindings = BindingStack::new();
        let err = vm.call(&mut heap, &registry, &mut bindings, f.clone(), vec![f]);
        match err {
            Err(VmError::Exception(v)) => {
                assert_eq!(exception::type_name_of(&heap, &v).as_deref(), Some("IllegalState"));
            }
            other => panic!("expected a stack-overflow IllegalState exception, got {other:?}"),
        }
    }
}
