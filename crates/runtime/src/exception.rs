//! The language-level exception taxonomy (§7).
//!
//! Every member is a `Value` the VM can catch, rethrow and pattern-match by
//! `isa?` against a catch clause's declared type — so `Exception` is not
//! itself a `Value` variant, it is a thin builder over `ember_core`'s heap
//! `Type` record plus a message/payload pair, the same indirection the
//! source language uses for `new IllegalArgument "x"`.

use ember_core::{Heap, HeapRef, Payload, Value};

/// One of the fixed exception kinds §7 enumerates. User code cannot define
/// new leaves of this enum (that would need a user-defined type system,
/// out of scope per SPEC_FULL.md) but can carry arbitrary payload data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    CallError,
    IllegalArgument,
    IllegalState,
    SymbolNotFound,
    ReadError,
    UnexpectedEndOfInput,
    ArithmeticException,
    IndexOutOfBounds,
    FileNotFound,
    CompilationError,
}

impl ExceptionKind {
    pub fn type_name(self) -> &'static str {
        match self {
            ExceptionKind::CallError => "CallError",
            ExceptionKind::IllegalArgument => "IllegalArgument",
            ExceptionKind::IllegalState => "IllegalState",
            ExceptionKind::SymbolNotFound => "SymbolNotFound",
            ExceptionKind::ReadError => "ReadError",
            ExceptionKind::UnexpectedEndOfInput => "UnexpectedEndOfInput",
            ExceptionKind::ArithmeticException => "ArithmeticException",
            ExceptionKind::IndexOutOfBounds => "IndexOutOfBounds",
            ExceptionKind::FileNotFound => "FileNotFound",
            ExceptionKind::CompilationError => "CompilationError",
        }
    }

    /// `isa?` for the fixed taxonomy: every kind isa itself; nothing isa
    /// anything else (there is no user-extensible hierarchy for the builtin
    /// exception types — that only applies to `derive`d application types,
    /// §4.5).
    pub fn isa(self, other_name: &str) -> bool {
        self.type_name() == other_name
    }

    /// Reverse of [`Self::type_name`], for `(new TypeName msg)`.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "CallError" => ExceptionKind::CallError,
            "IllegalArgument" => ExceptionKind::IllegalArgument,
            "IllegalState" => ExceptionKind::IllegalState,
            "SymbolNotFound" => ExceptionKind::SymbolNotFound,
            "ReadError" => ExceptionKind::ReadError,
            "UnexpectedEndOfInput" => ExceptionKind::UnexpectedEndOfInput,
            "ArithmeticException" => ExceptionKind::ArithmeticException,
            "IndexOutOfBounds" => ExceptionKind::IndexOutOfBounds,
            "FileNotFound" => ExceptionKind::FileNotFound,
            "CompilationError" => ExceptionKind::CompilationError,
            _ => return None,
        })
    }
}

/// Allocate an exception value: a heap object whose type is a bootstrap
/// `Type` record named after `kind`, carrying `message` and `payload`
/// fields (`get-message`/`ex-data` read these back out).
pub fn make_exception(
    heap: &mut Heap,
    exception_type: HeapRef,
    kind: ExceptionKind,
    message: &str,
    payload: Value,
) -> Value {
    let forced = heap.alloc_static(
        exception_type,
        Payload::Elements(Box::new([
            Value::str(kind.type_name()),
            Value::str(message),
            payload,
        ])),
    );
    forced.value()
}

/// Field offsets within the `Elements` layout `make_exception` builds.
pub const FIELD_TYPE_NAME: usize = 0;
pub const FIELD_MESSAGE: usize = 1;
pub const FIELD_PAYLOAD: usize = 2;

pub fn type_name_of(heap: &Heap, exc: &Value) -> Option<String> {
    let Value::Obj(r) = exc else { return None };
    match &heap.get(*r).payload {
        Payload::Elements(es) => match es.get(FIELD_TYPE_NAME) {
            Some(Value::Str(s)) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

pub fn message_of(heap: &Heap, exc: &Value) -> Option<String> {
    let Value::Obj(r) = exc else { return None };
    match &heap.get(*r).payload {
        Payload::Elements(es) => match es.get(FIELD_MESSAGE) {
            Some(Value::Str(s)) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Whether `exc`'s declared type matches `catch_type` via `isa?`. `None`
/// for `catch_type` means "catch anything" (§4.7: "nil type matches any").
pub fn exception_isa(heap: &Heap, exc: &Value, catch_type: Option<&str>) -> bool {
    let Some(catch_type) = catch_type else {
        return true;
    };
    match type_name_of(heap, exc) {
        Some(name) => name == catch_type,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_and_read_back_exception_fields() {
        let mut heap = Heap::new(64);
        let ty_ref = heap.bootstrap_meta_type();
        let exc = make_exception(
            &mut heap,
            ty_ref,
            ExceptionKind::IllegalArgument,
            "x",
            Value::Nil,
        );
        assert_eq!(type_name_of(&heap, &exc).as_deref(), Some("IllegalArgument"));
        assert_eq!(message_of(&heap, &exc).as_deref(), Some("x"));
        assert!(exception_isa(&heap, &exc, Some("IllegalArgument")));
        assert!(!exception_isa(&heap, &exc, Some("CallError")));
        assert!(exception_isa(&heap, &exc, None));
    }
}
