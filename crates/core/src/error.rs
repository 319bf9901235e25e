//! Host-level error plumbing for embedding `ember-core` (§7).
//!
//! Language-level conditions (`IllegalArgument`, `ArithmeticException`, …)
//! are `Value`s threaded through the VM's exception table and belong to
//! `ember-runtime`. This module is for errors the *host embedder* needs —
//! corrupt bytecode on deserialize, GC invariant violations caught in debug
//! builds — following the teacher's `runtime/src/error.rs` convention of a
//! thread-local "last error" slot an FFI boundary can poll instead of
//! unwinding across it.

use std::cell::RefCell;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    CorruptBytecode(String),
    HeapInvariant(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::CorruptBytecode(msg) => write!(f, "corrupt bytecode: {msg}"),
            CoreError::HeapInvariant(msg) => write!(f, "heap invariant violated: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

thread_local! {
    static LAST_ERROR: RefCell<Option<CoreError>> = const { RefCell::new(None) };
}

pub fn set_last_error(err: CoreError) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(err));
}

pub fn take_last_error() -> Option<CoreError> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

pub fn has_last_error() -> bool {
    LAST_ERROR.with(|e| e.borrow().is_some())
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_take_roundtrip() {
        clear_last_error();
        assert!(!has_last_error());
        set_last_error(CoreError::CorruptBytecode("bad opcode 0xff".into()));
        assert!(has_last_error());
        let err = take_last_error().unwrap();
        assert_eq!(err, CoreError::CorruptBytecode("bad opcode 0xff".into()));
        assert!(!has_last_error());
    }
}
