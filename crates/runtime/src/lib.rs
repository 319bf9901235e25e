//! Ember Runtime: namespaces, vars, multimethods, the builtin primitive
//! set, the exception taxonomy and the bytecode VM.
//!
//! `ember-core` gives this crate a safe tagged value, a GC heap and the
//! persistent collections; everything here is the language semantics
//! layered on top — resolving symbols, dispatching multimethods, running
//! compiled function bodies.
//!
//! # Modules
//!
//! - `namespace`: the namespace registry, vars, and the dynamic binding stack
//! - `multimethod`: multimethod dispatch and the `isa?` type hierarchy
//! - `exception`: the fixed exception taxonomy and catch-type matching
//! - `builtins`: overflow-checked arithmetic and the generic collection protocol
//! - `vm`: the stack-based bytecode interpreter
//! - `native`: the native-call trampoline trait boundary (no implementations)
//! - `prelude`: the builtin `NativeFn` set (`+`, `str`, `apply*`, ...) a compiled
//!   call form can dispatch to
//! - `profiler`: the optional cooperative sampling profiler (`diagnostics` feature)

pub mod builtins;
pub mod exception;
pub mod multimethod;
pub mod namespace;
pub mod native;
pub mod prelude;
pub mod profiler;
pub mod vm;

pub use exception::ExceptionKind;
pub use multimethod::{Hierarchy, Multimethod};
pub use namespace::{BindingStack, NamespaceRegistry};
pub use prelude::install_prelude;
pub use vm::{Vm, VmError};
