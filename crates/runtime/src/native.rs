//! Native call trampoline (§4.8): represented only as a trait boundary.
//!
//! An x86-64 thunk generator that lets the VM call into host-compiled
//! native code with a matching calling convention is explicitly out of
//! scope for this crate (platform codegen, not interpreter semantics).
//! `Trampoline` exists so an embedder can plug one in later without the
//! VM's `Call`/`Apply` dispatch needing to change shape; zero
//! implementations ship here.

use ember_core::{Heap, Value};

/// A host-provided calling convention for dispatching to native code from
/// the VM's `Call`/`Apply` opcodes. No implementation in this crate.
pub trait Trampoline {
    /// Invoke the native function identified by `id` with `args`,
    /// returning its result or a caught exception payload.
    fn call(&self, heap: &mut Heap, id: ember_core::NativeFnId, args: &[Value]) -> Result<Value, Value>;
}
