//! Cooperative sampling profiler (§5), gated behind the `diagnostics`
//! feature.
//!
//! Grounded in the teacher's `signal.rs` flag-based pattern: the signal
//! handler itself only flips an atomic (async-signal-safe), and the VM's
//! own interpreter loop polls the flag at a safe point (between opcode
//! dispatches) and records a sample there — no code runs in interrupt
//! context beyond the `store`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Set by the signal handler, cleared once the VM has taken a sample.
static TICK_PENDING: AtomicBool = AtomicBool::new(false);
static SAMPLES_TAKEN: AtomicUsize = AtomicUsize::new(0);

/// One stack sample: call depth plus the innermost frame's function name,
/// cheap enough to take at every poll point.
#[derive(Debug, Clone)]
pub struct Sample {
    pub call_depth: usize,
    pub innermost_fn: Option<String>,
}

/// Ring buffer of the most recent samples (§5: "fixed-size ring buffer").
pub struct Profiler {
    capacity: usize,
    samples: Mutex<Vec<Sample>>,
}

impl Profiler {
    pub fn new(capacity: usize) -> Self {
        Profiler {
            capacity,
            samples: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Called from the VM's dispatch loop at a safe point. No-op unless a
    /// tick is pending, so the hot path costs one atomic load per opcode.
    pub fn poll(&self, call_depth: usize, innermost_fn: Option<&str>) {
        if !TICK_PENDING.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut buf = self.samples.lock().expect("profiler mutex poisoned");
        if buf.len() == self.capacity {
            buf.remove(0);
        }
        buf.push(Sample {
            call_depth,
            innermost_fn: innermost_fn.map(str::to_string),
        });
        SAMPLES_TAKEN.fetch_add(1, Ordering::Relaxed);
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().expect("profiler mutex poisoned").clone()
    }

    pub fn samples_taken(&self) -> usize {
        SAMPLES_TAKEN.load(Ordering::Relaxed)
    }
}

/// Install the `SIGPROF` handler that flips [`TICK_PENDING`]. Idempotent;
/// safe to call multiple times.
#[cfg(all(unix, feature = "diagnostics"))]
pub fn install_signal_handler() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        let _ = signal_hook::low_level::register(signal_hook::consts::SIGPROF, || {
            TICK_PENDING.store(true, Ordering::SeqCst);
        });
    });
}

#[cfg(not(all(unix, feature = "diagnostics")))]
pub fn install_signal_handler() {}

/// Dump a human-readable summary to stderr, mirroring the teacher's
/// `dump_diagnostics` SIGQUIT handler.
pub fn dump_profile(profiler: &Profiler) {
    use std::io::Write;
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "\n=== Ember Profiler ===");
    let _ = writeln!(out, "Samples taken: {}", profiler.samples_taken());
    for s in profiler.samples() {
        let _ = writeln!(
            out,
            "  depth={} fn={}",
            s.call_depth,
            s.innermost_fn.as_deref().unwrap_or("<anonymous>")
        );
    }
    let _ = writeln!(out, "=== End Profiler ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_without_pending_tick_is_a_no_op() {
        let p = Profiler::new(4);
        p.poll(1, Some("f"));
        assert_eq!(p.samples().len(), 0);
    }

    #[test]
    fn poll_with_pending_tick_records_and_clears_it() {
        let p = Profiler::new(4);
        TICK_PENDING.store(true, Ordering::SeqCst);
        p.poll(3, Some("g"));
        let samples = p.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].call_depth, 3);
        p.poll(3, Some("g"));
        assert_eq!(p.samples().len(), 1, "tick was already consumed");
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let p = Profiler::new(2);
        for i in 0..3 {
            TICK_PENDING.store(true, Ordering::SeqCst);
            p.poll(i, None);
        }
        let samples = p.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].call_depth, 1);
        assert_eq!(samples[1].call_depth, 2);
    }
}
