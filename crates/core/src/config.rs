//! Runtime configuration (SPEC_FULL.md §2 Ambient Stack).
//!
//! Loaded from an optional TOML file via the `toml` crate (already a
//! teacher workspace dependency); falls back to the defaults §4.1/§4.7
//! spell out explicitly.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// §4.1: "a configurable GC frequency (default 64)".
    pub gc_frequency: u32,
    /// Initial capacity hint for the heap's allocation list.
    pub initial_heap_capacity: usize,
    /// Ring buffer size for the cooperative profiler probe (§5).
    pub profiler_buffer_size: usize,
    /// SPEC_FULL.md §4.7: explicit recursion/call-depth cap so a runaway
    /// program raises `IllegalState` instead of exhausting the host stack.
    pub max_call_depth: usize,
    /// SPEC_FULL.md §4.6: cap on iterative macroexpansion, so a
    /// non-terminating macro raises `CompilationError` instead of hanging.
    pub max_macroexpand_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gc_frequency: 64,
            initial_heap_capacity: 1024,
            profiler_buffer_size: 256,
            max_call_depth: 4096,
            max_macroexpand_depth: 512,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.gc_frequency, 64);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg = Config::from_toml_str("gc_frequency = 128\n").unwrap();
        assert_eq!(cfg.gc_frequency, 128);
        assert_eq!(cfg.max_call_depth, 4096);
    }
}
