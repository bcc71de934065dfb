//! Process-global configuration knobs (§6), mirroring the teacher's
//! `TransportConfig`/`BenchmarkConfig` pattern: a `Default`-constructed
//! struct, builder-style setters, and `serde` derives so the demo CLI can
//! load overrides from a TOML or JSON file. The core library itself never
//! reads environment or files directly — it only ever takes `CoreConfig`
//! by value from its caller.

use serde::{Deserialize, Serialize};

use crate::pool::{ClassLimits, SizeClass};

/// Per-size-class slab tuning, serializable for the demo CLI's config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlabConfig {
    pub initial: usize,
    pub max: usize,
    pub growth: usize,
}

impl From<ClassLimits> for SlabConfig {
    fn from(l: ClassLimits) -> Self {
        SlabConfig {
            initial: l.initial,
            max: l.max,
            growth: l.growth,
        }
    }
}

impl From<SlabConfig> for ClassLimits {
    fn from(s: SlabConfig) -> Self {
        ClassLimits {
            initial: s.initial,
            max: s.max,
            growth: s.growth,
        }
    }
}

/// Process-global knobs named in §6: page size, per-context poll timeout,
/// default queue depth, and slab tuning per size class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// OS page size, normally left at the `Default` value (queried once at
    /// process start); only overridden in tests that need to exercise
    /// size-class boundaries deterministically.
    pub page_size: usize,
    /// How long a context's run loop waits for transport readiness before
    /// re-checking its other duties.
    pub poll_timeout_ms: u64,
    /// Default per-connection outbound queue depth.
    pub queue_depth: usize,
    pub slab_kb16: SlabConfig,
    pub slab_kb64: SlabConfig,
    pub slab_kb256: SlabConfig,
    pub slab_mb1: SlabConfig,
    pub slab_unbounded: SlabConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            page_size: page_size(),
            poll_timeout_ms: 100,
            queue_depth: 1024,
            slab_kb16: SizeClass::Kb16.default_limits().into(),
            slab_kb64: SizeClass::Kb64.default_limits().into(),
            slab_kb256: SizeClass::Kb256.default_limits().into(),
            slab_mb1: SizeClass::Mb1.default_limits().into(),
            slab_unbounded: SizeClass::Unbounded.default_limits().into(),
        }
    }
}

impl CoreConfig {
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_poll_timeout_ms(mut self, ms: u64) -> Self {
        self.poll_timeout_ms = ms;
        self
    }
}

/// The OS page size the original queries once at process start via
/// `sysconf(_SC_PAGESIZE)`. This crate doesn't carve any memory along page
/// boundaries itself (that's the out-of-scope memory-registration layer),
/// so the default is the common value and callers on unusual platforms can
/// override it with the real figure before constructing a runtime.
fn page_size() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_page_size() {
        let cfg = CoreConfig::default();
        assert!(cfg.page_size >= 4096);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = CoreConfig::default().with_queue_depth(64);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queue_depth, 64);
    }
}
