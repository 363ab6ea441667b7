//! # Config - Penciller Tunables
//!
//! Central place for the knobs the penciller server, the compaction clerk,
//! and the level-zero flush machinery read at startup. Everything has a
//! production default; tests override individual fields to force small
//! caches, deterministic compaction victims, or strict recovery.

use std::time::Duration;

/// Default key-count threshold at which the L0 cache becomes eligible for
/// a flush to a level-zero file.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 28_000;

/// Hard ceiling on the L0 cache. Past this point the coin-toss jitter is
/// bypassed and a flush is forced on the next opportunity.
pub const SUPER_MAX_CACHE_SIZE: usize = 40_000;

/// Number of excess files across all levels above which the penciller
/// flags a work backlog and starts returning pushes.
pub const DEFAULT_BACKLOG_TOLERANCE: usize = 4;

/// Upper bound on the record count of a single file produced by a level
/// merge. Larger merges split their output into several files.
pub const DEFAULT_MERGE_FILE_MAX_KEYS: usize = 16_384;

/// Runtime configuration for a penciller instance.
///
/// Construct with [`PencillerConfig::default`] and adjust fields as needed:
///
/// ```rust
/// use config::PencillerConfig;
///
/// let cfg = PencillerConfig {
///     max_cache_size: 64,
///     coin_toss_flush: false,
///     ..PencillerConfig::default()
/// };
/// assert!(cfg.max_cache_size < cfg.super_max_cache_size);
/// ```
#[derive(Debug, Clone)]
pub struct PencillerConfig {
    /// Cache key count above which a level-zero flush may be triggered.
    pub max_cache_size: usize,

    /// Cache key count past which a flush is forced regardless of the
    /// coin toss.
    pub super_max_cache_size: usize,

    /// When `true`, only one in five over-threshold pushes actually starts
    /// a flush (until the hard ceiling). This staggers flushes across
    /// sibling nodes in a cluster.
    pub coin_toss_flush: bool,

    /// Excess-file count above which pushes are returned to the caller
    /// until compaction catches up.
    pub backlog_tolerance: usize,

    /// Maximum records per file written by a level merge.
    pub merge_file_max_keys: usize,

    /// Lifetime granted to an ordinary snapshot registration.
    pub snapshot_timeout: Duration,

    /// Lifetime granted to a snapshot registered as long-running.
    pub long_snapshot_timeout: Duration,

    /// Point lookups slower than this are logged.
    pub slow_fetch: Duration,

    /// Seed for the compaction victim selector and the flush coin toss.
    /// Fixing this makes a penciller's background behaviour reproducible.
    pub compaction_seed: u64,

    /// When `true`, failing to read every persisted manifest generation is
    /// an error. When `false` the penciller logs the failures and starts
    /// from an empty manifest, relying on journal replay upstream.
    pub strict_manifest_recovery: bool,
}

impl Default for PencillerConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            super_max_cache_size: SUPER_MAX_CACHE_SIZE,
            coin_toss_flush: true,
            backlog_tolerance: DEFAULT_BACKLOG_TOLERANCE,
            merge_file_max_keys: DEFAULT_MERGE_FILE_MAX_KEYS,
            snapshot_timeout: Duration::from_secs(600),
            long_snapshot_timeout: Duration::from_secs(3600),
            slow_fetch: Duration::from_millis(20),
            compaction_seed: 0,
            strict_manifest_recovery: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = PencillerConfig::default();
        assert!(cfg.max_cache_size < cfg.super_max_cache_size);
        assert!(cfg.snapshot_timeout < cfg.long_snapshot_timeout);
        assert!(cfg.backlog_tolerance > 0);
    }

    #[test]
    fn struct_update_syntax_overrides_single_fields() {
        let cfg = PencillerConfig {
            max_cache_size: 16,
            ..PencillerConfig::default()
        };
        assert_eq!(cfg.max_cache_size, 16);
        assert_eq!(cfg.super_max_cache_size, SUPER_MAX_CACHE_SIZE);
    }
}
