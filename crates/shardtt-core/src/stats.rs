//! Transposition table statistics for the local and remote access paths

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics collector shared by every thread using a `DistributedTable`
#[derive(Debug, Default)]
pub struct TableStats {
    /// Probes resolved against the local store
    pub local_probes: AtomicU64,
    /// Remote `Get` round trips
    pub remote_gets: AtomicU64,
    /// Clusters written to remote nodes
    pub remote_puts: AtomicU64,
    /// Remote probes answered by the read cache
    pub cache_hits: AtomicU64,
    /// Remote probes that missed the read cache
    pub cache_misses: AtomicU64,
    /// Write buffer flushes
    pub flushes: AtomicU64,
    /// Cluster tag mismatches seen on remote replies
    pub integrity_warnings: AtomicU64,
    /// Collective merge batches exchanged
    pub merge_batches: AtomicU64,
}

macro_rules! recorder {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl TableStats {
    pub fn new() -> Self {
        Self::default()
    }

    recorder! {
        record_local_probe => local_probes,
        record_remote_get => remote_gets,
        record_cache_hit => cache_hits,
        record_cache_miss => cache_misses,
        record_flush => flushes,
        record_integrity_warning => integrity_warnings,
        record_merge_batch => merge_batches,
    }

    /// Record `count` clusters written to remote nodes
    #[inline]
    pub fn record_remote_puts(&self, count: usize) {
        self.remote_puts.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Number of remote calls of any kind so far
    pub fn remote_calls(&self) -> u64 {
        self.remote_gets.load(Ordering::Relaxed) + self.remote_puts.load(Ordering::Relaxed)
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.local_probes,
            &self.remote_gets,
            &self.remote_puts,
            &self.cache_hits,
            &self.cache_misses,
            &self.flushes,
            &self.integrity_warnings,
            &self.merge_batches,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Take a plain copy of the counters
    ///
    /// `critical_sections` and `local_integrity_failures` live outside this
    /// collector (critical section and cluster store) and are passed in.
    pub fn snapshot(&self, critical_sections: u64, local_integrity_failures: u64) -> StatsSnapshot {
        StatsSnapshot {
            local_probes: self.local_probes.load(Ordering::Relaxed),
            remote_gets: self.remote_gets.load(Ordering::Relaxed),
            remote_puts: self.remote_puts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            critical_sections,
            integrity_warnings: self.integrity_warnings.load(Ordering::Relaxed)
                + local_integrity_failures,
            merge_batches: self.merge_batches.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `TableStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub local_probes: u64,
    pub remote_gets: u64,
    pub remote_puts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub flushes: u64,
    /// Acquisitions of the remote-access critical section
    pub critical_sections: u64,
    pub integrity_warnings: u64,
    pub merge_batches: u64,
}

impl StatsSnapshot {
    /// Read cache hit rate as percentage
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / lookups as f64) * 100.0
        }
    }

    /// Remote calls of any kind
    pub fn remote_calls(&self) -> u64 {
        self.remote_gets + self.remote_puts
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "TT Stats: local_probes={}, remote_gets={}, remote_puts={}, cache_hit_rate={:.1}%, flushes={}, critical_sections={}, integrity_warnings={}, merge_batches={}",
            self.local_probes,
            self.remote_gets,
            self.remote_puts,
            self.cache_hit_rate(),
            self.flushes,
            self.critical_sections,
            self.integrity_warnings,
            self.merge_batches,
        )
    }
}
