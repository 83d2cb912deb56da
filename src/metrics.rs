//! Lightweight global metrics for the driver.
//!
//! Thread-safe atomic counters per subsystem:
//! - Backing chains (snapshot create/delete, commit, rebase, chain walks)
//! - Share admission
//! - Image cache

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Chains -----
static SNAPSHOTS_CREATED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_DELETED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOT_DELETE_NOOPS: AtomicU64 = AtomicU64::new(0);
static CHAIN_COMMITS: AtomicU64 = AtomicU64::new(0);
static CHAIN_REBASES: AtomicU64 = AtomicU64::new(0);
static CHAIN_WALKS: AtomicU64 = AtomicU64::new(0);
static CHAIN_WALK_NODES: AtomicU64 = AtomicU64::new(0);

// ----- Shares -----
static SHARE_SELECTIONS: AtomicU64 = AtomicU64::new(0);
static SHARE_REJECTIONS: AtomicU64 = AtomicU64::new(0);

// ----- Image cache -----
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static CACHE_CONVERSIONS: AtomicU64 = AtomicU64::new(0);
static CACHE_FETCHES: AtomicU64 = AtomicU64::new(0);
static IMAGE_RESIZES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub snapshots_created: u64,
    pub snapshots_deleted: u64,
    pub snapshot_delete_noops: u64,
    pub chain_commits: u64,
    pub chain_rebases: u64,
    pub chain_walks: u64,
    pub chain_walk_nodes: u64,

    pub share_selections: u64,
    pub share_rejections: u64,

    pub cache_hits: u64,
    pub cache_conversions: u64,
    pub cache_fetches: u64,
    pub image_resizes: u64,
}

impl MetricsSnapshot {
    pub fn avg_chain_len(&self) -> f64 {
        if self.chain_walks == 0 {
            0.0
        } else {
            self.chain_walk_nodes as f64 / self.chain_walks as f64
        }
    }

    /// Fraction of cache lookups that avoided a remote fetch.
    pub fn cache_reuse_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_conversions + self.cache_fetches;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits + self.cache_conversions) as f64 / total as f64
        }
    }
}

// ----- Recorders (chains) -----
pub fn record_snapshot_created() {
    SNAPSHOTS_CREATED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_snapshot_deleted() {
    SNAPSHOTS_DELETED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_snapshot_delete_noop() {
    SNAPSHOT_DELETE_NOOPS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_commit() {
    CHAIN_COMMITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_rebase() {
    CHAIN_REBASES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_chain_walk(nodes: usize) {
    CHAIN_WALKS.fetch_add(1, Ordering::Relaxed);
    CHAIN_WALK_NODES.fetch_add(nodes as u64, Ordering::Relaxed);
}

// ----- Recorders (shares) -----
pub fn record_share_selected() {
    SHARE_SELECTIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_share_rejected() {
    SHARE_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (image cache) -----
pub fn record_cache_hit() {
    CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_cache_conversion() {
    CACHE_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_cache_fetch() {
    CACHE_FETCHES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_image_resize() {
    IMAGE_RESIZES.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        snapshots_created: SNAPSHOTS_CREATED.load(Ordering::Relaxed),
        snapshots_deleted: SNAPSHOTS_DELETED.load(Ordering::Relaxed),
        snapshot_delete_noops: SNAPSHOT_DELETE_NOOPS.load(Ordering::Relaxed),
        chain_commits: CHAIN_COMMITS.load(Ordering::Relaxed),
        chain_rebases: CHAIN_REBASES.load(Ordering::Relaxed),
        chain_walks: CHAIN_WALKS.load(Ordering::Relaxed),
        chain_walk_nodes: CHAIN_WALK_NODES.load(Ordering::Relaxed),

        share_selections: SHARE_SELECTIONS.load(Ordering::Relaxed),
        share_rejections: SHARE_REJECTIONS.load(Ordering::Relaxed),

        cache_hits: CACHE_HITS.load(Ordering::Relaxed),
        cache_conversions: CACHE_CONVERSIONS.load(Ordering::Relaxed),
        cache_fetches: CACHE_FETCHES.load(Ordering::Relaxed),
        image_resizes: IMAGE_RESIZES.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    SNAPSHOTS_CREATED.store(0, Ordering::Relaxed);
    SNAPSHOTS_DELETED.store(0, Ordering::Relaxed);
    SNAPSHOT_DELETE_NOOPS.store(0, Ordering::Relaxed);
    CHAIN_COMMITS.store(0, Ordering::Relaxed);
    CHAIN_REBASES.store(0, Ordering::Relaxed);
    CHAIN_WALKS.store(0, Ordering::Relaxed);
    CHAIN_WALK_NODES.store(0, Ordering::Relaxed);

    SHARE_SELECTIONS.store(0, Ordering::Relaxed);
    SHARE_REJECTIONS.store(0, Ordering::Relaxed);

    CACHE_HITS.store(0, Ordering::Relaxed);
    CACHE_CONVERSIONS.store(0, Ordering::Relaxed);
    CACHE_FETCHES.store(0, Ordering::Relaxed);
    IMAGE_RESIZES.store(0, Ordering::Relaxed);
}
