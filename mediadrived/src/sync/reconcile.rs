use std::sync::Arc;

use parking_lot::Mutex as PhaseLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::diff::diff;
use super::listing::ListingFetcher;
use super::pipeline::TranscodePipeline;
use crate::media::RemoteEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Listing,
    Diffing,
    Transcoding,
    Evicting,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub listed: usize,
    pub added: usize,
    pub removed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Drives list -> diff -> transcode -> evict. At most one cycle runs at a time.
pub struct Reconciler {
    listing: Arc<ListingFetcher>,
    pipeline: TranscodePipeline,
    force_refresh: bool,
    running: Mutex<()>,
    phase: PhaseLock<CyclePhase>,
}

impl Reconciler {
    pub fn new(listing: Arc<ListingFetcher>, pipeline: TranscodePipeline) -> Self {
        Self {
            listing,
            pipeline,
            force_refresh: false,
            running: Mutex::new(()),
            phase: PhaseLock::new(CyclePhase::Idle),
        }
    }

    /// Bypass the listing TTL on every cycle.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock()
    }

    /// Runs one cycle, or returns `None` when another cycle is still running.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Ok(_cycle) = self.running.try_lock() else {
            debug!(phase = ?self.phase(), "reconciliation already running, skipping");
            return None;
        };
        let _reset = PhaseReset(&self.phase);

        self.enter(CyclePhase::Listing);
        let listing = self.listing.list(self.force_refresh).await;
        if let Some(err) = &listing.refresh_error {
            warn!(error = %err, "listing refresh failed, using previous snapshot");
        }
        let snapshot = listing.snapshot;
        if !snapshot.is_loaded() {
            warn!("no remote listing available yet, skipping cycle");
            return Some(CycleReport::default());
        }

        self.enter(CyclePhase::Diffing);
        let store = self.pipeline.store();
        let delta = diff(
            snapshot.entries().iter().map(|entry| entry.id.as_str()),
            &store.cached_ids(),
        );

        self.enter(CyclePhase::Transcoding);
        let work: Vec<RemoteEntry> = delta
            .added
            .iter()
            .filter_map(|id| snapshot.get(id).cloned())
            .collect();
        let batch = self.pipeline.run_batch(work).await;

        // A forced refresh may have published a newer listing mid-cycle.
        self.enter(CyclePhase::Evicting);
        let latest = self.listing.current();
        let evicted = store.evict_absent(&latest.ids());
        for id in &evicted {
            debug!(file_id = %id, "evicted");
        }

        let report = CycleReport {
            listed: snapshot.len(),
            added: delta.added.len(),
            removed: evicted.len(),
            succeeded: batch.succeeded,
            failed: batch.failed,
            skipped: batch.skipped,
        };
        if report.added > 0 || report.removed > 0 {
            info!(
                listed = report.listed,
                added = report.added,
                removed = report.removed,
                succeeded = report.succeeded,
                failed = report.failed,
                "reconciliation cycle finished"
            );
        }
        Some(report)
    }

    fn enter(&self, phase: CyclePhase) {
        debug!(?phase, "reconcile phase");
        *self.phase.lock() = phase;
    }
}

struct PhaseReset<'a>(&'a PhaseLock<CyclePhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        *self.0.lock() = CyclePhase::Idle;
    }
}
