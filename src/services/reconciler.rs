//! src/services/reconciler.rs
//!
//! Reconciler: deletes objects whose file record no longer exists.
//!
//! The metadata store expires records passively and never announces it, so
//! this is a pull-based sweep: list every object under the managed prefix,
//! diff the keys against the live records, delete the difference. A cycle
//! keeps no state, which makes it safe to repeat and safe to abandon midway.
//!
//! Cycle phases: listing (all pages, or abort), checking (batched liveness
//! lookups; a failed batch is skipped), deleting (bounded concurrency; each
//! failure is independent).

use super::{
    metadata_store::{self, MetadataStore},
    object_client::{self, ObjectEntry, ObjectStore, ObjectStoreError},
};
use crate::clock::Clock;
use chrono::TimeDelta;
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{sync::Arc, time::Duration, time::Instant};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Only keys starting with this prefix are ever considered.
    pub prefix: String,
    /// Time between cycle starts.
    pub interval: Duration,
    /// Keys requested per listing call.
    pub page_size: usize,
    /// Keys per liveness query.
    pub lookup_batch: usize,
    /// Concurrent deletions per cycle.
    pub concurrency: usize,
    /// Upper bound for each store call.
    pub store_timeout: Duration,
    /// How long an in-flight cycle may run on after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Objects younger than this are left for a later cycle.
    pub min_object_age: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            prefix: "uploads/".into(),
            interval: Duration::from_secs(60),
            page_size: 1000,
            lookup_batch: 500,
            concurrency: 8,
            store_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(15),
            min_object_age: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("a sweep is already running")]
    AlreadyRunning,
    #[error("object listing failed on page {page}; cycle aborted")]
    PartialListing {
        page: usize,
        #[source]
        source: ObjectStoreError,
    },
    #[error("object listing did not advance past `{token}` on page {page}; cycle aborted")]
    ListingStalled { page: usize, token: String },
}

/// Outcome counters for one completed cycle.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    /// Listing pages fetched.
    pub pages: usize,
    /// Objects returned by the listing.
    pub listed: usize,
    /// Listed keys outside the managed prefix (ignored).
    pub out_of_scope: usize,
    /// Objects younger than `min_object_age` (ignored this cycle).
    pub too_young: usize,
    /// Objects with a live record.
    pub live: usize,
    /// Objects without a live record.
    pub orphans: usize,
    pub deleted: usize,
    /// Orphans that vanished before we got to them.
    pub already_gone: usize,
    /// Objects whose liveness could not be determined.
    pub skipped: usize,
    /// Orphans whose deletion failed.
    pub failed: usize,
    pub elapsed_ms: u64,
}

pub struct Reconciler {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    /// Held for the duration of a cycle; cycles never overlap.
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            objects,
            metadata,
            clock,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one cycle now. Refuses with [`SweepError::AlreadyRunning`] instead
    /// of overlapping a cycle in progress.
    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(SweepError::AlreadyRunning);
        };

        let started = Instant::now();
        let mut report = SweepReport::default();

        let entries = self.list_all(&mut report).await?;
        let candidates = self.candidates(entries, &mut report);
        let orphans = self.find_orphans(candidates, &mut report).await;
        self.delete_orphans(orphans, &mut report).await;

        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            listed = report.listed,
            live = report.live,
            orphans = report.orphans,
            deleted = report.deleted,
            skipped = report.skipped,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "sweep finished"
        );
        Ok(report)
    }

    /// Consume every listing page. Any failed page aborts the cycle: a
    /// partial listing must never be mistaken for the whole namespace.
    async fn list_all(&self, report: &mut SweepReport) -> Result<Vec<ObjectEntry>, SweepError> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;

        loop {
            report.pages += 1;
            let page_no = report.pages;
            let page = object_client::with_timeout(
                self.config.store_timeout,
                self.objects.list_page(
                    &self.config.prefix,
                    token.as_deref(),
                    self.config.page_size,
                ),
            )
            .await
            .map_err(|source| SweepError::PartialListing {
                page: page_no,
                source,
            })?;

            entries.extend(page.entries);
            // Pages come in key order, so every token must move past the last one.
            match page.next_token {
                Some(next) if token.as_deref().is_some_and(|prev| next.as_str() <= prev) => {
                    return Err(SweepError::ListingStalled {
                        page: page_no,
                        token: next,
                    });
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|a, b| a.key == b.key);
        report.listed = entries.len();
        Ok(entries)
    }

    fn candidates(&self, entries: Vec<ObjectEntry>, report: &mut SweepReport) -> Vec<String> {
        let now = self.clock.now();
        let min_age = TimeDelta::from_std(self.config.min_object_age).unwrap_or(TimeDelta::MAX);

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.key.starts_with(&self.config.prefix) {
                report.out_of_scope += 1;
                continue;
            }
            if min_age > TimeDelta::zero()
                && now.signed_duration_since(entry.last_modified) < min_age
            {
                report.too_young += 1;
                continue;
            }
            keys.push(entry.key);
        }
        keys
    }

    /// Batch set-difference of candidate keys against live records. A failed
    /// batch leaves its keys undetermined, so they are skipped, never deleted.
    async fn find_orphans(&self, candidates: Vec<String>, report: &mut SweepReport) -> Vec<String> {
        let mut orphans = Vec::new();

        for chunk in candidates.chunks(self.config.lookup_batch.max(1)) {
            let lookup = metadata_store::with_timeout(
                self.config.store_timeout,
                self.metadata.live_keys(chunk),
            )
            .await;

            match lookup {
                Ok(live) => {
                    for key in chunk {
                        if live.contains(key) {
                            report.live += 1;
                        } else {
                            orphans.push(key.clone());
                        }
                    }
                }
                Err(err) => {
                    report.skipped += chunk.len();
                    warn!(
                        error = %err,
                        keys = chunk.len(),
                        first_key = %chunk[0],
                        "liveness lookup failed; skipping keys this cycle"
                    );
                }
            }
        }

        report.orphans = orphans.len();
        orphans
    }

    async fn delete_orphans(&self, orphans: Vec<String>, report: &mut SweepReport) {
        let limit = self.config.store_timeout;
        let outcomes: Vec<_> = stream::iter(orphans)
            .map(|key| async move {
                let result = object_client::with_timeout(limit, self.objects.delete(&key)).await;
                (key, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (key, result) in outcomes {
            match result {
                Ok(()) => {
                    report.deleted += 1;
                    info!(key = %key, "deleted orphaned object");
                }
                Err(err) if err.is_not_found() => {
                    report.already_gone += 1;
                    debug!(key = %key, "orphaned object already gone");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(key = %key, error = %err, "failed to delete orphaned object");
                }
            }
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    ///
    /// Cycles run inline, so a slow cycle delays the next tick instead of
    /// overlapping it; missed ticks are dropped. On shutdown an in-flight
    /// cycle gets `shutdown_grace` to finish and is abandoned after that.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            prefix = %self.config.prefix,
            interval_secs = self.config.interval.as_secs(),
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = self.sweep();
            tokio::pin!(cycle);
            tokio::select! {
                result = &mut cycle => log_cycle(result),
                _ = shutdown.cancelled() => {
                    match tokio::time::timeout(self.config.shutdown_grace, &mut cycle).await {
                        Ok(result) => log_cycle(result),
                        Err(_) => warn!("abandoning in-flight sweep after shutdown grace period"),
                    }
                    break;
                }
            }
        }
        info!("reconciler stopped");
    }
}

fn log_cycle(result: Result<SweepReport, SweepError>) {
    match result {
        Ok(_) => {}
        Err(SweepError::AlreadyRunning) => debug!("previous sweep still running; tick skipped"),
        Err(err) => error!(error = %err, "sweep aborted; retrying next cycle"),
    }
}
