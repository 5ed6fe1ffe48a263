use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use due_sync_client::{GovernorSnapshot, RegistryClient};
use due_sync_core::{
    CancellationToken, CandidateFilter, ChangeDetector, Classification, Clock, ExternalRef,
    NormalizedRecordSet, RecordId, RecordLink, StorageSink, StoredRecord, SyncConfig, SyncError,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use ulid::Ulid;

use crate::persist::{FlushSummary, Persister};
use crate::pipeline::{CheckResult, RecordPipeline};
use crate::pool::{FetchWorkerPool, ItemFailure, PoolOutcome, StopReason};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Discover,
    Refresh,
}

/// Refresh knobs that come from the command line rather than config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Ignore the refresh interval and take every non-cancelled record.
    pub force: bool,
    /// Overrides `per_run_record_cap` for this run.
    pub limit: Option<usize>,
}

/// How many candidates of each kind a refresh run selected.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CandidateBreakdown {
    pub orphans: usize,
    pub pending: usize,
    pub settled_recent: usize,
    pub settled_old: usize,
    /// Candidates dropped by the per-run cap.
    pub capped: usize,
}

/// Outcome of one discovery or refresh run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Ulid,
    pub mode: RunMode,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub candidates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<CandidateBreakdown>,
    pub links_found: usize,
    pub links_saved: usize,
    pub skipped_existing: usize,
    pub fetched: usize,
    pub unchanged: usize,
    pub persisted: usize,
    pub advanced: usize,
    pub failures: Vec<ItemFailure>,
    pub interrupted: usize,
    /// Work left for a later run: interrupted, never started, or skipped.
    pub remaining: usize,
    pub stop: Option<StopReason>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub retry_at: Option<OffsetDateTime>,
    pub requests_sent: u64,
    pub network_logins: u64,
    pub governor: GovernorSnapshot,
}

impl RunReport {
    fn new(mode: RunMode, started_at: OffsetDateTime, governor: GovernorSnapshot) -> Self {
        Self {
            run_id: Ulid::new(),
            mode,
            started_at,
            finished_at: started_at,
            candidates: 0,
            breakdown: None,
            links_found: 0,
            links_saved: 0,
            skipped_existing: 0,
            fetched: 0,
            unchanged: 0,
            persisted: 0,
            advanced: 0,
            failures: Vec::new(),
            interrupted: 0,
            remaining: 0,
            stop: None,
            retry_at: None,
            requests_sent: 0,
            network_logins: 0,
            governor,
        }
    }

    /// Nothing left over and no stop recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.stop.is_none() && self.remaining == 0
    }

    fn absorb<I, T>(&mut self, outcome: &mut PoolOutcome<I, T>) {
        self.failures.append(&mut outcome.failures);
        self.interrupted += outcome.interrupted.len();
        self.remaining += outcome.remaining();
        if self.stop.is_none() {
            self.stop = outcome.stop.take();
        }
    }

    fn absorb_flush(&mut self, flush: FlushSummary) {
        self.persisted += flush.persisted;
        self.advanced += flush.advanced;
        self.failures.extend(flush.failures);
    }
}

/// Drives discovery and refresh runs against one registry client and one
/// storage sink.
///
/// A run never fails because of a single record or a rate limit: those end
/// up in the [`RunReport`]. Only storage reads that the run cannot start
/// without are returned as errors.
pub struct IngestionOrchestrator {
    config: SyncConfig,
    client: RegistryClient,
    pipeline: RecordPipeline,
    persister: Persister,
    detector: ChangeDetector,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl IngestionOrchestrator {
    #[must_use]
    pub fn new(
        config: SyncConfig,
        client: RegistryClient,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let detector = ChangeDetector::from_config(&config);
        let pipeline = RecordPipeline::new(Arc::clone(&client.api), detector, Arc::clone(&clock));
        let persister = Persister::from_config(&config);
        Self { config, client, pipeline, persister, detector, clock, cancel }
    }

    #[must_use]
    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves seeded invoice keys that have no link yet, then fetches the
    /// declarations they point to that are not stored.
    ///
    /// # Errors
    /// Returns an error when the seeded keys, links or stored ids cannot be read.
    pub fn discover(&self, sink: &mut dyn StorageSink) -> Result<RunReport> {
        let mut run = self.start(RunMode::Discover);

        let refs = sink.get_external_refs().context("failed to load seeded invoice keys")?;
        let linked: BTreeSet<ExternalRef> = sink
            .get_links()
            .context("failed to load invoice links")?
            .into_iter()
            .map(|link| link.external_ref)
            .collect();
        let unlinked: Vec<ExternalRef> = refs
            .into_iter()
            .filter(|key| !linked.contains(key))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        run.report.candidates = unlinked.len();
        if unlinked.is_empty() {
            info!("no unlinked invoice keys; nothing to discover");
            return Ok(self.finish(run));
        }
        info!(unlinked = unlinked.len(), "resolving invoice keys");

        let api = Arc::clone(&self.client.api);
        let mut lookup = FetchWorkerPool::new(self.config.lookup_concurrency)
            .run(&unlinked, &self.cancel, |key| api.lookup_by_invoice(key));
        let links: Vec<RecordLink> = lookup.completed.drain(..).flatten().collect();
        run.report.links_found = links.len();
        run.report.absorb(&mut lookup);

        match self.persister.save_links(sink, &links) {
            Ok(saved) => run.report.links_saved = saved,
            Err(err) => {
                warn!(error = %err, "links could not be saved; nothing will be fetched");
                run.report.stop = Some(StopReason::Fatal { code: err.code(), message: err.to_string() });
                return Ok(self.finish(run));
            }
        }
        if run.report.stop.is_some() {
            info!(links = links.len(), "lookup stopped early; linked records stay for refresh");
            return Ok(self.finish(run));
        }

        let mut ids: Vec<RecordId> = links
            .into_iter()
            .map(|link| link.record_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let existing = sink.existing_records(&ids).context("failed to check stored declarations")?;
        ids.retain(|id| !existing.contains(id));
        run.report.skipped_existing = existing.len();

        let mut fetch = FetchWorkerPool::new(self.config.fetch_concurrency)
            .run(&ids, &self.cancel, |id| self.pipeline.full_fetch(id));
        let sets: Vec<NormalizedRecordSet> = fetch.completed.drain(..).collect();
        run.report.fetched = sets.len();
        run.report.absorb(&mut fetch);

        let flush = self.persister.flush(sink, sets, &[], self.clock.now());
        run.report.absorb_flush(flush);
        Ok(self.finish(run))
    }

    /// Re-syncs stored declarations and orphaned links.
    ///
    /// Orphans, pending and recently settled records are fetched in full
    /// first. Older settled records get a cheap check afterwards, unless the
    /// first phase stopped.
    ///
    /// # Errors
    /// Returns an error when candidates cannot be read from storage.
    pub fn refresh(&self, sink: &mut dyn StorageSink, options: RefreshOptions) -> Result<RunReport> {
        let mut run = self.start(RunMode::Refresh);
        let now = run.report.started_at;
        let filter = CandidateFilter {
            detector: self.detector,
            now,
            stale_before: if options.force {
                None
            } else {
                Some(now - self.config.refresh_interval())
            },
        };

        let orphans = sink.get_orphans().context("failed to load orphaned links")?;
        let pending = self.candidates(sink, Classification::Pending, &filter)?;
        let recent = self.candidates(sink, Classification::SettledRecent, &filter)?;
        let old = self.candidates(sink, Classification::SettledOld, &filter)?;
        let found = orphans.len() + pending.len() + recent.len() + old.len();

        let mut budget = options.limit.unwrap_or(self.config.per_run_record_cap);
        let orphans = take_capped(orphans, &mut budget);
        let pending = take_capped(pending, &mut budget);
        let recent = take_capped(recent, &mut budget);
        let old = take_capped(old, &mut budget);
        let breakdown = CandidateBreakdown {
            orphans: orphans.len(),
            pending: pending.len(),
            settled_recent: recent.len(),
            settled_old: old.len(),
            capped: found - orphans.len() - pending.len() - recent.len() - old.len(),
        };
        run.report.candidates = found - breakdown.capped;
        run.report.breakdown = Some(breakdown);
        info!(
            orphans = breakdown.orphans,
            pending = breakdown.pending,
            settled_recent = breakdown.settled_recent,
            settled_old = breakdown.settled_old,
            capped = breakdown.capped,
            "refresh candidates selected"
        );

        let full: Vec<RecordId> = orphans
            .into_iter()
            .chain(pending.into_iter().map(|record| record.id))
            .chain(recent.into_iter().map(|record| record.id))
            .collect();
        let mut phase1 = FetchWorkerPool::new(self.config.fetch_concurrency)
            .run(&full, &self.cancel, |id| self.pipeline.full_fetch(id));
        let mut sets: Vec<NormalizedRecordSet> = phase1.completed.drain(..).collect();
        run.report.fetched = sets.len();
        run.report.absorb(&mut phase1);

        let mut unchanged = Vec::new();
        if run.report.stop.is_none() {
            let old_ids: Vec<RecordId> = old.iter().map(|record| record.id.clone()).collect();
            let by_id: BTreeMap<&RecordId, &StoredRecord> =
                old.iter().map(|record| (&record.id, record)).collect();
            let mut phase2 = FetchWorkerPool::new(self.config.refresh_concurrency)
                .run(&old_ids, &self.cancel, |id| match by_id.get(id) {
                    Some(record) => self.pipeline.cheap_check(record),
                    None => Err(SyncError::Processing(format!("no stored state for {id}"))),
                });
            for result in phase2.completed.drain(..) {
                match result {
                    CheckResult::Unchanged(id) => unchanged.push(id),
                    CheckResult::Changed(set) => sets.push(set),
                }
            }
            run.report.fetched = sets.len();
            run.report.unchanged = unchanged.len();
            run.report.absorb(&mut phase2);
        } else if !old.is_empty() {
            info!(skipped = old.len(), "first phase stopped; cheap checks deferred");
            run.report.remaining += old.len();
        }

        let flush = self.persister.flush(sink, sets, &unchanged, self.clock.now());
        run.report.absorb_flush(flush);
        Ok(self.finish(run))
    }

    fn candidates(
        &self,
        sink: &dyn StorageSink,
        classification: Classification,
        filter: &CandidateFilter,
    ) -> Result<Vec<StoredRecord>> {
        sink.get_candidates(classification, filter)
            .with_context(|| format!("failed to load {} candidates", classification.as_str()))
    }

    fn start(&self, mode: RunMode) -> Run {
        let report = RunReport::new(mode, self.clock.now(), self.client.governor.snapshot());
        info!(run_id = %report.run_id, mode = ?mode, "run started");
        Run {
            report,
            requests_before: self.client.gateway.requests_sent(),
            logins_before: self.client.auth.network_logins(),
        }
    }

    fn finish(&self, run: Run) -> RunReport {
        let mut report = run.report;
        report.finished_at = self.clock.now();
        report.requests_sent = self.client.gateway.requests_sent() - run.requests_before;
        report.network_logins = self.client.auth.network_logins() - run.logins_before;
        report.governor = self.client.governor.snapshot();
        report.retry_at = report.stop.as_ref().and_then(StopReason::retry_at);

        match &report.stop {
            Some(stop) => warn!(
                run_id = %report.run_id,
                stop = ?stop,
                persisted = report.persisted,
                remaining = report.remaining,
                "run stopped early"
            ),
            None => info!(
                run_id = %report.run_id,
                fetched = report.fetched,
                unchanged = report.unchanged,
                persisted = report.persisted,
                failures = report.failures.len(),
                requests = report.requests_sent,
                "run finished"
            ),
        }
        report
    }
}

struct Run {
    report: RunReport,
    requests_before: u64,
    logins_before: u64,
}

fn take_capped<T>(mut items: Vec<T>, budget: &mut usize) -> Vec<T> {
    items.truncate(*budget);
    *budget -= items.len();
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_respects_priority_order() {
        let mut budget = 5;
        let first = take_capped(vec![1, 2, 3], &mut budget);
        let second = take_capped(vec![4, 5, 6], &mut budget);
        let third = take_capped(vec![7], &mut budget);
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![4, 5]);
        assert!(third.is_empty());
        assert_eq!(budget, 0);
    }
}
