use std::collections::BTreeMap;

use due_sync_core::{
    NormalizedRecordSet, RecordId, RecordLink, StorageSink, SyncConfig, SyncError,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::pool::ItemFailure;

/// What a flush managed to write.
#[derive(Debug, Default)]
pub struct FlushSummary {
    pub persisted: usize,
    pub advanced: usize,
    pub failures: Vec<ItemFailure>,
}

/// Writes consolidated results through a [`StorageSink`].
///
/// Batches are retried after a reconnect up to `max_attempts` times; a batch
/// that still fails is split and retried record by record.
#[derive(Debug, Clone, Copy)]
pub struct Persister {
    batch_size: usize,
    max_attempts: u32,
}

impl Persister {
    #[must_use]
    pub fn new(batch_size: usize, max_attempts: u32) -> Self {
        Self { batch_size: batch_size.max(1), max_attempts: max_attempts.max(1) }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.persist_batch_size, config.persist_max_attempts)
    }

    /// Persists every set (last one wins per record id) and stamps `unchanged`
    /// as synced at `at`.
    pub fn flush(
        &self,
        sink: &mut dyn StorageSink,
        sets: Vec<NormalizedRecordSet>,
        unchanged: &[RecordId],
        at: OffsetDateTime,
    ) -> FlushSummary {
        let mut summary = FlushSummary::default();
        let by_id: BTreeMap<RecordId, NormalizedRecordSet> =
            sets.into_iter().map(|set| (set.record_id.clone(), set)).collect();
        let sets: Vec<NormalizedRecordSet> = by_id.into_values().collect();

        for chunk in sets.chunks(self.batch_size) {
            match self.with_retry(sink, "replace records", |sink| sink.replace_records(chunk)) {
                Ok(written) => summary.persisted += written,
                Err(err) => {
                    warn!(error = %err, batch = chunk.len(), "batch write failed; retrying per record");
                    for set in chunk {
                        match sink.replace_records(std::slice::from_ref(set)) {
                            Ok(written) => summary.persisted += written,
                            Err(err) => summary.failures.push(ItemFailure::new(
                                &set.record_id,
                                &SyncError::Persistence(format!("{err:#}")),
                            )),
                        }
                    }
                }
            }
        }

        if !unchanged.is_empty() {
            match self.with_retry(sink, "advance last sync", |sink| {
                sink.advance_last_sync(unchanged, at)
            }) {
                Ok(advanced) => summary.advanced = advanced,
                Err(err) => {
                    let err = SyncError::Persistence(format!("{err:#}"));
                    summary
                        .failures
                        .extend(unchanged.iter().map(|id| ItemFailure::new(id, &err)));
                }
            }
        }

        info!(
            persisted = summary.persisted,
            advanced = summary.advanced,
            failed = summary.failures.len(),
            "flush complete"
        );
        summary
    }

    /// # Errors
    /// Returns [`SyncError::Persistence`] once every attempt has failed.
    pub fn save_links(
        &self,
        sink: &mut dyn StorageSink,
        links: &[RecordLink],
    ) -> Result<usize, SyncError> {
        if links.is_empty() {
            return Ok(0);
        }
        self.with_retry(sink, "save links", |sink| sink.save_links(links))
            .map_err(|err| SyncError::Persistence(format!("{err:#}")))
    }

    fn with_retry<T, F>(&self, sink: &mut dyn StorageSink, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut(&mut dyn StorageSink) -> anyhow::Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op(sink) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    warn!(what, attempt, error = %err, "storage write failed; reconnecting");
                    if let Err(reconnect) = sink.reconnect() {
                        warn!(error = %reconnect, "reconnect failed");
                    }
                    attempt += 1;
                    debug!(what, attempt, "retrying storage write");
                }
            }
        }
    }
}
