use std::collections::BTreeSet;

use anyhow::Result;
use time::OffsetDateTime;

use crate::detector::{ChangeDetector, Classification};
use crate::normalize::{NormalizedRecordSet, Row, Table};
use crate::record::{ExternalRef, RecordId, RecordLink, StoredRecord};

/// Selection window for refresh candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateFilter {
    pub detector: ChangeDetector,
    pub now: OffsetDateTime,
    /// Only records last synced before this instant (or never) qualify.
    /// `None` selects regardless of staleness.
    pub stale_before: Option<OffsetDateTime>,
}

impl CandidateFilter {
    /// True when `record` is in `classification` and due for a refresh.
    #[must_use]
    pub fn admits(&self, record: &StoredRecord, classification: Classification) -> bool {
        if self.detector.classify(record, self.now) != classification {
            return false;
        }
        match (self.stale_before, record.last_sync) {
            (Some(threshold), Some(last_sync)) => last_sync < threshold,
            _ => true,
        }
    }
}

/// Persistence collaborator of the sync engine.
///
/// Implementations are used from a single coordinating thread.
pub trait StorageSink {
    /// Invoice keys known to the business side.
    ///
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get_external_refs(&self) -> Result<Vec<ExternalRef>>;

    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get_links(&self) -> Result<Vec<RecordLink>>;

    /// Insert links that are not yet known; existing links are never changed.
    /// Returns how many were new.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    fn save_links(&mut self, links: &[RecordLink]) -> Result<usize>;

    /// Non-cancelled stored records in `classification`, least recently
    /// synced first.
    ///
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get_candidates(
        &self,
        classification: Classification,
        filter: &CandidateFilter,
    ) -> Result<Vec<StoredRecord>>;

    /// Linked record ids that have no stored declaration yet.
    ///
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get_orphans(&self) -> Result<Vec<RecordId>>;

    /// Subset of `ids` that already have a stored declaration.
    ///
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn existing_records(&self, ids: &[RecordId]) -> Result<BTreeSet<RecordId>>;

    /// Insert or update `rows` of `table`, resolving conflicts on `conflict_key`.
    ///
    /// # Errors
    /// Returns an error when the write fails or rows do not match the table.
    fn upsert_batch(&mut self, table: Table, rows: &[Row], conflict_key: &[&str]) -> Result<usize>;

    /// Atomically replace every listed table's rows for each record.
    ///
    /// # Errors
    /// Returns an error when the transaction fails; nothing is written then.
    fn replace_records(&mut self, sets: &[NormalizedRecordSet]) -> Result<usize>;

    /// Stamp `at` as the last sync time of `ids` without touching anything else.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    fn advance_last_sync(&mut self, ids: &[RecordId], at: OffsetDateTime) -> Result<usize>;

    /// Drop and reopen the underlying connection.
    ///
    /// # Errors
    /// Returns an error when the connection cannot be re-established.
    fn reconnect(&mut self) -> Result<()>;
}
