use std::sync::Arc;

use due_sync_client::DueApi;
use due_sync_core::timestamp::rfc3339;
use due_sync_core::{
    normalize, ChangeDetector, CheckOutcome, Clock, DuePayload, NormalizedRecordSet, RecordId,
    StoredRecord, SyncError,
};
use tracing::debug;

/// Result of a cheap check on a settled record.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckResult {
    /// Remote timestamp did not move; only the last-sync stamp needs advancing.
    Unchanged(RecordId),
    Changed(NormalizedRecordSet),
}

/// Per-record work run inside the worker pool: detail fetch, gated
/// sub-resource fetches, then normalization.
#[derive(Clone)]
pub struct RecordPipeline {
    api: Arc<DueApi>,
    detector: ChangeDetector,
    clock: Arc<dyn Clock>,
}

impl RecordPipeline {
    #[must_use]
    pub fn new(api: Arc<DueApi>, detector: ChangeDetector, clock: Arc<dyn Clock>) -> Self {
        Self { api, detector, clock }
    }

    /// Costs one detail call plus one per enabled sub-resource.
    ///
    /// # Errors
    /// Any error from the API calls; a failed sub-resource fails the record.
    pub fn full_fetch(&self, id: &RecordId) -> Result<NormalizedRecordSet, SyncError> {
        let payload = self.api.fetch_detail(id)?;
        self.complete(id, &payload)
    }

    /// One detail call; the sub-resources are fetched only when the remote
    /// registration timestamp moved past the stored one. The detail payload
    /// already in hand is reused for the refetch.
    ///
    /// # Errors
    /// Any error from the API calls.
    pub fn cheap_check(&self, record: &StoredRecord) -> Result<CheckResult, SyncError> {
        let payload = self.api.fetch_detail(&record.id)?;
        let outcome = self
            .detector
            .evaluate(record.remote_modified.as_deref(), payload.data_de_registro.as_deref());
        match outcome {
            CheckOutcome::Unchanged => {
                debug!(record = %record.id, "unchanged since last sync");
                Ok(CheckResult::Unchanged(record.id.clone()))
            }
            CheckOutcome::Changed => {
                debug!(
                    record = %record.id,
                    stored = record.remote_modified.as_deref().unwrap_or("-"),
                    remote = payload.data_de_registro.as_deref().unwrap_or("-"),
                    "changed upstream; refetching"
                );
                self.complete(&record.id, &payload).map(CheckResult::Changed)
            }
        }
    }

    fn complete(
        &self,
        id: &RecordId,
        payload: &DuePayload,
    ) -> Result<NormalizedRecordSet, SyncError> {
        let subresources = self.api.fetch_subresources(id)?;
        let synced_at = rfc3339(self.clock.now())?;
        Ok(normalize(id, payload, &subresources, &synced_at))
    }
}
