use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::config::SyncConfig;
use crate::record::{RecordStatus, StoredRecord};
use crate::timestamp::parse_remote_timestamp;

/// Sync class of a stored record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Pending,
    SettledRecent,
    SettledOld,
    Cancelled,
}

impl Classification {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::SettledRecent => "settled_recent",
            Self::SettledOld => "settled_old",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "settled_recent" => Some(Self::SettledRecent),
            "settled_old" => Some(Self::SettledOld),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPlan {
    Skip,
    FullRefresh,
    /// One detail call first; refetch only if the remote timestamp moved.
    CheapCheck,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Unchanged,
    Changed,
}

/// Decides how much work a stored record deserves on a refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDetector {
    recency_window: Duration,
    upstream_offset: UtcOffset,
}

impl ChangeDetector {
    #[must_use]
    pub fn new(recency_window_days: u32, upstream_offset: UtcOffset) -> Self {
        Self { recency_window: Duration::days(i64::from(recency_window_days)), upstream_offset }
    }

    /// Builds a detector from config; an invalid offset falls back to UTC and
    /// is reported separately by [`SyncConfig::validate`].
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.recency_window_days, config.upstream_offset().unwrap_or(UtcOffset::UTC))
    }

    #[must_use]
    pub fn classify(&self, record: &StoredRecord, now: OffsetDateTime) -> Classification {
        match record.status {
            RecordStatus::Cancelled => Classification::Cancelled,
            RecordStatus::Pending => Classification::Pending,
            RecordStatus::Settled => match record.settled_at {
                Some(settled_at) if now - settled_at <= self.recency_window => {
                    Classification::SettledRecent
                }
                _ => Classification::SettledOld,
            },
        }
    }

    #[must_use]
    pub fn plan(classification: Classification) -> RefreshPlan {
        match classification {
            Classification::Cancelled => RefreshPlan::Skip,
            Classification::Pending | Classification::SettledRecent => RefreshPlan::FullRefresh,
            Classification::SettledOld => RefreshPlan::CheapCheck,
        }
    }

    /// Compares the stored remote timestamp with the one just fetched.
    ///
    /// Unchanged only when both parse and the remote one is not newer; any
    /// missing or unreadable side forces a refetch.
    #[must_use]
    pub fn evaluate(&self, stored: Option<&str>, remote: Option<&str>) -> CheckOutcome {
        let stored = stored.and_then(|raw| parse_remote_timestamp(raw, self.upstream_offset));
        let remote = remote.and_then(|raw| parse_remote_timestamp(raw, self.upstream_offset));
        match (stored, remote) {
            (Some(stored), Some(remote)) if remote <= stored => CheckOutcome::Unchanged,
            _ => CheckOutcome::Changed,
        }
    }

    #[must_use]
    pub fn upstream_offset(&self) -> UtcOffset {
        self.upstream_offset
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{datetime, offset};

    use super::*;
    use crate::record::RecordId;

    fn detector() -> ChangeDetector {
        ChangeDetector::new(7, offset!(-3))
    }

    fn settled(days_ago: Option<i64>, now: OffsetDateTime) -> StoredRecord {
        let mut record = StoredRecord::new(RecordId::new("24BR0000000001"), "AVERBADA_SEM_DIVERGENCIA");
        record.settled_at = days_ago.map(|days| now - Duration::days(days));
        record
    }

    #[test]
    fn classification_follows_status_and_recency() {
        let now = datetime!(2026-01-20 12:00 UTC);
        let detector = detector();

        assert_eq!(detector.classify(&settled(Some(2), now), now), Classification::SettledRecent);
        assert_eq!(detector.classify(&settled(Some(7), now), now), Classification::SettledRecent);
        assert_eq!(detector.classify(&settled(Some(8), now), now), Classification::SettledOld);
        assert_eq!(detector.classify(&settled(None, now), now), Classification::SettledOld);

        let pending = StoredRecord::new(RecordId::new("24BR0000000002"), "EM_CARGA");
        assert_eq!(detector.classify(&pending, now), Classification::Pending);

        let cancelled = StoredRecord::new(RecordId::new("24BR0000000003"), "CANCELADA_PELO_SISCOMEX");
        assert_eq!(detector.classify(&cancelled, now), Classification::Cancelled);
    }

    #[test]
    fn plans_per_classification() {
        assert_eq!(ChangeDetector::plan(Classification::Cancelled), RefreshPlan::Skip);
        assert_eq!(ChangeDetector::plan(Classification::Pending), RefreshPlan::FullRefresh);
        assert_eq!(ChangeDetector::plan(Classification::SettledRecent), RefreshPlan::FullRefresh);
        assert_eq!(ChangeDetector::plan(Classification::SettledOld), RefreshPlan::CheapCheck);
    }

    #[test]
    fn evaluate_detects_newer_remote_timestamp() {
        let detector = detector();
        let stored = Some("2026-01-07T11:29:42.000-0300");

        assert_eq!(detector.evaluate(stored, stored), CheckOutcome::Unchanged);
        assert_eq!(
            detector.evaluate(stored, Some("2026-01-07T14:29:42Z")),
            CheckOutcome::Unchanged
        );
        assert_eq!(
            detector.evaluate(stored, Some("2026-01-06T08:00:00.000-0300")),
            CheckOutcome::Unchanged
        );
        assert_eq!(
            detector.evaluate(stored, Some("2026-01-08T09:00:00.000-0300")),
            CheckOutcome::Changed
        );
    }

    #[test]
    fn evaluate_treats_missing_or_garbage_as_changed() {
        let detector = detector();
        let valid = Some("2026-01-07T11:29:42.000-0300");
        assert_eq!(detector.evaluate(None, valid), CheckOutcome::Changed);
        assert_eq!(detector.evaluate(valid, None), CheckOutcome::Changed);
        assert_eq!(detector.evaluate(Some("n/a"), valid), CheckOutcome::Changed);
        assert_eq!(detector.evaluate(valid, Some("")), CheckOutcome::Changed);
    }
}
