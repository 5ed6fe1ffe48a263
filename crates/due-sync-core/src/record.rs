use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// DUE number, the business key of a declaration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invoice access key (NF key) used to discover the declaration it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ExternalRef(String);

impl ExternalRef {
    pub const KEY_LENGTH: usize = 44;

    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    /// Parses a raw line, keeping only well-formed 44-digit keys.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() == Self::KEY_LENGTH && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(trimmed.to_string()))
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExternalRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable association between an invoice key and a declaration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordLink {
    pub external_ref: ExternalRef,
    pub record_id: RecordId,
}

pub const CANCELLED_SITUATIONS: [&str; 4] = [
    "CANCELADA_POR_EXPIRACAO_DE_PRAZO",
    "CANCELADA_PELA_ADUANA_A_PEDIDO_DO_EXPORTADOR",
    "CANCELADA_PELO_EXPORTADOR",
    "CANCELADA_PELO_SISCOMEX",
];

pub const SETTLED_SITUATIONS: [&str; 2] = ["AVERBADA_SEM_DIVERGENCIA", "AVERBADA_COM_DIVERGENCIA"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Settled,
    Cancelled,
}

impl RecordStatus {
    /// Maps the upstream `situacao` string onto the closed status set.
    /// Unknown situations are still in progress as far as sync is concerned.
    #[must_use]
    pub fn from_situation(situation: &str) -> Self {
        let situation = situation.trim();
        if CANCELLED_SITUATIONS.contains(&situation) {
            Self::Cancelled
        } else if SETTLED_SITUATIONS.contains(&situation) {
            Self::Settled
        } else {
            Self::Pending
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Sync-relevant view of a stored declaration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub situation: String,
    pub status: RecordStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub settled_at: Option<OffsetDateTime>,
    /// Raw `dataDeRegistro` as last received.
    pub remote_modified: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
}

impl StoredRecord {
    #[must_use]
    pub fn new(id: RecordId, situation: impl Into<String>) -> Self {
        let situation = situation.into();
        let status = RecordStatus::from_situation(&situation);
        Self { id, situation, status, settled_at: None, remote_modified: None, last_sync: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn situations_map_to_closed_status_set() {
        assert_eq!(
            RecordStatus::from_situation("CANCELADA_PELO_EXPORTADOR"),
            RecordStatus::Cancelled
        );
        assert_eq!(RecordStatus::from_situation("AVERBADA_COM_DIVERGENCIA"), RecordStatus::Settled);
        assert_eq!(RecordStatus::from_situation("EM_CARGA"), RecordStatus::Pending);
        assert_eq!(RecordStatus::from_situation("SOMETHING_NEW"), RecordStatus::Pending);
        assert_eq!(RecordStatus::from_situation(""), RecordStatus::Pending);
    }

    #[test]
    fn external_ref_parse_rejects_malformed_keys() {
        let key = "35250112345678000190550010000123451000012345";
        assert_eq!(ExternalRef::parse(&format!("  {key}\n")).map(|r| r.to_string()), Some(key.to_string()));
        assert!(ExternalRef::parse("123").is_none());
        assert!(ExternalRef::parse("3525011234567800019055001000012345100001234X").is_none());
    }

    #[test]
    fn record_id_is_trimmed() {
        assert_eq!(RecordId::new(" 24BR0000000001 ").as_str(), "24BR0000000001");
    }
}
