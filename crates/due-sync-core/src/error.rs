use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Where a rate-limit stop came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OverageOrigin {
    /// The local rolling budget is spent.
    LocalBudget,
    /// A previously signalled cooldown window is still active.
    Cooldown,
    /// Upstream answered with HTTP 429.
    TooManyRequests,
    /// Upstream answered 200 with the quota-exceeded application code.
    QuotaExceeded,
}

impl OverageOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalBudget => "local_budget",
            Self::Cooldown => "cooldown",
            Self::TooManyRequests => "too_many_requests",
            Self::QuotaExceeded => "quota_exceeded",
        }
    }

    /// True when the upstream itself reported the overage.
    #[must_use]
    pub fn is_upstream_signal(self) -> bool {
        matches!(self, Self::TooManyRequests | Self::QuotaExceeded)
    }
}

impl Display for OverageOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy shared by every sync component.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("rate limit exceeded ({origin}); calls blocked until {retry_at}")]
    RateLimitExceeded { retry_at: OffsetDateTime, origin: OverageOrigin },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("processing error: {0}")]
    Processing(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SyncError {
    pub const CONFIGURATION_INVALID: &'static str = "CONFIGURATION_INVALID";
    pub const SECURITY_AUTH_FAILED: &'static str = "SECURITY_AUTH_FAILED";
    pub const NETWORK_RATE_LIMITED: &'static str = "NETWORK_RATE_LIMITED";
    pub const NETWORK_CONNECTION_FAILED: &'static str = "NETWORK_CONNECTION_FAILED";
    pub const VALIDATION_INVALID_FORMAT: &'static str = "VALIDATION_INVALID_FORMAT";
    pub const DB_WRITE_FAILED: &'static str = "DB_WRITE_FAILED";

    /// Stable machine-readable code for reports.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => Self::CONFIGURATION_INVALID,
            Self::Authentication(_) => Self::SECURITY_AUTH_FAILED,
            Self::RateLimitExceeded { .. } => Self::NETWORK_RATE_LIMITED,
            Self::Transport(_) => Self::NETWORK_CONNECTION_FAILED,
            Self::Processing(_) => Self::VALIDATION_INVALID_FORMAT,
            Self::Persistence(_) => Self::DB_WRITE_FAILED,
        }
    }

    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Errors that stop the whole run rather than a single record.
    #[must_use]
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Authentication(_) | Self::RateLimitExceeded { .. }
        )
    }

    #[must_use]
    pub fn retry_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::RateLimitExceeded { retry_at, .. } => Some(*retry_at),
            _ => None,
        }
    }
}
