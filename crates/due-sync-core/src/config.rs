use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::{Duration, UtcOffset};

use crate::error::SyncError;

pub const DEFAULT_API_BASE_URL: &str = "https://portalunico.siscomex.gov.br";

pub const ENV_CLIENT_ID: &str = "SISCOMEX_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "SISCOMEX_CLIENT_SECRET";
pub const ENV_SAFE_REQUEST_LIMIT: &str = "SISCOMEX_SAFE_REQUEST_LIMIT";
pub const ENV_FETCH_SUSPENSION_ACTS: &str = "SISCOMEX_FETCH_ATOS_SUSPENSAO";
pub const ENV_FETCH_EXEMPTION_ACTS: &str = "SISCOMEX_FETCH_ATOS_ISENCAO";
pub const ENV_FETCH_FISCAL_REQUIREMENTS: &str = "SISCOMEX_FETCH_EXIGENCIAS_FISCAIS";

/// Static configuration consumed by every sync component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub api_base_url: String,
    #[serde(skip_serializing)]
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,

    pub safe_request_budget: u32,
    pub upstream_hourly_quota: u32,

    pub fetch_concurrency: usize,
    pub refresh_concurrency: usize,
    pub lookup_concurrency: usize,
    pub per_run_record_cap: usize,

    pub recency_window_days: u32,
    pub refresh_interval_hours: u32,

    pub fetch_suspension_acts: bool,
    pub fetch_exemption_acts: bool,
    pub fetch_fiscal_requirements: bool,

    pub token_cache_path: Option<PathBuf>,
    pub token_safety_margin_secs: u32,
    pub token_staleness_secs: u32,
    pub min_login_interval_secs: u32,
    pub default_token_lifetime_secs: u32,

    pub request_timeout_secs: u32,
    /// Whole-hour offset the upstream uses in its "available again at" hints.
    pub upstream_utc_offset_hours: i8,

    pub persist_batch_size: usize,
    pub persist_max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            client_id: None,
            client_secret: None,
            safe_request_budget: 900,
            upstream_hourly_quota: 1000,
            fetch_concurrency: 20,
            refresh_concurrency: 5,
            lookup_concurrency: 5,
            per_run_record_cap: 500,
            recency_window_days: 7,
            refresh_interval_hours: 24,
            fetch_suspension_acts: true,
            fetch_exemption_acts: false,
            fetch_fiscal_requirements: true,
            token_cache_path: None,
            token_safety_margin_secs: 120,
            token_staleness_secs: 5400,
            min_login_interval_secs: 60,
            default_token_lifetime_secs: 3600,
            request_timeout_secs: 10,
            upstream_utc_offset_hours: -3,
            persist_batch_size: 50,
            persist_max_attempts: 3,
        }
    }
}

impl SyncConfig {
    /// Load a YAML config file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when the file is unreadable or malformed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Configuration(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// # Errors
    /// Returns [`SyncError::Configuration`] when the YAML does not match the config shape.
    pub fn from_yaml_str(raw: &str) -> Result<Self, SyncError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
            .map_err(|err| SyncError::Configuration(format!("invalid config YAML: {err}")))
    }

    /// Overlay process environment variables.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when a variable holds an unparseable value.
    pub fn apply_env(&mut self) -> Result<(), SyncError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup; blank values are ignored.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when a value cannot be parsed.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(value) = get(ENV_CLIENT_ID) {
            self.client_id = Some(value);
        }
        if let Some(value) = get(ENV_CLIENT_SECRET) {
            self.client_secret = Some(value);
        }
        if let Some(value) = get(ENV_SAFE_REQUEST_LIMIT) {
            self.safe_request_budget = value.parse().map_err(|_| {
                SyncError::Configuration(format!("{ENV_SAFE_REQUEST_LIMIT} must be an integer"))
            })?;
        }
        if let Some(value) = get(ENV_FETCH_SUSPENSION_ACTS) {
            self.fetch_suspension_acts = parse_flag(ENV_FETCH_SUSPENSION_ACTS, &value)?;
        }
        if let Some(value) = get(ENV_FETCH_EXEMPTION_ACTS) {
            self.fetch_exemption_acts = parse_flag(ENV_FETCH_EXEMPTION_ACTS, &value)?;
        }
        if let Some(value) = get(ENV_FETCH_FISCAL_REQUIREMENTS) {
            self.fetch_fiscal_requirements = parse_flag(ENV_FETCH_FISCAL_REQUIREMENTS, &value)?;
        }
        Ok(())
    }

    /// Check internal consistency. Credentials are checked separately by the
    /// session at login time so that offline commands still work without them.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), SyncError> {
        if !(self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://"))
        {
            return Err(SyncError::Configuration(format!(
                "api_base_url must be an http(s) URL, got {}",
                self.api_base_url
            )));
        }
        if self.safe_request_budget == 0 {
            return Err(SyncError::Configuration("safe_request_budget must be > 0".to_string()));
        }
        if self.safe_request_budget >= self.upstream_hourly_quota {
            return Err(SyncError::Configuration(format!(
                "safe_request_budget ({}) must stay strictly below upstream_hourly_quota ({})",
                self.safe_request_budget, self.upstream_hourly_quota
            )));
        }
        for (name, value) in [
            ("fetch_concurrency", self.fetch_concurrency),
            ("refresh_concurrency", self.refresh_concurrency),
            ("lookup_concurrency", self.lookup_concurrency),
            ("per_run_record_cap", self.per_run_record_cap),
            ("persist_batch_size", self.persist_batch_size),
        ] {
            if value == 0 {
                return Err(SyncError::Configuration(format!("{name} must be > 0")));
            }
        }
        if self.persist_max_attempts == 0 {
            return Err(SyncError::Configuration("persist_max_attempts must be > 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Configuration("request_timeout_secs must be > 0".to_string()));
        }
        if self.token_safety_margin_secs >= self.default_token_lifetime_secs {
            return Err(SyncError::Configuration(
                "token_safety_margin_secs must be shorter than default_token_lifetime_secs"
                    .to_string(),
            ));
        }
        self.upstream_offset()?;
        Ok(())
    }

    /// Credentials, or a configuration error naming the missing variable.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when either value is absent.
    pub fn credentials(&self) -> Result<Credentials, SyncError> {
        let client_id = self.client_id.clone().filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            SyncError::Configuration(format!("missing client id (set {ENV_CLIENT_ID})"))
        })?;
        let client_secret =
            self.client_secret.clone().filter(|v| !v.trim().is_empty()).ok_or_else(|| {
                SyncError::Configuration(format!("missing client secret (set {ENV_CLIENT_SECRET})"))
            })?;
        Ok(Credentials { client_id, client_secret })
    }

    /// # Errors
    /// Returns [`SyncError::Configuration`] for an offset outside +-23 hours.
    pub fn upstream_offset(&self) -> Result<UtcOffset, SyncError> {
        UtcOffset::from_hms(self.upstream_utc_offset_hours, 0, 0).map_err(|err| {
            SyncError::Configuration(format!("invalid upstream_utc_offset_hours: {err}"))
        })
    }

    /// Number of sub-resource endpoints enabled per record.
    #[must_use]
    pub fn enabled_subresource_count(&self) -> usize {
        [self.fetch_suspension_acts, self.fetch_exemption_acts, self.fetch_fiscal_requirements]
            .into_iter()
            .filter(|enabled| *enabled)
            .count()
    }

    #[must_use]
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.request_timeout_secs))
    }

    #[must_use]
    pub fn token_safety_margin(&self) -> Duration {
        Duration::seconds(i64::from(self.token_safety_margin_secs))
    }

    #[must_use]
    pub fn token_staleness(&self) -> Duration {
        Duration::seconds(i64::from(self.token_staleness_secs))
    }

    #[must_use]
    pub fn min_login_interval(&self) -> Duration {
        Duration::seconds(i64::from(self.min_login_interval_secs))
    }

    #[must_use]
    pub fn default_token_lifetime(&self) -> Duration {
        Duration::seconds(i64::from(self.default_token_lifetime_secs))
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::hours(i64::from(self.refresh_interval_hours))
    }
}

/// Client id and secret for the access-key login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, SyncError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SyncError::Configuration(format!("{key} must be a boolean, got {other}"))),
    }
}
