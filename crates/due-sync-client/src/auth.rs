use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use due_sync_core::{Clock, Credentials, SyncConfig, SyncError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::governor::RateGovernor;
use crate::transport::{HttpRequest, HttpResponse, Transport};

pub const LOGIN_PATH: &str = "/portal/api/autenticar/chave-acesso";
pub const ROLE_TYPE: &str = "IMPEXP";

/// Credentials attached to every API call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub set_token: String,
    pub csrf_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub authenticated_at: OffsetDateTime,
}

impl Session {
    /// Usable until `margin` before the upstream expiry.
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime, margin: Duration) -> bool {
        now < self.expires_at - margin
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("set_token", &"<redacted>")
            .field("csrf_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("authenticated_at", &self.authenticated_at)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedSession {
    #[serde(flatten)]
    session: Session,
    #[serde(with = "time::serde::rfc3339")]
    cached_at: OffsetDateTime,
}

/// JSON file persisting the last session across process runs.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached session still usable at `now`. Stale, expired or unreadable
    /// caches are removed and yield `None`.
    #[must_use]
    pub fn load(
        &self,
        now: OffsetDateTime,
        staleness: Duration,
        margin: Duration,
    ) -> Option<Session> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let cached: CachedSession = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "discarding unreadable token cache");
                self.clear();
                return None;
            }
        };

        if now - cached.cached_at >= staleness {
            debug!(path = %self.path.display(), "token cache is stale");
            self.clear();
            return None;
        }
        if !cached.session.is_valid_at(now, margin) {
            debug!(path = %self.path.display(), "cached token is expired or about to expire");
            self.clear();
            return None;
        }
        Some(cached.session)
    }

    /// # Errors
    /// Returns [`SyncError::Configuration`] when the cache cannot be written.
    pub fn save(&self, session: &Session, now: OffsetDateTime) -> Result<(), SyncError> {
        let cached = CachedSession { session: session.clone(), cached_at: now };
        let raw = serde_json::to_string_pretty(&cached)
            .map_err(|err| SyncError::Configuration(format!("failed to encode token cache: {err}")))?;
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                SyncError::Configuration(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, raw)
            .and_then(|()| fs::rename(&staging, &self.path))
            .map_err(|err| {
                SyncError::Configuration(format!(
                    "failed to write token cache {}: {err}",
                    self.path.display()
                ))
            })
    }

    pub fn clear(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove token cache");
            }
        }
    }
}

/// Summary of the session for status output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TokenStatus {
    pub state: &'static str,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub authenticated_at: Option<OffsetDateTime>,
    pub seconds_remaining: i64,
    pub network_logins: u64,
}

#[derive(Debug, Default)]
struct AuthState {
    session: Option<Session>,
    in_flight: bool,
    generation: u64,
    last_outcome: Option<Result<Session, SyncError>>,
    last_attempt: Option<OffsetDateTime>,
}

/// How a caller gets its session: already at hand, from a login it waited
/// on, or by performing the login itself.
enum Entry {
    Ready(Session),
    Joined(Result<Session, SyncError>),
    Lead,
}

/// Holds the current session and performs logins.
///
/// At most one login is in flight at a time; callers arriving meanwhile
/// wait for it and share its outcome. Consecutive login attempts are spaced
/// by the configured minimum interval, and each attempt passes through the
/// [`RateGovernor`].
pub struct AuthSession {
    transport: Arc<dyn Transport>,
    governor: Arc<RateGovernor>,
    clock: Arc<dyn Clock>,
    credentials: Result<Credentials, SyncError>,
    login_url: String,
    store: Option<SessionStore>,
    safety_margin: Duration,
    staleness: Duration,
    min_login_interval: Duration,
    default_lifetime: Duration,
    state: Mutex<AuthState>,
    login_done: Condvar,
    network_logins: AtomicU64,
}

impl AuthSession {
    /// Missing credentials are only reported when a login is actually needed,
    /// so a valid cached session keeps working without them.
    #[must_use]
    pub fn new(
        config: &SyncConfig,
        transport: Arc<dyn Transport>,
        governor: Arc<RateGovernor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            governor,
            clock,
            credentials: config.credentials(),
            login_url: format!("{}{LOGIN_PATH}", config.api_base_url.trim_end_matches('/')),
            store: config.token_cache_path.clone().map(SessionStore::new),
            safety_margin: config.token_safety_margin(),
            staleness: config.token_staleness(),
            min_login_interval: config.min_login_interval(),
            default_lifetime: config.default_token_lifetime(),
            state: Mutex::new(AuthState::default()),
            login_done: Condvar::new(),
            network_logins: AtomicU64::new(0),
        }
    }

    /// Valid session, logging in when there is none.
    ///
    /// # Errors
    /// Returns [`SyncError::Authentication`] when the login is rejected,
    /// [`SyncError::Configuration`] without credentials, and rate-limit or
    /// transport errors from the login call.
    pub fn current_or_login(&self) -> Result<Session, SyncError> {
        let entry = {
            let mut state = self.state.lock();
            self.restore_cached(&mut state);
            let now = self.clock.now();
            let usable = state
                .session
                .as_ref()
                .filter(|session| session.is_valid_at(now, self.safety_margin))
                .cloned();
            match usable {
                Some(session) => Entry::Ready(session),
                None => self.join_or_lead(&mut state),
            }
        };
        self.finish(entry)
    }

    /// Replace a session the upstream just rejected with 401.
    ///
    /// When another caller already replaced `stale`, its session is reused
    /// without a new login.
    ///
    /// # Errors
    /// Same as [`Self::current_or_login`].
    pub fn refresh_after_unauthorized(&self, stale: &Session) -> Result<Session, SyncError> {
        let entry = {
            let mut state = self.state.lock();
            let replaced = state
                .session
                .as_ref()
                .filter(|current| current.set_token != stale.set_token)
                .cloned();
            match replaced {
                Some(current) if !state.in_flight => Entry::Ready(current),
                _ => {
                    if !state.in_flight {
                        debug!("session rejected upstream; discarding it");
                        state.session = None;
                        if let Some(store) = &self.store {
                            store.clear();
                        }
                    }
                    self.join_or_lead(&mut state)
                }
            }
        };
        self.finish(entry)
    }

    #[must_use]
    pub fn status(&self) -> TokenStatus {
        let mut state = self.state.lock();
        self.restore_cached(&mut state);
        let now = self.clock.now();
        let network_logins = self.network_logins.load(Ordering::SeqCst);
        match &state.session {
            None => TokenStatus {
                state: "missing",
                expires_at: None,
                authenticated_at: None,
                seconds_remaining: 0,
                network_logins,
            },
            Some(session) => TokenStatus {
                state: if session.is_valid_at(now, self.safety_margin) {
                    "valid"
                } else {
                    "expiring"
                },
                expires_at: Some(session.expires_at),
                authenticated_at: Some(session.authenticated_at),
                seconds_remaining: (session.expires_at - now).whole_seconds().max(0),
                network_logins,
            },
        }
    }

    /// Number of logins that reached the network.
    #[must_use]
    pub fn network_logins(&self) -> u64 {
        self.network_logins.load(Ordering::SeqCst)
    }

    fn restore_cached(&self, state: &mut AuthState) {
        if state.session.is_some() {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        if let Some(session) = store.load(self.clock.now(), self.staleness, self.safety_margin) {
            debug!(path = %store.path().display(), "reusing cached session");
            state.last_attempt = Some(session.authenticated_at);
            state.session = Some(session);
        }
    }

    fn join_or_lead(&self, state: &mut parking_lot::MutexGuard<'_, AuthState>) -> Entry {
        if !state.in_flight {
            state.in_flight = true;
            return Entry::Lead;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.login_done.wait(state);
        }
        Entry::Joined(state.last_outcome.clone().unwrap_or_else(|| {
            Err(SyncError::Authentication("login finished without an outcome".to_string()))
        }))
    }

    fn finish(&self, entry: Entry) -> Result<Session, SyncError> {
        match entry {
            Entry::Ready(session) => Ok(session),
            Entry::Joined(outcome) => outcome,
            Entry::Lead => {
                let outcome = self.login();
                let mut state = self.state.lock();
                if let Ok(session) = &outcome {
                    state.session = Some(session.clone());
                }
                state.in_flight = false;
                state.generation = state.generation.wrapping_add(1);
                state.last_outcome = Some(outcome.clone());
                self.login_done.notify_all();
                outcome
            }
        }
    }

    fn login(&self) -> Result<Session, SyncError> {
        let credentials = self.credentials.as_ref().map_err(Clone::clone)?;
        let request = HttpRequest::post(&self.login_url)
            .with_header("Client-Id", &credentials.client_id)
            .with_header("Client-Secret", &credentials.client_secret)
            .with_header("Role-Type", ROLE_TYPE);

        let mut retried = false;
        loop {
            self.wait_for_login_slot();
            self.governor.admit()?;
            self.state.lock().last_attempt = Some(self.clock.now());
            self.network_logins.fetch_add(1, Ordering::SeqCst);
            info!(url = %self.login_url, "authenticating");

            let response = self.transport.execute(&request)?;
            match response.status {
                200..=299 => {
                    self.governor.inspect(&response)?;
                    let session = self.session_from(&response)?;
                    if let Some(store) = &self.store {
                        if let Err(err) = store.save(&session, self.clock.now()) {
                            warn!(error = %err, "token cache not updated");
                        }
                    }
                    info!(expires_at = %session.expires_at, "authenticated");
                    return Ok(session);
                }
                401 | 403 => {
                    return Err(SyncError::Authentication(format!(
                        "credentials rejected with status {}",
                        response.status
                    )));
                }
                422 | 429 if !retried => {
                    warn!(status = response.status, "login throttled; retrying once");
                    retried = true;
                }
                status => {
                    self.governor.inspect(&response)?;
                    return Err(SyncError::Authentication(format!(
                        "login failed with status {status}"
                    )));
                }
            }
        }
    }

    fn wait_for_login_slot(&self) {
        let last_attempt = self.state.lock().last_attempt;
        let Some(last_attempt) = last_attempt else {
            return;
        };
        let wait = last_attempt + self.min_login_interval - self.clock.now();
        if wait.is_positive() {
            info!(wait_secs = wait.whole_seconds(), "spacing consecutive logins");
            self.clock.sleep(wait);
        }
    }

    fn session_from(&self, response: &HttpResponse) -> Result<Session, SyncError> {
        let token = |name: &str| {
            response
                .header(name)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    SyncError::Authentication(format!("login response is missing `{name}`"))
                })
        };
        let now = self.clock.now();
        let expires_at = response
            .header("x-csrf-expiration")
            .and_then(|raw| raw.trim().parse::<i128>().ok())
            .and_then(|millis| OffsetDateTime::from_unix_timestamp_nanos(millis * 1_000_000).ok())
            .unwrap_or(now + self.default_lifetime);

        Ok(Session {
            set_token: token("set-token")?,
            csrf_token: token("x-csrf-token")?,
            expires_at,
            authenticated_at: now,
        })
    }
}
