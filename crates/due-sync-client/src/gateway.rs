use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use due_sync_core::SyncError;
use tracing::{debug, warn};

use crate::auth::{AuthSession, Session};
use crate::governor::RateGovernor;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Single entry point for authenticated API calls.
///
/// Every call is admitted by the governor, carries the current session, and
/// has its response screened for overage signals. A 401 triggers one
/// re-authentication and one retry.
pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    governor: Arc<RateGovernor>,
    auth: Arc<AuthSession>,
    sent: AtomicU64,
}

impl RequestGateway {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        governor: Arc<RateGovernor>,
        auth: Arc<AuthSession>,
    ) -> Self {
        Self { transport, governor, auth, sent: AtomicU64::new(0) }
    }

    /// # Errors
    /// Returns [`SyncError::RateLimitExceeded`] when not admitted or on an
    /// upstream overage, [`SyncError::Authentication`] when the retry after
    /// re-authentication is rejected again, and transport errors unchanged.
    pub fn send(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
        let session = self.auth.current_or_login()?;
        let response = self.dispatch(request, &session)?;
        if response.status != 401 {
            return Ok(response);
        }

        debug!(url = %request.url, "request unauthorized; re-authenticating");
        let session = self.auth.refresh_after_unauthorized(&session)?;
        let response = self.dispatch(request, &session)?;
        if response.status == 401 {
            warn!(url = %request.url, "request unauthorized after re-authentication");
            return Err(SyncError::Authentication(format!(
                "{} rejected with 401 after re-authentication",
                request.url
            )));
        }
        Ok(response)
    }

    fn dispatch(&self, request: &HttpRequest, session: &Session) -> Result<HttpResponse, SyncError> {
        self.governor.admit()?;
        let request = request
            .clone()
            .with_header("Authorization", &session.set_token)
            .with_header("X-CSRF-Token", &session.csrf_token)
            .with_header("Accept", "application/json")
            .with_header("Content-Type", "application/json");
        self.sent.fetch_add(1, Ordering::SeqCst);
        let response = self.transport.execute(&request)?;
        self.governor.inspect(&response)?;
        Ok(response)
    }

    /// API calls handed to the transport, logins excluded.
    #[must_use]
    pub fn requests_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }
}
