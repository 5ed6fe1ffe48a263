//! Rate-governed, authenticated access to the Siscomex declaration registry.
//!
//! All traffic, logins included, passes one [`RateGovernor`]; API calls go
//! through the [`RequestGateway`], which owns the 401 re-authentication path.

pub mod api;
pub mod auth;
pub mod gateway;
pub mod governor;
pub mod transport;

use std::sync::Arc;

use due_sync_core::{Clock, SyncConfig, SyncError};

pub use api::{DueApi, SubResourceFlags};
pub use auth::{AuthSession, Session, SessionStore, TokenStatus};
pub use gateway::RequestGateway;
pub use governor::{CooldownWindow, GovernorSnapshot, RateGovernor};
pub use transport::{HttpRequest, HttpResponse, Method, Transport, UreqTransport};

/// Wires governor, session, gateway and API over one transport.
#[derive(Clone)]
pub struct RegistryClient {
    pub governor: Arc<RateGovernor>,
    pub auth: Arc<AuthSession>,
    pub gateway: Arc<RequestGateway>,
    pub api: Arc<DueApi>,
}

impl RegistryClient {
    /// # Errors
    /// Returns [`SyncError::Configuration`] when the configuration is invalid.
    pub fn new(
        config: &SyncConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let governor = Arc::new(RateGovernor::new(
            config.safe_request_budget,
            config.upstream_offset()?,
            Arc::clone(&clock),
        ));
        let auth = Arc::new(AuthSession::new(
            config,
            Arc::clone(&transport),
            Arc::clone(&governor),
            clock,
        ));
        let gateway =
            Arc::new(RequestGateway::new(transport, Arc::clone(&governor), Arc::clone(&auth)));
        let api = Arc::new(DueApi::new(Arc::clone(&gateway), config));
        Ok(Self { governor, auth, gateway, api })
    }

    /// Client over HTTPS with the configured timeout and the system clock.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when the configuration is invalid.
    pub fn over_https(config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Self, SyncError> {
        let transport: Arc<dyn Transport> = Arc::new(UreqTransport::new(config.request_timeout()));
        Self::new(config, transport, clock)
    }
}
