use std::sync::Arc;

use due_sync_core::payload::{ConcessionAct, FiscalRequirement, LookupEntry};
use due_sync_core::{DuePayload, ExternalRef, RecordId, RecordLink, SubResources, SyncConfig, SyncError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::gateway::RequestGateway;
use crate::transport::{HttpRequest, HttpResponse};

pub const DUE_PATH: &str = "/due/api/ext/due";

/// Which optional per-declaration collections to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubResourceFlags {
    pub suspension_acts: bool,
    pub exemption_acts: bool,
    pub fiscal_requirements: bool,
}

impl SubResourceFlags {
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            suspension_acts: config.fetch_suspension_acts,
            exemption_acts: config.fetch_exemption_acts,
            fiscal_requirements: config.fetch_fiscal_requirements,
        }
    }

    /// Extra calls a full fetch makes beyond the detail call.
    #[must_use]
    pub fn enabled(self) -> usize {
        [self.suspension_acts, self.exemption_acts, self.fiscal_requirements]
            .into_iter()
            .filter(|flag| *flag)
            .count()
    }
}

/// Typed calls against the declaration registry.
pub struct DueApi {
    gateway: Arc<RequestGateway>,
    base_url: String,
    flags: SubResourceFlags,
}

impl DueApi {
    #[must_use]
    pub fn new(gateway: Arc<RequestGateway>, config: &SyncConfig) -> Self {
        Self {
            gateway,
            base_url: format!("{}{DUE_PATH}", config.api_base_url.trim_end_matches('/')),
            flags: SubResourceFlags::from_config(config),
        }
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    #[must_use]
    pub fn flags(&self) -> SubResourceFlags {
        self.flags
    }

    /// Declaration linked to an invoice key, if the registry knows one.
    ///
    /// # Errors
    /// Gateway errors, and [`SyncError::Transport`] for unexpected statuses.
    pub fn lookup_by_invoice(&self, key: &ExternalRef) -> Result<Option<RecordLink>, SyncError> {
        let url = format!("{}?nota-fiscal={}", self.base_url, key.as_str());
        let response = self.gateway.send(&HttpRequest::get(url))?;
        if matches!(response.status, 204 | 404) {
            return Ok(None);
        }
        ensure_success(&response, "invoice lookup")?;
        if response.body.trim().is_empty() {
            return Ok(None);
        }

        let entries: Vec<LookupEntry> = response.json()?;
        let link = entries
            .into_iter()
            .filter_map(|entry| entry.rel)
            .map(|rel| rel.trim().to_string())
            .find(|rel| !rel.is_empty())
            .map(|rel| RecordLink { external_ref: key.clone(), record_id: RecordId::new(rel) });
        if link.is_none() {
            debug!(invoice = %key, "no declaration linked to invoice");
        }
        Ok(link)
    }

    /// # Errors
    /// Gateway errors, [`SyncError::Processing`] for a missing declaration or
    /// an unreadable body, and [`SyncError::Transport`] for other statuses.
    pub fn fetch_detail(&self, id: &RecordId) -> Result<DuePayload, SyncError> {
        let url = format!("{}/numero-da-due/{}", self.base_url, id.as_str());
        let response = self.gateway.send(&HttpRequest::get(url))?;
        if response.status == 404 {
            return Err(SyncError::Processing(format!("declaration {id} not found")));
        }
        ensure_success(&response, "declaration detail")?;
        response.json()
    }

    /// # Errors
    /// Gateway errors, and [`SyncError::Processing`] for unreadable entries.
    pub fn fetch_suspension_acts(
        &self,
        id: &RecordId,
    ) -> Result<Option<Vec<ConcessionAct>>, SyncError> {
        self.fetch_list(id, "drawback/suspensao/atos-concessorios")
    }

    /// # Errors
    /// Gateway errors, and [`SyncError::Processing`] for unreadable entries.
    pub fn fetch_exemption_acts(
        &self,
        id: &RecordId,
    ) -> Result<Option<Vec<ConcessionAct>>, SyncError> {
        self.fetch_list(id, "drawback/isencao/atos-concessorios")
    }

    /// # Errors
    /// Gateway errors, and [`SyncError::Processing`] for unreadable entries.
    pub fn fetch_fiscal_requirements(
        &self,
        id: &RecordId,
    ) -> Result<Option<Vec<FiscalRequirement>>, SyncError> {
        self.fetch_list(id, "exigencias-fiscais")
    }

    /// Collections enabled by the flags; disabled ones stay `None`.
    ///
    /// # Errors
    /// The first error from any of the calls.
    pub fn fetch_subresources(&self, id: &RecordId) -> Result<SubResources, SyncError> {
        let mut subresources = SubResources::default();
        if self.flags.suspension_acts {
            subresources.suspension_acts = self.fetch_suspension_acts(id)?;
        }
        if self.flags.exemption_acts {
            subresources.exemption_acts = self.fetch_exemption_acts(id)?;
        }
        if self.flags.fiscal_requirements {
            subresources.fiscal_requirements = self.fetch_fiscal_requirements(id)?;
        }
        Ok(subresources)
    }

    /// `Some(list)` when the registry answered, empty for "nothing there";
    /// `None` when it failed, leaving stored rows alone.
    fn fetch_list<T: DeserializeOwned>(
        &self,
        id: &RecordId,
        path: &str,
    ) -> Result<Option<Vec<T>>, SyncError> {
        let url = format!("{}/{}/{path}", self.base_url, id.as_str());
        let response = self.gateway.send(&HttpRequest::get(url))?;
        if matches!(response.status, 204 | 404) {
            return Ok(Some(Vec::new()));
        }
        if !response.is_success() {
            warn!(record = %id, path, status = response.status, "sub-resource unavailable");
            return Ok(None);
        }
        if response.body.trim().is_empty() {
            return Ok(Some(Vec::new()));
        }

        match response.json::<Value>()? {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<T>, _>>()
                .map(Some)
                .map_err(|err| {
                    SyncError::Processing(format!("unreadable {path} for {id}: {err}"))
                }),
            _ => Ok(Some(Vec::new())),
        }
    }
}

fn ensure_success(response: &HttpResponse, what: &str) -> Result<(), SyncError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(SyncError::Transport(format!("{what} failed with status {}", response.status)))
    }
}
