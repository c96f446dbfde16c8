use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use assetflow_core::JobId;
use assetflow_lifecycle::WorkerKind;

use crate::store::StoreError;
use crate::workers::{MigrationRequest, ThumbnailRequest};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The call cannot be issued at all in this deployment.
    #[error("dispatch is not configured: {0}")]
    Config(String),
    #[error("worker endpoint unreachable: {0}")]
    Transport(String),
    #[error("worker endpoint answered {status}")]
    Rejected { status: u16 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One outbound worker call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WorkerCall {
    Migration(MigrationRequest),
    Thumbnail(ThumbnailRequest),
}

impl WorkerCall {
    pub fn kind(&self) -> WorkerKind {
        match self {
            WorkerCall::Migration(_) => WorkerKind::Migration,
            WorkerCall::Thumbnail(_) => WorkerKind::Thumbnail,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            WorkerCall::Migration(req) => req.job_id,
            WorkerCall::Thumbnail(req) => req.job_id,
        }
    }
}

/// Issues worker calls. Returning `Ok` means the call was delivered, not that
/// the work succeeded.
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn invoke(&self, call: &WorkerCall) -> Result<(), DispatchError>;
}

/// POSTs calls to `{base_url}/workers/{kind}` with an optional bearer token.
#[derive(Debug, Clone)]
pub struct HttpWorkerInvoker {
    client: Client,
    base_url: Option<String>,
    token: Option<String>,
}

impl HttpWorkerInvoker {
    pub fn new(base_url: Option<String>, token: Option<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            token,
        })
    }
}

#[async_trait]
impl WorkerInvoker for HttpWorkerInvoker {
    async fn invoke(&self, call: &WorkerCall) -> Result<(), DispatchError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| DispatchError::Config("WORKER_BASE_URL is not set".to_string()))?;
        let url = format!("{base}/workers/{}", call.kind().as_str());

        let mut request = self.client.post(&url).json(call);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DispatchError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
