//! Controller-side worker transport and encrypted client.
//!
//! Every command to a worker travels as a sealed envelope over HTTP. The
//! transport trait isolates the HTTP client so tests can stand up in-process
//! fake workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use ariana_types::CoreError;
use ariana_wire::{AgentCipher, Envelope, HealthResponse, EP_HEALTH};

/// Raw envelope transport to one worker.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// POST a sealed envelope to `base_url` + `endpoint`, returning the
    /// sealed reply.
    async fn post(
        &self,
        base_url: &str,
        endpoint: &str,
        body: Envelope,
    ) -> Result<Envelope, CoreError>;

    /// Plaintext `GET /health`.
    async fn get_health(&self, base_url: &str) -> Result<HealthResponse, CoreError>;
}

/// Production transport over `reqwest`.
pub struct HttpWorkerTransport {
    client: reqwest::Client,
}

impl HttpWorkerTransport {
    /// Client with a bounded per-request timeout.
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn post(
        &self,
        base_url: &str,
        endpoint: &str,
        body: Envelope,
    ) -> Result<Envelope, CoreError> {
        let url = format!("{base_url}{endpoint}");
        debug!(%url, "posting to worker");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::StartFailed(format!("worker unreachable: {e}")))?;
        response
            .json::<Envelope>()
            .await
            .map_err(|e| CoreError::StartFailed(format!("invalid worker reply: {e}")))
    }

    async fn get_health(&self, base_url: &str) -> Result<HealthResponse, CoreError> {
        let url = format!("{base_url}{EP_HEALTH}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::SnapshotRestoreFailed(format!("health probe failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::SnapshotRestoreFailed(format!(
                "health probe returned {}",
                response.status()
            )));
        }
        response
            .json::<HealthResponse>()
            .await
            .map_err(|e| CoreError::SnapshotRestoreFailed(format!("invalid health reply: {e}")))
    }
}

/// Typed encrypted client bound to one worker.
#[derive(Clone)]
pub struct WorkerClient {
    transport: Arc<dyn WorkerTransport>,
    cipher: AgentCipher,
    base_url: String,
}

impl WorkerClient {
    /// Bind to a worker by base URL and agent secret.
    pub fn new(transport: Arc<dyn WorkerTransport>, base_url: String, agent_secret: &str) -> Self {
        Self {
            transport,
            cipher: AgentCipher::from_secret(agent_secret),
            base_url,
        }
    }

    /// The worker's base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Seal a request, post it, open the reply.
    pub async fn post<Req: Serialize, Res: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Res, CoreError> {
        let sealed = self
            .cipher
            .seal(request)
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let reply = self
            .transport
            .post(&self.base_url, endpoint, sealed)
            .await?;
        self.cipher
            .open(&reply)
            .map_err(|e| CoreError::StartFailed(format!("cannot open worker reply: {e}")))
    }

    /// True when the worker's health probe answers.
    pub async fn is_healthy(&self) -> bool {
        self.transport.get_health(&self.base_url).await.is_ok()
    }
}
