//! External policy registry access
//!
//! Fetches policy bodies over HTTP and keeps them fresh via a background
//! worker. The fetcher understands both plain-text registries and registries
//! that wrap the policy in a JSON envelope, so callers need no per-registry
//! configuration.

mod refresh;

pub use refresh::{RefreshWorker, StartError};

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::credentials::{CredentialApplier, Credentials};
use crate::error::{AuthzError, Result};
use crate::policy::PolicyCell;

/// Timeout for a single registry fetch
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Content-type prefix selecting JSON envelope decoding. Matched as a prefix
/// so parameterized types (`application/json; charset=utf-8`) qualify; a
/// missing header means plain text.
const JSON_CONTENT_TYPE: &str = "application/json";

/// Cap on the response-body excerpt carried inside status errors
const STATUS_BODY_EXCERPT: usize = 256;

/// JSON envelope returned by wrapping registries: `{"result":{"raw":"..."}}`
#[derive(Debug, Deserialize)]
struct RegistryEnvelope {
    result: RegistryPayload,
}

#[derive(Debug, Deserialize)]
struct RegistryPayload {
    raw: String,
}

/// A remote registry endpoint serving a policy body
///
/// Stateless with respect to fetching (concurrent fetches are fine) and
/// the exclusive owner of the refresh worker once one is armed.
pub struct ExternalSource {
    endpoint: String,
    shared_secret: String,
    credentials: Arc<dyn CredentialApplier>,
    ttl: i64,
    client: reqwest::Client,
    worker: tokio::sync::Mutex<Option<RefreshWorker>>,
}

impl ExternalSource {
    /// Create a source with the default credential scheme (bearer header).
    ///
    /// `ttl` is the refresh interval in seconds; zero or negative disables
    /// refresh.
    pub fn new(endpoint: impl Into<String>, shared_secret: impl Into<String>, ttl: i64) -> Self {
        Self::with_credentials(endpoint, shared_secret, ttl, Arc::new(Credentials::default()))
    }

    /// Create a source with a caller-supplied credential scheme.
    pub fn with_credentials(
        endpoint: impl Into<String>,
        shared_secret: impl Into<String>,
        ttl: i64,
        credentials: Arc<dyn CredentialApplier>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("failed to create HTTP client");

        Self {
            endpoint: endpoint.into(),
            shared_secret: shared_secret.into(),
            credentials,
            ttl,
            client,
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the HTTP client (custom TLS, proxies, shorter timeouts).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// The registry endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The refresh interval in seconds.
    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    /// One-shot GET of the policy body.
    ///
    /// The configured credentials are applied to the request. A `text/*`
    /// response is returned verbatim; an `application/json` response is
    /// decoded as `{"result":{"raw":"<policy>"}}` and unwrapped. Non-success
    /// statuses surface the full status line plus a body excerpt; retrying is
    /// the refresh worker's business, not the fetcher's.
    pub async fn fetch(&self) -> Result<String> {
        let request = self
            .credentials
            .apply(self.client.get(&self.endpoint), &self.shared_secret);

        let response = request
            .send()
            .await
            .map_err(|e| AuthzError::transport(e.to_string()))?;

        let status = response.status();
        let json_body = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| {
                value.trim_start().starts_with(JSON_CONTENT_TYPE)
            });

        let body = response
            .text()
            .await
            .map_err(|e| AuthzError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(AuthzError::http_status(status.as_u16(), excerpt(&body)));
        }

        if json_body {
            let envelope: RegistryEnvelope =
                serde_json::from_str(&body).map_err(|e| AuthzError::decode(e.to_string()))?;
            return Ok(envelope.result.raw);
        }

        Ok(body)
    }

    /// Arm the background refresher for `cell`.
    ///
    /// Each tick fetches, installs without force, and classifies the outcome
    /// (updated / unchanged / error). A start failure (a non-positive TTL)
    /// leaves the policy serving without auto-refresh and is logged at debug
    /// level.
    pub(crate) async fn arm_refresher(self: Arc<Self>, cell: Arc<PolicyCell>, policy_name: &str) {
        let name = policy_name.to_string();
        let ttl = self.ttl;

        // The worker lives inside this source; a strong reference here
        // would form a cycle.
        let tick_source = Arc::downgrade(&self);
        let tick_name = name.clone();
        let tick = move || {
            let source = tick_source.clone();
            let cell = cell.clone();
            let name = tick_name.clone();
            async move {
                if let Some(source) = source.upgrade() {
                    source.refresh_once(&cell, &name).await;
                }
            }
        };

        match RefreshWorker::start(ttl, tick) {
            Ok(worker) => {
                *self.worker.lock().await = Some(worker);
            }
            Err(err) => {
                debug!(
                    policy = %name,
                    endpoint = %self.endpoint,
                    reason = %err,
                    "auto-refresh of external policy disabled"
                );
            }
        }
    }

    /// One refresh tick: fetch, diff, maybe install.
    async fn refresh_once(&self, cell: &PolicyCell, policy_name: &str) {
        match self.fetch().await {
            Ok(body) => match cell.install(&body, false) {
                Ok(true) => info!(
                    policy = %policy_name,
                    endpoint = %self.endpoint,
                    "policy updated from external registry"
                ),
                Ok(false) => debug!(
                    policy = %policy_name,
                    endpoint = %self.endpoint,
                    "external policy unchanged"
                ),
                // Compile failures are logged by the cell; the previously
                // installed artifact keeps serving.
                Err(_) => {}
            },
            Err(err) => error!(
                error = %err,
                policy = %policy_name,
                endpoint = %self.endpoint,
                "failed to refresh policy from external registry"
            ),
        }
    }

    /// Stop and release the refresh worker, if one was armed.
    ///
    /// Idempotent; stopping a never-armed source is a no-op.
    pub(crate) async fn cleanup_refresher(&self) {
        if let Some(mut worker) = self.worker.lock().await.take() {
            worker.stop().await;
        }
    }
}

impl std::fmt::Debug for ExternalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSource")
            .field("endpoint", &self.endpoint)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(STATUS_BODY_EXCERPT).collect()
}
