//! Managed OPA policies
//!
//! A policy instance couples a compiled Rego document with the machinery
//! that keeps it current: inline bodies are compiled once at construction,
//! registry-sourced bodies are re-fetched in the background and hot-swapped
//! without interrupting in-flight evaluations.

mod cell;
mod compiler;

pub use cell::PolicyCell;
pub use compiler::{normalize, CompilePolicy, PolicyCompiler, PreparedQuery};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::error;

use crate::error::{AuthzError, Result};
use crate::fingerprint::fingerprint;
use crate::registry::ExternalSource;
use compiler::ALLOW_QUERY;

/// Rule-head → value map produced by one execution of the prepared query.
pub type Bindings = serde_json::Map<String, JsonValue>;

/// Supplies the authorization context assembled by the surrounding pipeline.
pub trait AuthPipeline: Send + Sync {
    /// The authorization context as a JSON document.
    fn authorization_json(&self) -> String;
}

/// A managed authorization policy
///
/// Construct with [`OpaPolicy::new`], evaluate per request with
/// [`OpaPolicy::evaluate`] (or [`OpaPolicy::check`] against a pipeline), and
/// release the refresh worker with [`OpaPolicy::clean`] when the instance is
/// retired.
pub struct OpaPolicy {
    name: String,
    uid: String,
    all_values: bool,
    cell: Arc<PolicyCell>,
    source: Option<Arc<ExternalSource>>,
}

impl OpaPolicy {
    /// Create a policy from an inline body or an external registry.
    ///
    /// The body is pulled from `source` only when `rego` is empty and the
    /// source carries an endpoint; a fetch failure aborts construction, as
    /// does a compile failure; callers never obtain a half-initialized
    /// policy. When the body came from a registry, a background refresher is
    /// armed with the source's TTL (a non-positive TTL leaves the policy
    /// serving without refresh).
    ///
    /// `nonce` feeds the fingerprint, forcing divergence between logically
    /// distinct configurations that happen to share text. With `all_values`
    /// set, bindings for every top-level rule head are surfaced to the
    /// caller instead of only the decision rule.
    pub async fn new(
        name: impl Into<String>,
        rego: impl Into<String>,
        source: Option<ExternalSource>,
        all_values: bool,
        nonce: i64,
    ) -> Result<Self> {
        let name = name.into();
        let mut rego = rego.into();
        let source = source.map(Arc::new);

        let remote = source
            .as_ref()
            .filter(|s| rego.is_empty() && !s.endpoint().is_empty())
            .cloned();

        if let Some(src) = &remote {
            rego = match src.fetch().await {
                Ok(body) => body,
                Err(err) => {
                    error!(
                        error = %err,
                        policy = %name,
                        endpoint = %src.endpoint(),
                        "failed to download policy from external registry"
                    );
                    return Err(err);
                }
            };
        }

        let body = normalize(&rego);
        let uid = fingerprint(&name, &body, nonce);
        let compiler = PolicyCompiler::new(&name, &uid, all_values);
        let cell = Arc::new(PolicyCell::new(compiler, &body)?);

        if let Some(src) = &remote {
            src.clone().arm_refresher(cell.clone(), &name).await;
        }

        Ok(Self {
            name,
            uid,
            all_values,
            cell,
            source,
        })
    }

    /// Evaluate the prepared query against an authorization context.
    ///
    /// The context is parsed as JSON and bound as the policy's input root.
    /// When `deadline` is set, an evaluation that overruns it is cut short
    /// with a transport-class error, never a denial. The call holds no lock
    /// across query execution; any number of evaluations proceed in parallel
    /// against the same prepared query, and a hot swap completing mid-flight
    /// affects only later calls.
    ///
    /// Returns the full multi-binding map on success, [`AuthzError::Unauthorized`]
    /// when the decision rule is false or not boolean, and
    /// [`AuthzError::InvalidResponse`] when the query produced no result set.
    pub async fn evaluate(
        &self,
        authorization_json: &str,
        deadline: Option<Duration>,
    ) -> Result<Bindings> {
        let input = regorus::Value::from_json_str(authorization_json)
            .map_err(|e| AuthzError::json(e.to_string()))?;

        let prepared = self.cell.current();
        let eval = tokio::task::spawn_blocking(move || prepared.eval(input));

        let joined = match deadline {
            Some(limit) => tokio::time::timeout(limit, eval)
                .await
                .map_err(|_| AuthzError::transport("policy evaluation deadline exceeded"))?,
            None => eval.await,
        };
        let results = joined.map_err(|e| AuthzError::evaluation(e.to_string()))??;

        let Some(first) = results.result.first() else {
            return Err(AuthzError::InvalidResponse);
        };
        let bindings = match serde_json::to_value(&first.bindings) {
            Ok(JsonValue::Object(map)) => map,
            _ => return Err(AuthzError::InvalidResponse),
        };

        match bindings.get(ALLOW_QUERY) {
            Some(JsonValue::Bool(true)) => Ok(bindings),
            _ => Err(AuthzError::Unauthorized),
        }
    }

    /// Evaluate against the context supplied by an authorization pipeline.
    pub async fn check(
        &self,
        pipeline: &dyn AuthPipeline,
        deadline: Option<Duration>,
    ) -> Result<Bindings> {
        self.evaluate(&pipeline.authorization_json(), deadline).await
    }

    /// Stop the background refresher, if one was armed.
    ///
    /// Idempotent; a policy without a remote source is unaffected. The
    /// instance keeps serving its last installed body either way.
    pub async fn clean(&self) {
        if let Some(source) = &self.source {
            source.cleanup_refresher().await;
        }
    }

    /// Policy name, as used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content fingerprint qualifying this policy's namespace.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Current normalized policy body.
    pub fn body(&self) -> String {
        self.cell.body()
    }

    /// Whether bindings for every top-level rule head are surfaced.
    pub fn all_values(&self) -> bool {
        self.all_values
    }
}

impl std::fmt::Debug for OpaPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaPolicy")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("all_values", &self.all_values)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
