//! OPA-style policy gate for external authorization
//!
//! Evaluates declarative Rego policies against the authorization context of
//! inbound requests. Policy bodies are compiled once into a prepared query
//! and reused on the hot path; bodies sourced from an external HTTP registry
//! are refreshed in the background and hot-swapped without interrupting
//! in-flight evaluations.
//!
//! # Flow
//!
//! ```text
//! construction:  body (inline | registry fetch) → normalize → fingerprint
//!                → compile → policy cell
//! request:       context JSON → prepared query from cell → bindings | denial
//! refresh tick:  fetch → diff against installed body → recompile + swap,
//!                or no-op, or keep serving the last good artifact
//! ```
//!
//! # Example
//!
//! ```no_run
//! use opa_gate::OpaPolicy;
//!
//! # async fn demo() -> opa_gate::Result<()> {
//! let policy = OpaPolicy::new(
//!     "api-access",
//!     r#"allow { input.role == "admin" }"#,
//!     None,
//!     false,
//!     0,
//! )
//! .await?;
//!
//! let bindings = policy.evaluate(r#"{"role":"admin"}"#, None).await?;
//! assert_eq!(bindings["allow"], serde_json::json!(true));
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod error;
mod fingerprint;

pub mod credentials;
pub mod policy;
pub mod registry;

pub use credentials::{CredentialApplier, Credentials};
pub use error::{AuthzError, Result, UNAUTHORIZED_MESSAGE};
pub use fingerprint::fingerprint;
pub use policy::{
    normalize, AuthPipeline, Bindings, CompilePolicy, OpaPolicy, PolicyCell, PolicyCompiler,
    PreparedQuery,
};
pub use registry::{ExternalSource, RefreshWorker, StartError};
