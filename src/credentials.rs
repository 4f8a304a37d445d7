//! Credential injection for outbound registry requests
//!
//! The registry fetcher does not define the credential format; it only
//! applies whatever scheme the surrounding system configured. The shipped
//! schemes cover the places a shared secret can ride on a GET request.

use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;

/// Applies a shared-secret credential to an outbound HTTP request.
pub trait CredentialApplier: Send + Sync {
    /// Mutate `request` to carry `secret` in the configured scheme.
    ///
    /// An empty secret leaves the request untouched.
    fn apply(&self, request: RequestBuilder, secret: &str) -> RequestBuilder;
}

/// Shared-secret placement schemes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `Authorization: <prefix> <secret>` (e.g. `Bearer`)
    AuthorizationHeader {
        /// Scheme prefix inside the header value
        prefix: String,
    },
    /// Secret carried verbatim in a custom header
    CustomHeader {
        /// Header name
        name: String,
    },
    /// Secret carried as a URL query parameter
    QueryParam {
        /// Parameter name
        name: String,
    },
}

impl Default for Credentials {
    fn default() -> Self {
        Self::AuthorizationHeader {
            prefix: "Bearer".to_string(),
        }
    }
}

impl CredentialApplier for Credentials {
    fn apply(&self, request: RequestBuilder, secret: &str) -> RequestBuilder {
        if secret.is_empty() {
            return request;
        }
        match self {
            Self::AuthorizationHeader { prefix } => {
                let value = format!("{prefix} {secret}");
                request.header(AUTHORIZATION, value.trim().to_string())
            }
            Self::CustomHeader { name } => request.header(name.as_str(), secret),
            Self::QueryParam { name } => request.query(&[(name.as_str(), secret)]),
        }
    }
}
