//! Outgoing request interceptors
//!
//! The pipeline hands every outgoing request's headers to a
//! `RequestInterceptor` before dispatch, including the resubmission after a
//! refresh. `Passthrough` only adds configured static headers; `BearerToken`
//! also attaches the stored access token.

use std::str::FromStr;

use auth_storage::CredentialStore;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::warn;

use crate::error::ApiError;

/// Static header added to every outgoing request (name + value pair from config).
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Which interceptor the client installs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthHeaderMode {
    #[default]
    Passthrough,
    Bearer,
}

/// Hook run on the headers of each outgoing request.
pub trait RequestInterceptor: Send + Sync {
    /// Identifier for logging (e.g. "passthrough", "bearer")
    fn id(&self) -> &str;

    fn prepare_request(
        &self,
        headers: &mut HeaderMap,
        credentials: &CredentialStore,
    ) -> Result<(), ApiError>;
}

/// Leaves authentication alone; only injects the configured static headers.
#[derive(Debug, Clone, Default)]
pub struct Passthrough {
    headers: Vec<HeaderInjection>,
}

impl Passthrough {
    pub fn new(headers: Vec<HeaderInjection>) -> Self {
        Self { headers }
    }
}

impl RequestInterceptor for Passthrough {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn prepare_request(
        &self,
        headers: &mut HeaderMap,
        _credentials: &CredentialStore,
    ) -> Result<(), ApiError> {
        inject_static_headers(&self.headers, headers);
        Ok(())
    }
}

/// Injects static headers, then `Authorization: Bearer <access token>` when
/// a token is stored. Without a token the request goes out unauthenticated.
#[derive(Debug, Clone, Default)]
pub struct BearerToken {
    headers: Vec<HeaderInjection>,
}

impl BearerToken {
    pub fn new(headers: Vec<HeaderInjection>) -> Self {
        Self { headers }
    }
}

impl RequestInterceptor for BearerToken {
    fn id(&self) -> &str {
        "bearer"
    }

    fn prepare_request(
        &self,
        headers: &mut HeaderMap,
        credentials: &CredentialStore,
    ) -> Result<(), ApiError> {
        inject_static_headers(&self.headers, headers);

        if let Some(token) = credentials.access_token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ApiError::request(format!("access token is not a valid header: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(())
    }
}

/// Add or replace each configured header. Authorization is never touched here.
fn inject_static_headers(injections: &[HeaderInjection], headers: &mut HeaderMap) {
    for injection in injections {
        let name = match HeaderName::from_str(&injection.name) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header name");
                continue;
            }
        };
        if name == AUTHORIZATION {
            warn!(header = %injection.name, "refusing to inject a static authorization header");
            continue;
        }
        let value = match HeaderValue::from_str(&injection.value) {
            Ok(v) => v,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header value");
                continue;
            }
        };
        headers.insert(name, value);
    }
}
