//! Refresh-token exchange and single-flight coordination
//!
//! The exchange is a dedicated call that bypasses the pipeline: it is never
//! intercepted and a 401 from it never triggers another refresh. The refresh
//! response carries no expiry, so the new access token's `exp` claim is
//! decoded instead.
//!
//! `RefreshGate` makes concurrent 401s share one refresh call: the first
//! caller starts it and later callers await the same shared future.

use std::sync::Mutex;

use auth_storage::{Credentials, decode_expiry};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ApiError, ErrorKind};

/// Body sent to the refresh endpoint. Absent tokens are sent as `null`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest<'a> {
    pub access_token: Option<&'a str>,
    pub refresh_token: Option<&'a str>,
}

/// Response from the refresh endpoint. Extra fields are ignored.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

impl RefreshTokenResponse {
    /// Turn the response into a full credential record by decoding the
    /// access token's expiry.
    pub fn into_credentials(self) -> Result<Credentials, ApiError> {
        let expires_at = decode_expiry(&self.access_token).map_err(|e| {
            ApiError::new(
                ErrorKind::Decode,
                None,
                format!("refreshed access token: {e}"),
            )
        })?;
        Ok(Credentials::new(
            self.access_token,
            self.refresh_token,
            expires_at,
        ))
    }
}

/// Exchange the current tokens for a new credential record.
///
/// Any non-2xx status, transport failure, malformed body or undecodable
/// access token is an error.
pub async fn exchange_refresh_token(
    client: &reqwest::Client,
    refresh_url: &str,
    current: &Credentials,
) -> Result<Credentials, ApiError> {
    let body = RefreshTokenRequest {
        access_token: current.access_token.as_deref(),
        refresh_token: current.refresh_token.as_deref(),
    };

    let response = client
        .post(refresh_url)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .json(&body)
        .send()
        .await
        .map_err(|e| ApiError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(ApiError::from_status(status, &body));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::from_transport(&e))?;
    let parsed: RefreshTokenResponse =
        serde_json::from_slice(&bytes).map_err(|e| ApiError::decode(Some(status), e))?;

    parsed.into_credentials()
}

type SharedRefresh = Shared<BoxFuture<'static, Result<(), ApiError>>>;

/// At most one refresh in flight; everyone else waits on it.
#[derive(Default)]
pub(crate) struct RefreshGate {
    in_flight: Mutex<Option<SharedRefresh>>,
}

impl RefreshGate {
    /// Join the in-flight refresh, or start one with `start`.
    ///
    /// All callers that joined the same refresh get the same result. The slot
    /// is emptied once the refresh finishes so a later 401 can start a new one.
    pub(crate) async fn run<F>(&self, start: F) -> Result<(), ApiError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), ApiError>>,
    {
        let refresh = {
            let mut slot = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.as_ref() {
                Some(existing) => {
                    debug!("joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let started = start().shared();
                    *slot = Some(started.clone());
                    started
                }
            }
        };

        let result = refresh.clone().await;

        let mut slot = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&refresh)) {
            *slot = None;
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight
            .lock()
            .map(|slot| slot.is_none())
            .unwrap_or(false)
    }
}
