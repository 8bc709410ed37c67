//! Normalized API errors
//!
//! Every failure the pipeline can hit (no response, non-2xx response, body
//! that does not parse) becomes one `ApiError`. The status code is `None`
//! when no response was received, so only real 401 responses can trigger a
//! token refresh.

use reqwest::StatusCode;
use serde::Serialize;

/// Maximum length for response bodies kept as error context
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, reset
    Network,
    /// Transport timeout before a response arrived
    Timeout,
    /// Response received with a non-2xx status
    Http,
    /// Response body (or token inside it) could not be decoded
    Decode,
    /// Request could not be built
    Request,
    /// Refreshed tokens were discarded because credentials changed meanwhile
    Superseded,
}

/// Uniform error shape: `{ statusCode, message, kind, body }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct ApiError {
    pub status_code: Option<u16>,
    pub message: String,
    pub kind: ErrorKind,
    /// Raw response body, truncated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
            kind,
            body: None,
        }
    }

    /// Normalize a transport-level failure.
    pub fn from_transport(error: &reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.is_decode() {
            ErrorKind::Decode
        } else if error.is_builder() {
            ErrorKind::Request
        } else {
            ErrorKind::Network
        };
        Self::new(kind, error.status().map(|s| s.as_u16()), error.to_string())
    }

    /// Normalize a non-2xx response.
    ///
    /// The message comes from the JSON body (`message`, `error.message`,
    /// `error`, `detail`) when present, otherwise a generic status message.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = extract_message(body)
            .unwrap_or_else(|| format!("Request failed with status code {}", status.as_u16()));
        Self {
            status_code: Some(status.as_u16()),
            message,
            kind: ErrorKind::Http,
            body: (!body.is_empty()).then(|| truncate_body(body)),
        }
    }

    /// A response that arrived but could not be decoded.
    pub fn decode(status: Option<StatusCode>, detail: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::Decode,
            status.map(|s| s.as_u16()),
            format!("invalid response body: {detail}"),
        )
    }

    pub fn request(detail: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Request, None, format!("invalid request: {detail}"))
    }

    /// Whether this error should trigger the refresh-and-retry cycle.
    pub fn is_unauthorized(&self) -> bool {
        self.status_code == Some(StatusCode::UNAUTHORIZED.as_u16())
    }
}

/// Pull a human-readable message out of a JSON error body.
fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let candidates = [
        value.get("message"),
        value.get("error").and_then(|e| e.get("message")),
        value.get("error"),
        value.get("detail"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned)
}

/// Truncate a response body to avoid carrying excessive data around
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... (truncated, {} total bytes)",
        &body[..end],
        body.len()
    )
}
