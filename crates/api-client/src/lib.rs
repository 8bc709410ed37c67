//! Authenticated API client with transparent token refresh
//!
//! Wraps `reqwest` so that a 401 response is recovered by exchanging the
//! stored refresh token and resubmitting the request once. Credentials live
//! in an `auth_storage::CredentialStore` shared with the rest of the app.
//!
//! Request flow:
//! 1. `ApiClient::send()` runs the request interceptor and dispatches
//! 2. Non-2xx responses and transport failures become `ApiError`
//! 3. A 401 on a fresh request triggers `refresh::exchange_refresh_token()`
//!    (deduplicated across concurrent callers) and one resubmission
//! 4. A 401 on the resubmission, or a failed refresh, clears credentials

pub mod auth;
pub mod client;
pub mod error;
pub mod interceptor;
pub mod refresh;
pub mod request;

pub use auth::{LoginResponse, User, UsersPage};
pub use client::{ApiClient, ClientConfig, DEFAULT_REFRESH_PATH, DEFAULT_TIMEOUT};
pub use error::{ApiError, ErrorKind};
pub use interceptor::{
    AuthHeaderMode, BearerToken, HeaderInjection, Passthrough, RequestInterceptor,
};
pub use refresh::{RefreshTokenRequest, RefreshTokenResponse, exchange_refresh_token};
pub use request::{ApiRequest, ApiResponse};
