//! Auth and user endpoints
//!
//! Login goes through the normal pipeline and, on success, replaces all three
//! credential fields at once. Logout clears them.

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::info;

use auth_storage::Credentials;

use crate::client::ApiClient;
use crate::error::ApiError;
use crate::request::ApiRequest;

pub const LOGIN_PATH: &str = "/authorize";
pub const CURRENT_USER_PATH: &str = "/me";
pub const USERS_PATH: &str = "/users";

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Response from `POST /authorize`.
#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    /// Access token expiry, unix seconds
    pub expires: i64,
    pub refresh_token: String,
}

impl std::fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires", &self.expires)
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub first_name: String,
    pub last_name: String,
    pub username: String,
}

/// One page of `GET /users`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersPage {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<u32>,
}

impl ApiClient {
    /// Log in and store the returned credentials.
    pub async fn login(
        &self,
        username: &str,
        password: &Secret<String>,
    ) -> Result<LoginResponse, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH).json(&LoginRequest {
            username,
            password: password.expose(),
        })?;
        let login: LoginResponse = self.send(request).await?.json()?;

        self.credentials().replace(Credentials::new(
            login.access_token.clone(),
            login.refresh_token.clone(),
            login.expires,
        ));
        info!(username, expires_at = login.expires, "logged in");
        Ok(login)
    }

    /// Drop all stored credentials.
    pub fn logout(&self) {
        self.credentials().clear();
        info!("logged out");
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.send(ApiRequest::get(CURRENT_USER_PATH)).await?.json()
    }

    pub async fn list_users(&self, page: u32, count: u32) -> Result<UsersPage, ApiError> {
        let request = ApiRequest::get(USERS_PATH)
            .query("page", page)
            .query("count", count);
        self.send(request).await?.json()
    }
}
