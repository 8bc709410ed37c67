//! Authenticated request pipeline
//!
//! `ApiClient::send` dispatches a request and, when the response is a 401,
//! runs one refresh-and-retry cycle:
//!
//! 1. 2xx → response returned as is
//! 2. Non-401 failure → normalized error returned, no refresh
//! 3. 401, request not yet retried → refresh tokens, mark request, resubmit
//! 4. 401, request already retried → clear credentials, return the error
//! 5. Refresh fails → credentials cleared, the original 401 error returned
//!
//! Concurrent 401s share a single refresh through `RefreshGate`.

use std::sync::Arc;
use std::time::Duration;

use auth_storage::CredentialStore;
use futures::FutureExt;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use tracing::{debug, info, instrument, warn};

use crate::error::{ApiError, ErrorKind};
use crate::interceptor::{
    AuthHeaderMode, BearerToken, HeaderInjection, Passthrough, RequestInterceptor,
};
use crate::refresh::{RefreshGate, exchange_refresh_token};
use crate::request::{ApiRequest, ApiResponse};

/// Refresh endpoint path under the base URL
pub const DEFAULT_REFRESH_PATH: &str = "/refresh-token";

/// Transport timeout for every call, refresh included
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub refresh_path: String,
    pub timeout: Duration,
    pub auth_header: AuthHeaderMode,
    pub headers: Vec<HeaderInjection>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            timeout: DEFAULT_TIMEOUT,
            auth_header: AuthHeaderMode::default(),
            headers: Vec::new(),
        }
    }

    fn interceptor(&self) -> Arc<dyn RequestInterceptor> {
        match self.auth_header {
            AuthHeaderMode::Passthrough => Arc::new(Passthrough::new(self.headers.clone())),
            AuthHeaderMode::Bearer => Arc::new(BearerToken::new(self.headers.clone())),
        }
    }
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    refresh_url: String,
    store: Arc<CredentialStore>,
    interceptor: Arc<dyn RequestInterceptor>,
    refresh_gate: RefreshGate,
}

/// API client with transparent token refresh.
/// Clone is cheap; clones share the connection pool, store and refresh gate.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    /// Build a client with its own HTTP connection pool and the interceptor
    /// selected by `config.auth_header`.
    pub fn new(config: ClientConfig, store: Arc<CredentialStore>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::from_transport(&e))?;
        let interceptor = config.interceptor();
        Ok(Self::with_parts(http, &config, store, interceptor))
    }

    /// Build a client from an existing `reqwest::Client` and a custom interceptor.
    pub fn with_parts(
        http: reqwest::Client,
        config: &ClientConfig,
        store: Arc<CredentialStore>,
        interceptor: Arc<dyn RequestInterceptor>,
    ) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let refresh_url = format!("{base_url}{}", config.refresh_path);
        debug!(%base_url, %refresh_url, interceptor = interceptor.id(), "api client created");
        Self {
            inner: Arc::new(Inner {
                http,
                base_url,
                refresh_url,
                store,
                interceptor,
                refresh_gate: RefreshGate::default(),
            }),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Send a request through the pipeline.
    #[instrument(skip_all, fields(
        request_id = %uuid::Uuid::new_v4().as_simple(),
        method = %request.method(),
        path = %request.path(),
    ))]
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        loop {
            let generation = self.inner.store.generation();

            let error = match self.execute(&request).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if !error.is_unauthorized() {
                return Err(error);
            }

            if request.is_retried() {
                warn!("request rejected again after token refresh, clearing credentials");
                self.inner.store.clear();
                return Err(error);
            }

            request.mark_retried();
            if let Err(refresh_error) = self.refresh(generation).await {
                warn!(error = %refresh_error, "token refresh failed");
                return Err(error);
            }
            debug!("resubmitting request after token refresh");
        }
    }

    /// Refresh credentials after a 401 seen at `failed_generation`.
    ///
    /// Skips the network call when another request already refreshed since
    /// this one was sent.
    async fn refresh(&self, failed_generation: u64) -> Result<(), ApiError> {
        let store = &self.inner.store;
        if store.generation() != failed_generation && store.access_token().is_some() {
            debug!("credentials changed since request was sent, retrying without refresh");
            return Ok(());
        }

        let inner = self.inner.clone();
        self.inner
            .refresh_gate
            .run(move || refresh_credentials(inner).boxed())
            .await
    }

    /// One dispatch of `request`: intercept, send, read, classify.
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut url = reqwest::Url::parse(&format!("{}{}", self.inner.base_url, request.path))
            .map_err(ApiError::request)?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }

        let mut headers = request.headers.clone();
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        self.inner
            .interceptor
            .prepare_request(&mut headers, &self.inner.store)?;

        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            metrics::counter!("api_requests_total", "status" => "transport_error").increment(1);
            ApiError::from_transport(&e)
        })?;

        let status = response.status();
        metrics::counter!("api_requests_total", "status" => status.as_u16().to_string())
            .increment(1);
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;

        if status.is_success() {
            return Ok(ApiResponse::new(status, headers, body));
        }

        debug!(status = status.as_u16(), retried = request.is_retried(), "request failed");
        Err(ApiError::from_status(status, &String::from_utf8_lossy(&body)))
    }
}

/// Run the refresh exchange and commit or clear credentials.
///
/// Commits only if nothing else touched the store while the call was in
/// flight; a logout in between wins over the refreshed tokens.
async fn refresh_credentials(inner: Arc<Inner>) -> Result<(), ApiError> {
    let snapshot = inner.store.snapshot();
    debug!(generation = snapshot.generation, "refreshing access token");

    match exchange_refresh_token(&inner.http, &inner.refresh_url, &snapshot.credentials).await {
        Ok(credentials) => {
            let expires_at = credentials.expires_at;
            if inner
                .store
                .replace_if_generation(snapshot.generation, credentials)
            {
                metrics::counter!("api_token_refresh_total", "outcome" => "success").increment(1);
                info!(?expires_at, "access token refreshed");
                Ok(())
            } else {
                metrics::counter!("api_token_refresh_total", "outcome" => "superseded")
                    .increment(1);
                warn!("credentials changed during refresh, discarding refreshed tokens");
                Err(ApiError::new(
                    ErrorKind::Superseded,
                    None,
                    "credentials changed during token refresh",
                ))
            }
        }
        Err(e) => {
            metrics::counter!("api_token_refresh_total", "outcome" => "failure").increment(1);
            warn!(error = %e, status = ?e.status_code, "refresh exchange failed, clearing credentials");
            inner.store.clear();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_storage::{Credentials, MemoryStore};
    use axum::Json;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    const NEW_EXP: i64 = 1_700_000_000;

    fn jwt_with_exp(exp: i64) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"mike","exp":{exp}}}"#))
        )
    }

    /// Mock API: `/protected` accepts only the current valid token,
    /// `/refresh-token` rotates it.
    struct MockApi {
        valid_token: Mutex<String>,
        refresh_calls: AtomicUsize,
        protected_calls: AtomicUsize,
        refresh_fails: AtomicBool,
        refresh_delay: Duration,
        refresh_bodies: Mutex<Vec<Value>>,
    }

    impl MockApi {
        fn new(refresh_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                valid_token: Mutex::new("never-valid".into()),
                refresh_calls: AtomicUsize::new(0),
                protected_calls: AtomicUsize::new(0),
                refresh_fails: AtomicBool::new(false),
                refresh_delay,
                refresh_bodies: Mutex::new(Vec::new()),
            })
        }
    }

    async fn protected(
        State(mock): State<Arc<MockApi>>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        mock.protected_calls.fetch_add(1, Ordering::SeqCst);
        let expected = format!("Bearer {}", mock.valid_token.lock().unwrap());
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented == expected {
            (StatusCode::OK, Json(json!({"ok": true})))
        } else {
            (StatusCode::UNAUTHORIZED, Json(json!({"message": "Token expired"})))
        }
    }

    /// Like `protected`, but checks the presented token only after a delay.
    async fn slow_protected(
        State(mock): State<Arc<MockApi>>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        tokio::time::sleep(Duration::from_millis(150)).await;
        protected(State(mock), headers).await
    }

    async fn refresh(
        State(mock): State<Arc<MockApi>>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        mock.refresh_calls.fetch_add(1, Ordering::SeqCst);
        mock.refresh_bodies.lock().unwrap().push(body);
        tokio::time::sleep(mock.refresh_delay).await;
        if mock.refresh_fails.load(Ordering::SeqCst) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message": "Refresh token revoked"})),
            );
        }
        let token = jwt_with_exp(NEW_EXP);
        *mock.valid_token.lock().unwrap() = token.clone();
        (
            StatusCode::OK,
            Json(json!({"accessToken": token, "refreshToken": "R2"})),
        )
    }

    async fn start_mock_api(mock: Arc<MockApi>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route("/protected", get(protected))
            .route("/slow-protected", get(slow_protected))
            .route(
                "/hang",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Json(json!({"late": true}))
                }),
            )
            .route("/refresh-token", post(refresh))
            .route(
                "/always-401",
                get(|| async { (StatusCode::UNAUTHORIZED, Json(json!({"message": "nope"}))) }),
            )
            .route(
                "/missing",
                get(|| async {
                    (
                        StatusCode::NOT_FOUND,
                        Json(json!({"error": {"message": "not here"}})),
                    )
                }),
            )
            .route("/ok", get(|| async { Json(json!({"hello": "world"})) }))
            .with_state(mock);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn logged_in_store() -> Arc<CredentialStore> {
        let store = CredentialStore::with_logging(Arc::new(MemoryStore::new()));
        store.replace(Credentials::new("A1".into(), "R1".into(), 1_600_000_000));
        Arc::new(store)
    }

    fn bearer_client(base_url: &str, store: Arc<CredentialStore>) -> ApiClient {
        let mut config = ClientConfig::new(base_url);
        config.auth_header = AuthHeaderMode::Bearer;
        config.timeout = Duration::from_secs(5);
        ApiClient::new(config, store).unwrap()
    }

    #[tokio::test]
    async fn success_passes_through_without_refresh() {
        let mock = MockApi::new(Duration::ZERO);
        let url = start_mock_api(mock.clone()).await;
        let client = bearer_client(&url, logged_in_store());

        let response = client.send(ApiRequest::get("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.json::<Value>().unwrap()["hello"], "world");
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_401_failure_is_normalized_without_refresh() {
        let mock = MockApi::new(Duration::ZERO);
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let client = bearer_client(&url, store.clone());

        let err = client.send(ApiRequest::get("/missing")).await.unwrap_err();
        assert_eq!(err.status_code, Some(404));
        assert_eq!(err.message, "not here");
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.access_token().as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_request_retried_once() {
        let mock = MockApi::new(Duration::ZERO);
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let client = bearer_client(&url, store.clone());

        let response = client.send(ApiRequest::get("/protected")).await.unwrap();
        assert_eq!(response.json::<Value>().unwrap()["ok"], true);

        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.protected_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.credentials(),
            Credentials::new(jwt_with_exp(NEW_EXP), "R2".into(), NEW_EXP)
        );
        assert_eq!(
            mock.refresh_bodies.lock().unwrap()[0],
            json!({"accessToken": "A1", "refreshToken": "R1"})
        );
    }

    #[tokio::test]
    async fn second_401_after_refresh_clears_credentials() {
        let mock = MockApi::new(Duration::ZERO);
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let client = bearer_client(&url, store.clone());

        let err = client.send(ApiRequest::get("/always-401")).await.unwrap_err();
        assert_eq!(err.status_code, Some(401));
        assert_eq!(err.message, "nope");
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1, "exactly one refresh");
        assert!(store.credentials().is_empty());
    }

    #[tokio::test]
    async fn refresh_failure_returns_original_error() {
        let mock = MockApi::new(Duration::ZERO);
        mock.refresh_fails.store(true, Ordering::SeqCst);
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let client = bearer_client(&url, store.clone());

        let err = client.send(ApiRequest::get("/protected")).await.unwrap_err();
        assert_eq!(err.status_code, Some(401));
        assert_eq!(err.message, "Token expired", "caller sees the original error");
        assert_eq!(mock.protected_calls.load(Ordering::SeqCst), 1, "no resubmission");
        assert!(store.credentials().is_empty());
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh() {
        let mock = MockApi::new(Duration::from_millis(100));
        let url = start_mock_api(mock.clone()).await;
        let client = bearer_client(&url, logged_in_store());

        let requests = (0..5).map(|_| {
            let client = client.clone();
            async move { client.send(ApiRequest::get("/protected")).await }
        });
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(|r| r.is_ok()), "results: {results:?}");
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn logout_during_refresh_is_not_overwritten() {
        let mock = MockApi::new(Duration::from_millis(200));
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let client = bearer_client(&url, store.clone());

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.send(ApiRequest::get("/protected")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.clear();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.status_code, Some(401));
        assert!(store.credentials().is_empty(), "refreshed tokens must be discarded");
    }

    #[tokio::test]
    async fn transport_error_has_no_status_and_skips_refresh() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = logged_in_store();
        let client = bearer_client(&format!("http://{addr}"), store.clone());

        let err = client.send(ApiRequest::get("/protected")).await.unwrap_err();
        assert_eq!(err.status_code, None);
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(store.access_token().as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn stale_401_after_another_refresh_retries_without_refreshing() {
        let mock = MockApi::new(Duration::ZERO);
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let client = bearer_client(&url, store.clone());

        // sent with A1, answered only after the fast request has refreshed
        let slow = tokio::spawn({
            let client = client.clone();
            async move { client.send(ApiRequest::get("/slow-protected")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.send(ApiRequest::get("/protected")).await.unwrap();
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token(), Some(jwt_with_exp(NEW_EXP)));

        let response = slow.await.unwrap().unwrap();
        assert_eq!(response.json::<Value>().unwrap()["ok"], true);
        assert_eq!(
            mock.refresh_calls.load(Ordering::SeqCst),
            1,
            "stale 401 must reuse the newer token"
        );
        // fast: 401 + retry, slow: 401 + retry
        assert_eq!(mock.protected_calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.refresh_token().as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn timeout_has_no_status_and_skips_refresh() {
        let mock = MockApi::new(Duration::ZERO);
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let mut config = ClientConfig::new(&url);
        config.auth_header = AuthHeaderMode::Bearer;
        config.timeout = Duration::from_millis(50);
        let client = ApiClient::new(config, store.clone()).unwrap();

        let err = client.send(ApiRequest::get("/hang")).await.unwrap_err();
        assert_eq!(err.status_code, None);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.credentials(),
            Credentials::new("A1".into(), "R1".into(), 1_600_000_000)
        );
    }

    #[tokio::test]
    async fn passthrough_client_never_authenticates() {
        let mock = MockApi::new(Duration::ZERO);
        let url = start_mock_api(mock.clone()).await;
        let store = logged_in_store();
        let client = ApiClient::new(ClientConfig::new(&url), store.clone()).unwrap();

        // no Authorization header: 401, refresh, retried 401, terminal
        let err = client.send(ApiRequest::get("/protected")).await.unwrap_err();
        assert_eq!(err.status_code, Some(401));
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.protected_calls.load(Ordering::SeqCst), 2);
        assert!(store.credentials().is_empty());
    }
}
