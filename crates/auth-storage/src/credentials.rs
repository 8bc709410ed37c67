//! In-memory credential mirror with write-through persistence
//!
//! `CredentialStore` owns the access token, refresh token and expiry. Reads
//! come from memory. Every mutation updates memory first and then writes
//! through to the backend; a backend failure is handed to the error sink and
//! the in-memory value stays as set, so the two can drift until the next
//! successful write.
//!
//! A generation counter is bumped on every mutation. Token refresh commits its
//! result with `replace_if_generation`, so a logout that lands while a refresh
//! is in flight is not overwritten by the refreshed tokens.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info};

use crate::backend::KeyValueStore;
use crate::error::Error;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const EXPIRES_KEY: &str = "expires";

/// Callback receiving persistence failures.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// Default sink: log the failure and carry on.
pub fn log_error_sink() -> ErrorSink {
    Arc::new(|e: &Error| error!(error = %e, "auth storage error"))
}

/// The three credential fields, each independently absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Access token expiry as a unix timestamp in seconds
    pub expires_at: Option<i64>,
}

impl Credentials {
    pub fn new(access_token: String, refresh_token: String, expires_at: i64) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            expires_at: Some(expires_at),
        }
    }

    /// All three fields absent.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.expires_at.is_none()
    }

    /// Whether `expires_at` is at or before `now` (unix seconds).
    ///
    /// Informational only: refresh is driven by 401 responses, not by this.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Credentials plus the generation they were read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub credentials: Credentials,
    pub generation: u64,
}

struct State {
    credentials: Credentials,
    generation: u64,
}

/// Shared credential store. Wrap in `Arc` to share between clients.
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
    on_error: ErrorSink,
    state: RwLock<State>,
}

impl CredentialStore {
    /// Build a store from whatever the backend currently holds.
    ///
    /// Never fails: a key that cannot be read is treated as absent and the
    /// error is reported to `on_error`. An `expires` value that is not an
    /// integer is also treated as absent.
    pub fn load(backend: Arc<dyn KeyValueStore>, on_error: ErrorSink) -> Self {
        let read = |key: &str| match backend.get_string(key) {
            Ok(value) => value,
            Err(e) => {
                on_error(&e);
                None
            }
        };

        let credentials = Credentials {
            access_token: read(ACCESS_TOKEN_KEY),
            refresh_token: read(REFRESH_TOKEN_KEY),
            expires_at: read(EXPIRES_KEY).and_then(|raw| raw.trim().parse::<i64>().ok()),
        };

        info!(
            has_access_token = credentials.access_token.is_some(),
            has_refresh_token = credentials.refresh_token.is_some(),
            expires_at = ?credentials.expires_at,
            "loaded credentials"
        );

        Self {
            backend,
            on_error,
            state: RwLock::new(State {
                credentials,
                generation: 0,
            }),
        }
    }

    /// Store backed by `backend` that logs persistence failures.
    pub fn with_logging(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::load(backend, log_error_sink())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().credentials.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().credentials.refresh_token.clone()
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.read().credentials.expires_at
    }

    pub fn credentials(&self) -> Credentials {
        self.read().credentials.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.read();
        Snapshot {
            credentials: state.credentials.clone(),
            generation: state.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn set_access_token(&self, value: Option<String>) {
        let mut state = self.write();
        state.credentials.access_token = value.clone();
        state.generation += 1;
        self.persist(ACCESS_TOKEN_KEY, value.as_deref());
    }

    pub fn set_refresh_token(&self, value: Option<String>) {
        let mut state = self.write();
        state.credentials.refresh_token = value.clone();
        state.generation += 1;
        self.persist(REFRESH_TOKEN_KEY, value.as_deref());
    }

    pub fn set_expires_at(&self, value: Option<i64>) {
        let mut state = self.write();
        state.credentials.expires_at = value;
        state.generation += 1;
        self.persist(EXPIRES_KEY, value.map(|v| v.to_string()).as_deref());
    }

    /// Replace all three fields in one step.
    pub fn replace(&self, credentials: Credentials) {
        let mut state = self.write();
        self.commit(&mut state, credentials);
        debug!(generation = state.generation, "replaced credentials");
    }

    /// Replace all three fields only if nothing changed since `generation`.
    ///
    /// Returns false (and leaves the store untouched) when another mutation
    /// happened in between.
    pub fn replace_if_generation(&self, generation: u64, credentials: Credentials) -> bool {
        let mut state = self.write();
        if state.generation != generation {
            debug!(
                expected = generation,
                current = state.generation,
                "credentials changed concurrently, discarding replacement"
            );
            return false;
        }
        self.commit(&mut state, credentials);
        true
    }

    /// Set all three fields to absent, deleting the persisted keys.
    pub fn clear(&self) {
        let mut state = self.write();
        self.commit(&mut state, Credentials::default());
        debug!(generation = state.generation, "cleared credentials");
    }

    /// Persist then publish. Runs under the write guard, so backend I/O
    /// (file write, encryption) blocks readers until it finishes.
    fn commit(&self, state: &mut State, credentials: Credentials) {
        self.persist(ACCESS_TOKEN_KEY, credentials.access_token.as_deref());
        self.persist(REFRESH_TOKEN_KEY, credentials.refresh_token.as_deref());
        self.persist(
            EXPIRES_KEY,
            credentials.expires_at.map(|v| v.to_string()).as_deref(),
        );
        state.credentials = credentials;
        state.generation += 1;
    }

    /// Write or delete one key; failures go to the sink.
    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(value) => self.backend.set(key, value),
            None => self.backend.delete(key),
        };
        if let Err(e) = result {
            (self.on_error)(&e);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
