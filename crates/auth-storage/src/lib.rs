//! Credential persistence for the authenticated API client
//!
//! Holds the three credential fields (access token, refresh token, expiry)
//! in memory and writes them through to a pluggable key-value backend.
//! Persistence failures never reach callers; they go to an error sink.
//!
//! Credential lifecycle:
//! 1. `CredentialStore::load()` reads persisted values at startup
//! 2. Login replaces all three fields via `CredentialStore::replace()`
//! 3. A token refresh decodes the new expiry with `token::decode_expiry()`
//!    and commits via `CredentialStore::replace_if_generation()`
//! 4. Logout or a failed refresh calls `CredentialStore::clear()`

pub mod backend;
pub mod credentials;
pub mod error;
pub mod token;

pub use backend::{FileStore, KeyValueStore, MemoryStore};
pub use credentials::{
    ACCESS_TOKEN_KEY, CredentialStore, Credentials, EXPIRES_KEY, ErrorSink, REFRESH_TOKEN_KEY,
    Snapshot, log_error_sink,
};
pub use error::{Error, Result};
pub use token::{TokenClaims, decode_claims, decode_expiry};
