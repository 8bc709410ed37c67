//! Shared types for the session workspace: redacted secrets and the config
//! error type used by the CLI.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
