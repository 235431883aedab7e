//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for the auth token and database URL,
//! plus a redacted form for log lines.

pub use secrecy::{ExposeSecret, SecretString};

/// A short, log-safe hint of a secret: its length and nothing else.
pub fn redacted(secret: &SecretString) -> String {
    format!("<redacted:{} chars>", secret.expose_secret().len())
}
