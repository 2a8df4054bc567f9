//! Remote credential handling.
//!
//! Tokens are expected to be embedded in the configured remote URLs; this
//! module only makes sure they never leave the process in clear text.

pub mod sanitize;

pub use sanitize::{sanitize_remote_url, sanitize_text};
