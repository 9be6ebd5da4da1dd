//! Typed failure kinds.
//!
//! Most functions in this crate return [`anyhow::Result`] with context
//! attached at each step. The conditions below are the ones callers (and
//! tests) need to tell apart, so they are raised as [`FixtureError`] and
//! carried inside the `anyhow::Error`; use `downcast_ref` to recover them.

use thiserror::Error;

/// Errors with a meaning beyond "this step failed".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixtureError {
    /// Source content needed to build an item is absent or unreadable.
    #[error("missing source content: {0}")]
    MissingSourceContent(String),

    /// No tag with this name exists in the layout.
    #[error("reference not found: '{name}' (known: {known})")]
    ReferenceNotFound { name: String, known: String },

    /// Architecture is not one of the supported pair, or an index has no
    /// entry for it.
    #[error("unsupported architecture '{requested}' (available: {available})")]
    UnsupportedArchitecture {
        requested: String,
        available: String,
    },

    /// Malformed digest string.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Blob content does not hash to its name.
    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl FixtureError {
    /// Join a list of names for the `known`/`available` fields.
    pub(crate) fn list<I, S>(names: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if joined.is_empty() {
            "none".to_string()
        } else {
            joined
        }
    }
}
