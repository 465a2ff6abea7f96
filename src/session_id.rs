//! Session identifiers.
//!
//! Sessions are keyed by caller-generated, time-ordered UUIDs (version 7).
//! The server never mints ids on behalf of callers; it only checks that the
//! supplied string has the exact canonical layout.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::TermError;

/// Canonical lowercase UUIDv7: version nibble `7`, RFC 4122 variant `10xx`.
static SESSION_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-7[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("session id pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validate `raw` against the UUIDv7 layout.
    pub fn parse(raw: &str) -> Result<Self, TermError> {
        if SESSION_ID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(TermError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn is_valid(raw: &str) -> bool {
        SESSION_ID_PATTERN.is_match(raw)
    }

    /// Mint a fresh id. Callers (CLI tooling, tests) use this; the manager never does.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SessionId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
