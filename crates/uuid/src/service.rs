//! Canonical job identifiers and resource id allocation.

use crate::{UuidError, UuidResult};
use std::path::{Path, PathBuf};
use std::{fmt, str::FromStr};

/// Re-exported for convenience.
pub use ::uuid::Uuid;

/// Canonical identifier for a job or batch job (32 lowercase hex characters, no hyphens).
///
/// Once constructed the contained UUID is known to be canonical, so it can be used to
/// derive storage paths without further checks.
///
/// # Construction
/// - [`JobUuid::new`] allocates a fresh identifier at submission time.
/// - [`JobUuid::parse`] validates an identifier supplied by a caller (for example a status
///   read). Hyphenated or uppercase forms are rejected.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobUuid(Uuid);

impl Default for JobUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl JobUuid {
    /// Allocates a new random job identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Validates and parses an identifier that must already be canonical.
    ///
    /// # Arguments
    ///
    /// * `input` - Identifier string. Must be exactly 32 lowercase hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if `input` is not in canonical form.
    pub fn parse(input: &str) -> UuidResult<Self> {
        if !Self::is_canonical(input) {
            return Err(UuidError::InvalidInput(format!(
                "job id must be 32 lowercase hex characters without hyphens, got: '{input}'"
            )));
        }
        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| UuidError::InvalidInput(format!("job id '{input}': {e}")))
    }

    /// Returns the inner `uuid::Uuid`.
    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Returns true if `input` is a canonical job identifier.
    ///
    /// This is a purely syntactic check: 32 bytes, `0-9` and `a-f` only.
    pub fn is_canonical(input: &str) -> bool {
        input.len() == 32
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Returns `parent_dir/<s1>/<s2>/<id>/` where `s1`/`s2` are the first two hex pairs.
    pub fn sharded_dir(&self, parent_dir: &Path) -> PathBuf {
        let canonical = self.0.simple().to_string();
        let s1 = &canonical[0..2];
        let s2 = &canonical[2..4];
        parent_dir.join(s1).join(s2).join(&canonical)
    }
}

impl fmt::Display for JobUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for JobUuid {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobUuid::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for JobUuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for JobUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        JobUuid::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Allocates an id for a synthesized FHIR resource or bundle.
///
/// Resource ids use the hyphenated form, which is what FHIR servers conventionally emit.
pub fn new_resource_id() -> String {
    Uuid::new_v4().hyphenated().to_string()
}
