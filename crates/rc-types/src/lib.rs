//! Validated primitive types shared across the results combining workspace.
//!
//! These types carry a guarantee once constructed, so downstream code does not need to
//! re-check the same invariants (for example, that a job package name is not blank).

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    /// An identifier token had a `|` separator but nothing after it.
    #[error("Identifier token '{0}' has an empty value")]
    EmptyIdentifierValue(String),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Arguments
    ///
    /// * `input` - Any type that can be converted to a string reference
    ///
    /// # Returns
    ///
    /// Returns `Ok(NonEmptyText)` if the trimmed input is non-empty,
    /// or `Err(TextError::Empty)` if it's empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the wrapper and returns the owned string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// A patient identifier search token, either `value` or `system|value`.
///
/// Patient directories are searched with the token as-is, so the original spelling is kept
/// for [`IdentifierToken::as_search_value`]. The parts are exposed for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierToken {
    raw: NonEmptyText,
    system: Option<String>,
    value: String,
}

impl IdentifierToken {
    /// Parses an identifier token.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::Empty`] for blank input and [`TextError::EmptyIdentifierValue`]
    /// when a `system|` prefix is present without a value.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, TextError> {
        let raw = NonEmptyText::new(input)?;
        let (system, value) = match raw.as_str().split_once('|') {
            Some((system, value)) => {
                if value.trim().is_empty() {
                    return Err(TextError::EmptyIdentifierValue(raw.into_inner()));
                }
                let system = Some(system.trim().to_owned()).filter(|s| !s.is_empty());
                (system, value.trim().to_owned())
            }
            None => (None, raw.as_str().to_owned()),
        };

        Ok(Self { raw, system, value })
    }

    /// The identifier system, if one was given.
    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    /// The identifier value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The token as it should be sent in an `identifier=` search.
    pub fn as_search_value(&self) -> &str {
        self.raw.as_str()
    }
}

impl std::fmt::Display for IdentifierToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
