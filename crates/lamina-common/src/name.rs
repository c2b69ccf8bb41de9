//! Image name validation.

use std::fmt;
use std::str::FromStr;

use crate::error::{LaminaError, LaminaResult};

/// A validated image (or tag) name.
///
/// Names double as directory names in the layer store and in the machine
/// directory, and as the machine name passed to `systemd-nspawn -M`, so they
/// must:
/// - Be 1-64 characters long
/// - Contain only ASCII letters, digits, `-`, `_` and `.`
/// - Not start with `.`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageName(String);

impl ImageName {
    /// Maximum length of an image name.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new image name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(name: impl Into<String>) -> LaminaResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate a name string.
    fn validate(name: &str) -> LaminaResult<()> {
        let invalid = || LaminaError::InvalidImageName {
            name: name.to_string(),
        };

        if name.is_empty() || name.len() > Self::MAX_LENGTH || name.starts_with('.') {
            return Err(invalid());
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ImageName {
    type Err = LaminaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ImageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
