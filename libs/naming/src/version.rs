//! Version tags embedded in instance names.

use std::fmt;
use std::str::FromStr;

use crate::NameError;

/// Generation marker of the pool manager that built an instance.
///
/// Stored in its "dashed" form: the release version with its dots removed,
/// so release `0.0.1` is tagged `001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTag(String);

impl VersionTag {
    /// Parses an already-dashed tag.
    pub fn parse(tag: &str) -> Result<Self, NameError> {
        if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NameError::InvalidVersion(tag.to_string()));
        }
        Ok(Self(tag.to_string()))
    }

    /// Derives the tag from a dotted release version such as `0.0.1`.
    pub fn from_release(version: &str) -> Result<Self, NameError> {
        Self::parse(&version.replace('.', ""))
    }

    /// Returns the tag string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VersionTag {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
