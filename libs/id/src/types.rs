//! The instance ID type.

use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

use crate::IdError;

/// Lowercase Crockford base32 alphabet (no `i`, `l`, `o`, `u`).
const ALPHABET: &str = "0123456789abcdefghjkmnpqrstvwxyz";

/// Opaque, stable identifier of a pooled instance.
///
/// Carried inside the instance name, so it survives every rename between
/// phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u128);

impl InstanceId {
    /// Length of the canonical text form.
    pub const LEN: usize = 26;

    /// Generates a fresh ID from 128 random bits.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random::<u128>())
    }

    /// Creates an ID from raw bits.
    #[must_use]
    pub const fn from_u128(bits: u128) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Parses an ID from its canonical text form.
    ///
    /// Only the lowercase rendering is accepted, so each ID has exactly one
    /// spelling.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() != Self::LEN {
            return Err(IdError::InvalidLength {
                expected: Self::LEN,
                actual: s.len(),
            });
        }

        if let Some((position, found)) = s.chars().enumerate().find(|(_, c)| !ALPHABET.contains(*c))
        {
            return Err(IdError::InvalidCharacter { found, position });
        }

        let ulid = Ulid::from_string(s).map_err(|_| IdError::Overflow)?;
        Ok(Self(ulid.0))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let upper = Ulid::from(self.0).to_string();
        f.write_str(&upper.to_ascii_lowercase())
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
