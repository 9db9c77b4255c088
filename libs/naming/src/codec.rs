//! Encoding and decoding of instance names.

use std::fmt;

use warmpool_id::InstanceId;

use crate::{NameError, Phase, VersionTag};

/// The decoded content of a pool instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    pub id: InstanceId,
    pub phase: Phase,
    pub version: VersionTag,
}

impl InstanceName {
    /// Creates a name triple.
    pub fn new(id: InstanceId, phase: Phase, version: VersionTag) -> Self {
        Self { id, phase, version }
    }

    /// Same instance in another phase.
    #[must_use]
    pub fn with_phase(&self, phase: Phase) -> Self {
        Self {
            id: self.id,
            phase,
            version: self.version.clone(),
        }
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.id, self.version, self.phase)
    }
}

/// Maps between [`InstanceName`] triples and platform name strings.
///
/// Holds the name prefix and the version tag of the running generation.
/// Passed explicitly to whatever needs it; there is no global codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCodec {
    prefix: String,
    current: VersionTag,
}

impl NameCodec {
    /// Creates a codec.
    ///
    /// The prefix must be non-empty, lowercase ASCII alphanumerics or `-`,
    /// and must not start or end with `-`.
    pub fn new(prefix: impl Into<String>, current: VersionTag) -> Result<Self, NameError> {
        let prefix = prefix.into();
        let invalid = |reason| NameError::InvalidPrefix {
            prefix: prefix.clone(),
            reason,
        };

        if prefix.is_empty() {
            return Err(invalid("prefix cannot be empty"));
        }
        if !prefix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(invalid("only lowercase letters, digits and '-' are allowed"));
        }
        if prefix.starts_with('-') || prefix.ends_with('-') {
            return Err(invalid("prefix cannot start or end with '-'"));
        }

        Ok(Self { prefix, current })
    }

    /// Name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Version tag of the running generation.
    pub fn current_version(&self) -> &VersionTag {
        &self.current
    }

    /// Renders a name.
    pub fn encode(&self, name: &InstanceName) -> String {
        format!(
            "{}-{}-{}{}",
            self.prefix,
            name.id,
            name.version,
            name.phase.suffix()
        )
    }

    /// Parses a name, returning `None` for anything that is not an exact match.
    pub fn decode(&self, raw: &str) -> Option<InstanceName> {
        let rest = raw.strip_prefix(self.prefix.as_str())?.strip_prefix('-')?;
        let (id, tail) = rest.split_once('-')?;
        let id = InstanceId::parse(id).ok()?;

        let (version, phase) = if let Some(v) = tail.strip_suffix('b') {
            (v, Phase::Building)
        } else if let Some(v) = tail.strip_suffix('i') {
            (v, Phase::Idle)
        } else {
            (tail, Phase::Claimed)
        };
        let version = VersionTag::parse(version).ok()?;

        Some(InstanceName { id, phase, version })
    }

    /// A Building-phase name with a freshly generated ID in the current generation.
    pub fn building_name(&self) -> InstanceName {
        InstanceName::new(InstanceId::random(), Phase::Building, self.current.clone())
    }

    /// Rendered name of the same instance in the Idle phase.
    pub fn idle_name(&self, name: &InstanceName) -> String {
        self.encode(&name.with_phase(Phase::Idle))
    }

    /// Rendered name of the same instance in the Claimed phase.
    pub fn claimed_name(&self, name: &InstanceName) -> String {
        self.encode(&name.with_phase(Phase::Claimed))
    }

    /// Returns true if the name belongs to the running generation.
    pub fn is_current(&self, name: &InstanceName) -> bool {
        name.version == self.current
    }
}
