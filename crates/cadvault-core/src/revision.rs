use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Which component of the revision a check-in bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionClass {
    #[default]
    Minor,
    Major,
}

impl FromStr for RevisionClass {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minor" => Ok(RevisionClass::Minor),
            "major" => Ok(RevisionClass::Major),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown revision class '{}'",
                other
            ))),
        }
    }
}

/// A `<major>.<minor>` revision, ordered lexicographically on the integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision {
    pub major: u32,
    pub minor: u32,
}

impl Revision {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a revision string, falling back to `0.0` on anything malformed.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for Revision {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || VaultError::MalformedState(format!("malformed revision '{}'", s));
        let (major, minor) = s.trim().split_once('.').ok_or_else(malformed)?;
        let major = major.parse::<u32>().map_err(|_| malformed())?;
        let minor = minor.parse::<u32>().map_err(|_| malformed())?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Derive the revision that follows `current`.
///
/// Never fails: a malformed `current` is read as `0.0`. A major bump uses
/// `explicit_major` when it is ahead of the current major, otherwise
/// `major + 1`, and always resets the minor to 0.
pub fn next_revision(current: &str, class: RevisionClass, explicit_major: Option<u32>) -> String {
    let current = Revision::parse_lenient(current);
    let next = match class {
        RevisionClass::Minor => Revision::new(current.major, current.minor.saturating_add(1)),
        RevisionClass::Major => {
            let bumped = current.major.saturating_add(1);
            let major = explicit_major.filter(|m| *m > current.major).unwrap_or(bumped);
            Revision::new(major, 0)
        }
    };
    next.to_string()
}
