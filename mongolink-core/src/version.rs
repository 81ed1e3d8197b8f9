//! Server version handling.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A dotted numeric server version, e.g. `2.4.6`.
///
/// An unknown version (no components) compares less than every known
/// version and is accepted by every [`VersionRange`]; a server whose
/// version has not been discovered yet must not have messages rejected
/// on its behalf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    /// Creates a version from its numeric components.
    pub fn new(parts: impl Into<Vec<u64>>) -> Self {
        Self {
            parts: parts.into(),
        }
    }

    /// The unknown version placeholder.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Returns true if the version has not been discovered.
    pub fn is_unknown(&self) -> bool {
        self.parts.is_empty()
    }

    /// Returns the numeric components.
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return f.write_str("unknown");
        }
        for (index, part) in self.parts.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        // Release suffixes ("2.5.0-rc1") are ignored past the first
        // non-numeric component.
        let mut parts = Vec::new();
        for piece in text.split('.') {
            let numeric: String = piece.chars().take_while(char::is_ascii_digit).collect();
            if numeric.is_empty() {
                break;
            }
            parts.push(
                numeric
                    .parse::<u64>()
                    .map_err(|_| Error::Protocol(format!("unparsable version '{text}'")))?,
            );
            if numeric.len() != piece.len() {
                break;
            }
        }
        if parts.is_empty() {
            return Err(Error::Protocol(format!("unparsable version '{text}'")));
        }
        Ok(Self { parts })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for index in 0..len {
            let left = self.parts.get(index).copied().unwrap_or(0);
            let right = other.parts.get(index).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

/// An inclusive range of server versions a message requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionRange {
    minimum: Option<Version>,
    maximum: Option<Version>,
}

impl VersionRange {
    /// Creates a range bounded on both ends.
    pub fn new(minimum: Option<Version>, maximum: Option<Version>) -> Self {
        Self { minimum, maximum }
    }

    /// Creates a range requiring at least the given version.
    pub fn at_least(minimum: Version) -> Self {
        Self::new(Some(minimum), None)
    }

    /// Creates a range requiring at most the given version.
    pub fn at_most(maximum: Version) -> Self {
        Self::new(None, Some(maximum))
    }

    /// Returns the minimum bound.
    pub fn minimum(&self) -> Option<&Version> {
        self.minimum.as_ref()
    }

    /// Returns the maximum bound.
    pub fn maximum(&self) -> Option<&Version> {
        self.maximum.as_ref()
    }

    /// Returns true if the version satisfies the range.
    ///
    /// Unknown versions always satisfy the range.
    pub fn contains(&self, version: &Version) -> bool {
        if version.is_unknown() {
            return true;
        }
        if let Some(minimum) = &self.minimum {
            if version < minimum {
                return false;
            }
        }
        if let Some(maximum) = &self.maximum {
            if version > maximum {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.minimum, &self.maximum) {
            (Some(minimum), Some(maximum)) => write!(f, "[{minimum}, {maximum}]"),
            (Some(minimum), None) => write!(f, "[{minimum}, )"),
            (None, Some(maximum)) => write!(f, "(, {maximum}]"),
            (None, None) => f.write_str("(, )"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let version: Version = "2.4.6".parse().unwrap();
        assert_eq!(version.parts(), &[2, 4, 6]);
        assert_eq!(version.to_string(), "2.4.6");
    }

    #[test]
    fn test_parse_release_candidate_suffix() {
        let version: Version = "2.5.0-rc1".parse().unwrap();
        assert_eq!(version.parts(), &[2, 5, 0]);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!("".parse::<Version>().is_err());
        assert!("abc".parse::<Version>().is_err());
    }

    #[test]
    fn test_ordering_pads_with_zeros() {
        let short: Version = "2.4".parse().unwrap();
        let long: Version = "2.4.0".parse().unwrap();
        let newer: Version = "2.4.1".parse().unwrap();

        assert_eq!(short.cmp(&long), Ordering::Equal);
        assert!(newer > short);
        assert!(Version::unknown() < short);
    }

    #[test]
    fn test_range_contains() {
        let range = VersionRange::at_least("2.0".parse().unwrap());
        assert!(range.contains(&"2.0".parse().unwrap()));
        assert!(range.contains(&"3.1.2".parse().unwrap()));
        assert!(!range.contains(&"1.8".parse().unwrap()));
    }

    #[test]
    fn test_range_accepts_unknown_version() {
        let range = VersionRange::new(
            Some("2.0".parse().unwrap()),
            Some("2.6".parse().unwrap()),
        );
        assert!(range.contains(&Version::unknown()));
    }

    #[test]
    fn test_range_display() {
        let range = VersionRange::at_most("2.6".parse().unwrap());
        assert_eq!(range.to_string(), "(, 2.6]");
    }
}
