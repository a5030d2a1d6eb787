//! Minimal Kubernetes version parsing
//!
//! Only `major.minor.patch` with an optional `v` prefix, pre-release and
//! build suffix is understood; that is all the upgrade logic compares.

use crate::error::{CoreError, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KubeVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl KubeVersion {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidVersion(input.to_string());

        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        // build metadata never affects ordering
        let trimmed = trimmed.split('+').next().unwrap_or_default();
        let (core, pre) = match trimmed.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (trimmed, None),
        };

        let mut parts = core.split('.');
        let mut segment = |required: bool| -> Result<u64> {
            match parts.next() {
                Some(s) => s.parse::<u64>().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = segment(true)?;
        let minor = segment(true)?;
        let patch = segment(false)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// Same major and minor, different patch.
    pub fn is_patch_of(&self, other: &KubeVersion) -> bool {
        self.major == other.major && self.minor == other.minor && self.patch != other.patch
    }
}

/// Whether moving between `desired` and `current` is a patch-only change.
pub fn is_patch(desired: &str, current: &str) -> Result<bool> {
    let desired = KubeVersion::parse(desired)?;
    let current = KubeVersion::parse(current)?;
    Ok(desired.is_patch_of(&current))
}

impl FromStr for KubeVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        KubeVersion::parse(s)
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl Ord for KubeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for KubeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variants() {
        let v = KubeVersion::parse("v1.13.5").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 13, 5));

        let v = KubeVersion::parse("1.14").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 14, 0));

        let v = KubeVersion::parse("v1.30.2-rc.1+k3s1").unwrap();
        assert_eq!(v.pre.as_deref(), Some("rc.1"));
        assert_eq!(v.to_string(), "v1.30.2-rc.1");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(KubeVersion::parse("").is_err());
        assert!(KubeVersion::parse("latest").is_err());
        assert!(KubeVersion::parse("1").is_err());
        assert!(KubeVersion::parse("1.2.3.4").is_err());
        assert!(KubeVersion::parse("1.2.3-").is_err());
    }

    #[test]
    fn test_is_patch() {
        assert!(is_patch("1.13.6", "1.13.5").unwrap());
        assert!(!is_patch("1.14.0", "1.13.5").unwrap());
        assert!(!is_patch("1.13.5", "1.13.5").unwrap());
        assert!(is_patch("v1.13.6", "1.13.5").unwrap());
    }

    #[test]
    fn test_ordering() {
        let older = KubeVersion::parse("v1.13.5").unwrap();
        let newer = KubeVersion::parse("v1.14.0").unwrap();
        let rc = KubeVersion::parse("v1.14.0-rc.0").unwrap();
        assert!(older < newer);
        assert!(rc < newer);
        assert!(older < rc);
    }
}
