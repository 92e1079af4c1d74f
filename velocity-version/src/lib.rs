//! Partial semantic version parsing, comparison, and preference ranking.

mod error;

pub use error::{Error, Result};

use error::InvalidVersionSnafu;
use snafu::{ensure, OptionExt};
use std::fmt;
use std::str::FromStr;

/// A partially-specified version: `M[.m[.p]][-suffix]`.
///
/// Missing numeric fields and a missing suffix are both meaningful: they participate in
/// ordering via sentinel values rather than being treated as zero/absent.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    suffix: Option<String>,
}

/// Comparison key for one numeric field: missing sorts below every present value.
type NumKey = (u8, u64);

/// Comparison key for the suffix field: missing sorts above every present value.
type SuffixKey = (u8, String);

/// The full, untruncated comparison key used for strict ordering and `preferred`.
type FullKey = (NumKey, NumKey, NumKey, SuffixKey);

fn num_key(v: Option<u64>) -> NumKey {
    match v {
        None => (0, 0),
        Some(n) => (1, n),
    }
}

fn suffix_key(s: &Option<String>) -> SuffixKey {
    match s {
        Some(s) => (0, s.clone()),
        None => (1, String::new()),
    }
}

impl Version {
    /// Parse a version string of the form `M[.m[.p]][-suffix]`.
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let (body, suffix) = match s.split_once('-') {
            Some((b, suf)) => (b, Some(suf)),
            None => (s, None),
        };

        if let Some(suf) = suffix {
            ensure!(
                !suf.is_empty() && suf.chars().all(|c| c.is_ascii_alphanumeric()),
                error::InvalidSuffixSnafu {
                    input: s,
                    suffix: suf,
                }
            );
        }

        let mut parts = body.split('.');
        let major = parts
            .next()
            .filter(|p| !p.is_empty())
            .context(InvalidVersionSnafu { input: s })?;
        let major: u64 = major.parse().ok().context(InvalidVersionSnafu { input: s })?;

        let minor = match parts.next() {
            Some(p) => Some(p.parse::<u64>().ok().context(InvalidVersionSnafu { input: s })?),
            None => None,
        };

        let patch = match parts.next() {
            Some(p) => Some(p.parse::<u64>().ok().context(InvalidVersionSnafu { input: s })?),
            None => None,
        };

        ensure!(parts.next().is_none(), InvalidVersionSnafu { input: s });
        // A patch without a minor is not a valid `M[.m[.p]]` derivation.
        ensure!(
            !(minor.is_none() && patch.is_some()),
            InvalidVersionSnafu { input: s }
        );

        Ok(Self {
            raw: s.to_string(),
            major,
            minor,
            patch,
            suffix: suffix.map(|s| s.to_string()),
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> Option<u64> {
        self.minor
    }

    pub fn patch(&self) -> Option<u64> {
        self.patch
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// How many of {major, minor, patch} were explicitly specified.
    fn specificity(&self) -> usize {
        1 + self.minor.is_some() as usize + self.patch.is_some() as usize
    }

    fn numeric_keys(&self) -> [NumKey; 3] {
        [
            num_key(Some(self.major)),
            num_key(self.minor),
            num_key(self.patch),
        ]
    }

    fn full_key(&self) -> FullKey {
        let [maj, min, pat] = self.numeric_keys();
        (maj, min, pat, suffix_key(&self.suffix))
    }

    /// Strict less-than over the full (untruncated) key.
    pub fn lt(&self, other: &Self) -> bool {
        self.full_key() < other.full_key()
    }

    /// Strict greater-than over the full (untruncated) key.
    pub fn gt(&self, other: &Self) -> bool {
        self.full_key() > other.full_key()
    }

    /// `self <= other`: true if equal (by the partial-prefix rule) or strictly less.
    pub fn le(&self, other: &Self) -> bool {
        self == other || self.lt(other)
    }

    /// `self >= other`: true if equal (by the partial-prefix rule) or strictly greater.
    pub fn ge(&self, other: &Self) -> bool {
        self == other || self.gt(other)
    }

    /// Total tiebreak between two versions that compare equal: prefers the more specific
    /// (or, at equal specificity, the lexicographically greater) full key.
    pub fn preferred(&self, other: &Self) -> bool {
        self.full_key() > other.full_key()
    }
}

impl PartialEq for Version {
    /// Two versions are equal only over the prefix both specify: `2.3.4 == 2.3 == 2`, but
    /// `2.3.4 != 2.3.5`. The suffix never participates in this comparison.
    fn eq(&self, other: &Self) -> bool {
        let len = self.specificity().min(other.specificity());
        let a = self.numeric_keys();
        let b = other.numeric_keys();
        a[..len] == b[..len]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

serde_plain::derive_deserialize_from_fromstr!(Version, "a version string `M[.m[.p]][-suffix]`");
serde_plain::derive_serialize_from_display!(Version);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips() {
        for s in ["1", "1.2", "1.2.3", "1.2.3-rc1", "1-beta"] {
            let v = Version::parse(s).unwrap();
            assert_eq!(v.to_string(), s);
        }
    }

    #[test]
    fn partial_equality() {
        assert_eq!(Version::parse("2.3").unwrap(), Version::parse("2.3.4").unwrap());
        assert_ne!(Version::parse("2.3.4").unwrap(), Version::parse("2.3.5").unwrap());
        assert_eq!(Version::parse("2").unwrap(), Version::parse("2.3.4").unwrap());
        assert_ne!(Version::parse("2").unwrap(), Version::parse("3.0.0").unwrap());
    }

    #[test]
    fn preference_tiebreak() {
        let rc = Version::parse("12.3.0-rc1").unwrap();
        let short = Version::parse("12.3").unwrap();
        assert_eq!(rc, short);
        assert!(rc.preferred(&short));
        assert!(!short.preferred(&rc));
    }

    #[test]
    fn ordering_respects_specified_numeric_fields() {
        let a = Version::parse("11.2").unwrap();
        let b = Version::parse("12.3").unwrap();
        assert!(a.lt(&b));
        assert!(b.gt(&a));
        assert!(a.le(&b));
        assert!(!a.ge(&b));
    }

    #[test]
    fn le_ge_defer_to_partial_equality() {
        let a = Version::parse("2.3").unwrap();
        let b = Version::parse("2.3.4").unwrap();
        assert!(a.le(&b));
        assert!(a.ge(&b));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("a.b").is_err());
        assert!(Version::parse("1.2.3.4").is_err());
        assert!(Version::parse("1..3").is_err());
    }

    #[test]
    fn transitivity_holds_for_fully_specified_versions() {
        let a = Version::parse("1.0.0").unwrap();
        let b = Version::parse("1.5.0").unwrap();
        let c = Version::parse("2.0.0").unwrap();
        assert!(a.le(&b) && b.le(&c) && a.le(&c));
    }
}
