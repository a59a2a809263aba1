//! Build engine version strings (`6.0`, `5.6.4`, `6.0-rc-1`)

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Directory names that look like an engine version.
pub static VERSION_DIR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+(\.\d+)*(-[0-9A-Za-z.+-]+)?$").expect("version pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a version: {0:?}")]
pub struct VersionParseError(String);

/// Ordered version: numeric components first (missing components count as
/// zero), then a release sorts after any of its pre-releases.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<u64>,
    suffix: Option<String>,
}

impl Version {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_pre_release(&self) -> bool {
        self.suffix.is_some()
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if !VERSION_DIR_PATTERN.is_match(trimmed) {
            return Err(VersionParseError(s.to_string()));
        }
        let (numbers, suffix) = match trimmed.split_once('-') {
            Some((numbers, suffix)) => (numbers, Some(suffix.to_string())),
            None => (trimmed, None),
        };
        let components = numbers
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VersionParseError(s.to_string()))?;
        Ok(Self {
            raw: trimmed.to_string(),
            components,
            suffix,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        match (&self.suffix, &other.suffix) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn numeric_components_compare_numerically() {
        assert!(v("5.10") > v("5.9"));
        assert!(v("6.0") > v("5.6.4"));
        assert_eq!(v("6.0"), v("6.0.0"));
    }

    #[test]
    fn release_sorts_after_pre_release() {
        assert!(v("6.0-rc-1") < v("6.0"));
        assert!(v("6.0-rc-1") < v("6.0-rc-2"));
        assert!(v("6.0-rc-1").is_pre_release());
    }

    #[test]
    fn cache_family_directories_are_not_versions() {
        for name in ["modules-2", "jars-9", "transforms-3", "journal-1", ""] {
            assert!(name.parse::<Version>().is_err(), "{name} parsed as a version");
        }
    }
}
