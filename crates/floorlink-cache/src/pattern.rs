//! Key patterns for invalidation and priority declarations
//!
//! A pattern without `*` matches one key exactly. Each `*` matches any run of
//! characters, including none: `widget:*` matches `widget:oee` and
//! `widget:`, `*:site_a` matches every key ending in `:site_a`.

use crate::error::CacheError;
use regex::Regex;
use std::fmt;

/// Exact key or `*` wildcard pattern
#[derive(Clone)]
pub enum KeyPattern {
    /// Matches one key
    Exact(String),
    /// Matches keys against a compiled wildcard
    Wildcard {
        /// Pattern as written
        source: String,
        /// Anchored regex equivalent
        regex: Regex,
    },
}

impl KeyPattern {
    /// Parse a pattern.
    ///
    /// # Errors
    /// `CacheError::EmptyPattern` for an empty string
    pub fn parse(pattern: &str) -> Result<Self, CacheError> {
        if pattern.is_empty() {
            return Err(CacheError::EmptyPattern);
        }
        if !pattern.contains('*') {
            return Ok(Self::Exact(pattern.to_string()));
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        // escaped literals joined by `.*` always compile
        match Regex::new(&format!("^{body}$")) {
            Ok(regex) => Ok(Self::Wildcard {
                source: pattern.to_string(),
                regex,
            }),
            Err(_) => Ok(Self::Exact(pattern.to_string())),
        }
    }

    /// Whether `key` matches
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Wildcard { regex, .. } => regex.is_match(key),
        }
    }

    /// Pattern contains a wildcard
    #[inline]
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard { .. })
    }

    /// Pattern as written
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Wildcard { source: s, .. } => s,
        }
    }
}

impl fmt::Debug for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPattern").field(&self.as_str()).finish()
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for KeyPattern {}
