//! Fragment cache key definitions.
//!
//! A stored fragment is addressed by `logical/fingerprint/location`: the
//! caller's logical key (usually a freshness token), the hash of the block's
//! template source, and where that block lives.

use std::fmt;

use sha2::{Digest, Sha256};

/// Hash of a fragment block's literal source, computed once at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn of(source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compile-time facts about one fragment block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentSite {
    fingerprint: ContentFingerprint,
    location: String,
}

impl FragmentSite {
    pub fn new(fingerprint: ContentFingerprint, location: impl Into<String>) -> Self {
        Self {
            fingerprint,
            location: location.into(),
        }
    }

    /// Fingerprint `body` and pin it to `location`.
    pub fn for_source(body: &str, location: impl Into<String>) -> Self {
        Self::new(ContentFingerprint::of(body), location)
    }

    pub fn fingerprint(&self) -> &ContentFingerprint {
        &self.fingerprint
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

/// Composite key under which a rendered fragment is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey(String);

impl FragmentKey {
    pub fn compose(logical: &str, site: &FragmentSite) -> Self {
        Self(format!(
            "{logical}/{}/{}",
            site.fingerprint.as_str(),
            site.location
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
