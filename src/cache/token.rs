//! Freshness tokens.
//!
//! A token is derived from an entity's kind, key and last write time. It is
//! never stored; recomputing it for an untouched entity gives the same string,
//! and any write (which restamps `updated_at`) gives a different one.

use std::fmt;

use time::OffsetDateTime;

use crate::domain::entity::{Entity, EntityKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FreshnessToken(String);

impl FreshnessToken {
    pub fn compute(entity: &Entity) -> Self {
        Self::from_parts(entity.key(), entity.updated_at())
    }

    /// `kind/urlsafe-key/seconds.nanoseconds`
    pub fn from_parts(key: &EntityKey, updated_at: OffsetDateTime) -> Self {
        Self(format!(
            "{}/{}/{}.{:09}",
            key.kind(),
            key.urlsafe(),
            updated_at.unix_timestamp(),
            updated_at.nanosecond()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&Entity> for FreshnessToken {
    fn from(entity: &Entity) -> Self {
        Self::compute(entity)
    }
}

impl AsRef<str> for FreshnessToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
