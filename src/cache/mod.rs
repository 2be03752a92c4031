//! Matryoshka cache core
//!
//! Three pieces cooperate to keep nested fragments fresh without manual
//! busting:
//!
//! - **Freshness tokens** derive a logical cache key from an entity's kind,
//!   identity and last write time.
//! - **The invalidation cascade** re-persists an entity's dependents on every
//!   write so their tokens advance too.
//! - **The fragment cache** stores rendered blocks under
//!   `token/fingerprint/location`.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! memory_limit = 1024
//! default_timeout_secs = 0
//!
//! [cascade]
//! max_depth = 1
//! ```

mod backend;
mod cascade;
mod config;
mod fragment;
mod keys;
pub(crate) mod lock;
mod token;

pub use backend::{BackendError, KvBackend, MemoryBackend};
pub use cascade::{CascadeError, InvalidationCascade, TouchSet};
pub use config::{CacheConfig, CascadeConfig};
pub use fragment::FragmentCache;
pub use keys::{ContentFingerprint, FragmentKey, FragmentSite};
pub use token::FreshnessToken;
