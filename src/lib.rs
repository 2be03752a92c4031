//! Russian doll fragment caching.
//!
//! Entities carry a freshness token derived from their identity and last write
//! time. Writes go through [`application::store::CascadingStore`], which touches
//! every declared dependent first so their tokens advance too. Templates wrap
//! expensive blocks in fragment tags; [`cache::FragmentCache`] keys each block by
//! logical key, content fingerprint and source location, so any upstream write
//! or template edit misses the cache without explicit busting.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod presentation;
