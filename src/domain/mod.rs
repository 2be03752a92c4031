//! Domain layer: persisted entities, their keys and per-kind schemas.

pub mod entity;
pub mod error;
pub mod schema;
