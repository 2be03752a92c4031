//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entity::{Entity, EntityKey, FieldValue};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    /// Most recently written first.
    #[default]
    UpdatedDesc,
    /// Ascending by key: numeric ids compare as numbers and sort before
    /// names. Stable across writes.
    KeyAsc,
}

/// Query over a single kind with an optional attribute equality filter.
#[derive(Debug, Clone)]
pub struct EntityQuery {
    pub kind: String,
    pub filter: Option<(String, FieldValue)>,
    pub order: QueryOrder,
    pub limit: Option<usize>,
}

impl EntityQuery {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            filter: None,
            order: QueryOrder::default(),
            limit: None,
        }
    }

    pub fn filter(mut self, attribute: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filter = Some((attribute.into(), value.into()));
        self
    }

    pub fn order(mut self, order: QueryOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `entity` satisfies the kind and filter of this query.
    pub fn matches(&self, entity: &Entity) -> bool {
        if entity.kind() != self.kind {
            return false;
        }
        match &self.filter {
            Some((attribute, value)) => entity.get(attribute) == Some(value),
            None => true,
        }
    }
}

/// Persistence collaborator.
///
/// Implementations stamp `updated_at` on every put with a value strictly
/// greater than the one previously stored for the same key, so that a
/// re-put of an unchanged entity always yields a new freshness token.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Reserve a fresh numeric id for `kind`.
    async fn allocate_id(&self, kind: &str) -> Result<i64, RepoError>;

    async fn get(&self, key: &EntityKey) -> Result<Option<Entity>, RepoError>;

    /// Fetch the entities that exist among `keys`, in request order.
    async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, RepoError>;

    /// Persist one entity and return it with its new `updated_at`.
    async fn put(&self, entity: Entity) -> Result<Entity, RepoError>;

    async fn put_many(&self, entities: Vec<Entity>) -> Result<Vec<Entity>, RepoError>;

    /// Delete an entity. Deleting a missing key is not an error.
    async fn delete(&self, key: &EntityKey) -> Result<(), RepoError>;

    async fn query(&self, query: &EntityQuery) -> Result<Vec<Entity>, RepoError>;
}
