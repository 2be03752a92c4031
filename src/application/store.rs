//! Store decorator that runs the invalidation cascade ahead of every write.

use std::sync::Arc;

use tracing::instrument;

use crate::application::repos::{EntityQuery, EntityStore, RepoError};
use crate::cache::{CascadeError, InvalidationCascade, TouchSet};
use crate::domain::entity::{Entity, EntityKey};

/// Wraps an [`EntityStore`] so that writes and deletes first touch their
/// dependents. A cascade failure aborts the write it belongs to.
#[derive(Clone)]
pub struct CascadingStore {
    inner: Arc<dyn EntityStore>,
    cascade: Arc<InvalidationCascade>,
}

impl CascadingStore {
    pub fn new(inner: Arc<dyn EntityStore>, cascade: Arc<InvalidationCascade>) -> Self {
        Self { inner, cascade }
    }

    pub fn inner(&self) -> &Arc<dyn EntityStore> {
        &self.inner
    }

    pub fn cascade(&self) -> &InvalidationCascade {
        &self.cascade
    }

    pub async fn allocate_id(&self, kind: &str) -> Result<i64, RepoError> {
        self.inner.allocate_id(kind).await
    }

    pub async fn get(&self, key: &EntityKey) -> Result<Option<Entity>, RepoError> {
        self.inner.get(key).await
    }

    pub async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, RepoError> {
        self.inner.get_many(keys).await
    }

    pub async fn query(&self, query: &EntityQuery) -> Result<Vec<Entity>, RepoError> {
        self.inner.query(query).await
    }

    #[instrument(skip(self, entity), fields(key = %entity.key()))]
    pub async fn put(&self, entity: Entity) -> Result<Entity, CascadeError> {
        let mut touched = TouchSet::seeded([entity.key()]);
        self.cascade
            .break_cache(self.inner.as_ref(), entity.key(), Some(&entity), &mut touched)
            .await?;
        Ok(self.inner.put(entity).await?)
    }

    /// Cascade for every entity in the batch, sharing one touch set, then
    /// write the batch.
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    pub async fn put_many(&self, entities: Vec<Entity>) -> Result<Vec<Entity>, CascadeError> {
        let mut touched = TouchSet::seeded(entities.iter().map(Entity::key));
        for entity in &entities {
            self.cascade
                .break_cache(self.inner.as_ref(), entity.key(), Some(entity), &mut touched)
                .await?;
        }
        Ok(self.inner.put_many(entities).await?)
    }

    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &EntityKey) -> Result<(), CascadeError> {
        let mut touched = TouchSet::seeded([key]);
        self.cascade
            .break_cache(self.inner.as_ref(), key, None, &mut touched)
            .await?;
        Ok(self.inner.delete(key).await?)
    }
}
