//! In-process entity store used by the demo and by tests.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use crate::application::repos::{EntityQuery, EntityStore, QueryOrder, RepoError};
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::entity::{Entity, EntityKey};

const SOURCE: &str = "infra::memory";

#[derive(Default)]
struct State {
    entities: HashMap<EntityKey, Entity>,
    next_ids: HashMap<String, i64>,
    last_stamp: Option<OffsetDateTime>,
}

impl State {
    /// Microsecond-resolution write time, strictly after the previous one.
    fn stamp(&mut self) -> OffsetDateTime {
        let now = truncate_to_micros(OffsetDateTime::now_utc());
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn store(&mut self, entity: Entity) -> Entity {
        let stamp = self.stamp();
        let entity = entity.with_updated_at(stamp);
        self.entities.insert(entity.key().clone(), entity.clone());
        entity
    }
}

pub(crate) fn truncate_to_micros(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(at.nanosecond() / 1_000 * 1_000)
        .unwrap_or(at)
}

#[derive(Default)]
pub struct MemoryEntityStore {
    state: RwLock<State>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn allocate_id(&self, kind: &str) -> Result<i64, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "allocate_id");
        let next = state.next_ids.entry(kind.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<Entity>, RepoError> {
        Ok(rw_read(&self.state, SOURCE, "get").entities.get(key).cloned())
    }

    async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "get_many");
        Ok(keys
            .iter()
            .filter_map(|key| state.entities.get(key).cloned())
            .collect())
    }

    async fn put(&self, entity: Entity) -> Result<Entity, RepoError> {
        Ok(rw_write(&self.state, SOURCE, "put").store(entity))
    }

    async fn put_many(&self, entities: Vec<Entity>) -> Result<Vec<Entity>, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "put_many");
        Ok(entities
            .into_iter()
            .map(|entity| state.store(entity))
            .collect())
    }

    async fn delete(&self, key: &EntityKey) -> Result<(), RepoError> {
        rw_write(&self.state, SOURCE, "delete")
            .entities
            .remove(key);
        Ok(())
    }

    async fn query(&self, query: &EntityQuery) -> Result<Vec<Entity>, RepoError> {
        let mut matched: Vec<Entity> = rw_read(&self.state, SOURCE, "query")
            .entities
            .values()
            .filter(|entity| query.matches(entity))
            .cloned()
            .collect();

        match query.order {
            QueryOrder::UpdatedDesc => matched.sort_by_key(|entity| {
                (Reverse(entity.updated_at()), entity.key().urlsafe())
            }),
            QueryOrder::KeyAsc => matched.sort_by(|a, b| a.key().cmp(b.key())),
        }

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}
