//! Invalidation cascade.
//!
//! Writing or deleting an entity re-persists every entity whose cached
//! renders depend on it, which advances their freshness tokens. Dependents are
//! the parent in the key hierarchy plus the references named by the kind's
//! cache-break declaration.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::debug;

use super::config::CascadeConfig;
use crate::application::repos::{EntityStore, RepoError};
use crate::domain::entity::{Entity, EntityKey};
use crate::domain::schema::{SchemaError, SchemaRegistry};

const METRIC_CASCADE_TOUCH_TOTAL: &str = "matryoshka_cascade_touch_total";

#[derive(Debug, Error)]
pub enum CascadeError {
    /// A declared cache-break attribute is missing or not a reference.
    #[error("cache-break configuration error: {0}")]
    Configuration(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] RepoError),
}

/// Keys already written during one top-level operation.
///
/// Seed it with the keys being written so a cascade never touches them, then
/// pass the same set through every cascade the operation triggers.
#[derive(Debug, Clone, Default)]
pub struct TouchSet {
    keys: HashSet<EntityKey>,
}

impl TouchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded<'a>(keys: impl IntoIterator<Item = &'a EntityKey>) -> Self {
        Self {
            keys: keys.into_iter().cloned().collect(),
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.keys.contains(key)
    }

    /// Returns `true` when `key` was not in the set yet.
    pub fn insert(&mut self, key: EntityKey) -> bool {
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Collects and touches the dependents of a written entity.
///
/// The touch is a plain read followed by a batch re-write of what was read.
/// It is not transactional: a concurrent write to a dependent that lands
/// between the fetch and the touch is overwritten with the fetched snapshot.
/// Callers accept that trade of consistency for cache freshness.
pub struct InvalidationCascade {
    schemas: Arc<SchemaRegistry>,
    config: CascadeConfig,
}

impl InvalidationCascade {
    pub fn new(schemas: Arc<SchemaRegistry>, config: CascadeConfig) -> Self {
        Self { schemas, config }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Whether writes of `kind` need the stored entity to find dependents.
    pub fn reads_references(&self, kind: &str) -> bool {
        self.schemas
            .get(kind)
            .is_some_and(|schema| !schema.dependencies().is_empty())
    }

    /// Direct dependents of `key`: its parent, then each declared reference
    /// held by `entity`, deduplicated in that order.
    ///
    /// Declarations are validated even when `entity` is absent, so a broken
    /// declaration fails every write of the kind rather than only some.
    pub fn dependents_of(
        &self,
        key: &EntityKey,
        entity: Option<&Entity>,
    ) -> Result<Vec<EntityKey>, SchemaError> {
        let mut dependents: Vec<EntityKey> = key.parent().cloned().into_iter().collect();

        let Some(schema) = self.schemas.get(key.kind()) else {
            return Ok(dependents);
        };

        for attribute in schema.dependencies() {
            schema.resolve_reference(attribute)?;
            let reference = entity.and_then(|entity| entity.reference(attribute));
            if let Some(reference) = reference {
                if !dependents.contains(reference) {
                    dependents.push(reference.clone());
                }
            }
        }

        Ok(dependents)
    }

    /// Touch the dependents of `key` and return how many were re-persisted.
    ///
    /// `entity` is the state being written; pass `None` on delete and the
    /// stored entity is fetched when the kind declares references. Dependents
    /// that no longer exist are skipped. Keys already in `touched` are never
    /// written again, and every key this call writes is added to it.
    pub async fn break_cache(
        &self,
        store: &dyn EntityStore,
        key: &EntityKey,
        entity: Option<&Entity>,
        touched: &mut TouchSet,
    ) -> Result<usize, CascadeError> {
        if self.config.max_depth == 0 {
            // Declarations are still enforced when nothing gets touched.
            self.dependents_of(key, entity)?;
            return Ok(0);
        }

        let stored;
        let entity = match entity {
            Some(entity) => Some(entity),
            None if self.reads_references(key.kind()) => {
                stored = store.get(key).await?;
                stored.as_ref()
            }
            None => None,
        };

        let mut frontier: Vec<EntityKey> = self
            .dependents_of(key, entity)?
            .into_iter()
            .filter(|dependent| touched.insert(dependent.clone()))
            .collect();

        let mut depth = 1;
        let mut total = 0;
        while !frontier.is_empty() {
            let found = store.get_many(&frontier).await?;

            // Collect the next hop before writing so a configuration error
            // there leaves this hop untouched.
            let mut next = Vec::new();
            if depth < self.config.max_depth {
                for dependent in &found {
                    for key in self.dependents_of(dependent.key(), Some(dependent))? {
                        if touched.insert(key.clone()) {
                            next.push(key);
                        }
                    }
                }
            }

            let count = found.len();
            if count > 0 {
                store.put_many(found).await?;
                counter!(METRIC_CASCADE_TOUCH_TOTAL).increment(count as u64);
            }
            debug!(
                cascade = "touch",
                kind = key.kind(),
                key = %key,
                depth,
                requested = frontier.len(),
                touched = count,
            );

            total += count;
            frontier = next;
            depth += 1;
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::{FieldType, KindSchema};
    use crate::infra::memory::MemoryEntityStore;

    fn blog() -> EntityKey {
        EntityKey::named("Blog", "main")
    }

    fn registry(post: KindSchema) -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new()
                .with(KindSchema::new("Blog").field("name", FieldType::Text))
                .with(post),
        )
    }

    fn post_schema() -> KindSchema {
        KindSchema::new("Post")
            .field("blog", FieldType::key_of("Blog"))
            .field("title", FieldType::Text)
    }

    fn cascade(post: KindSchema) -> InvalidationCascade {
        InvalidationCascade::new(registry(post), CascadeConfig::default())
    }

    #[test]
    fn parent_comes_first_and_duplicates_collapse() {
        let cascade = cascade(post_schema().depends_on("blog"));
        let key = EntityKey::numeric("Post", 1).with_parent(blog());
        let post = Entity::new(key.clone()).with_field("blog", blog());

        let dependents = cascade.dependents_of(&key, Some(&post)).unwrap();
        assert_eq!(dependents, vec![blog()]);
    }

    #[test]
    fn undeclared_reference_is_not_a_dependent() {
        let cascade = cascade(post_schema());
        let key = EntityKey::numeric("Post", 1);
        let post = Entity::new(key.clone()).with_field("blog", blog());

        assert!(cascade.dependents_of(&key, Some(&post)).unwrap().is_empty());
    }

    #[test]
    fn null_reference_is_skipped() {
        let cascade = cascade(post_schema().depends_on("blog"));
        let key = EntityKey::numeric("Post", 1);
        let post = Entity::new(key.clone()).with_field("blog", None::<EntityKey>);

        assert!(cascade.dependents_of(&key, Some(&post)).unwrap().is_empty());
    }

    #[test]
    fn unregistered_kind_cascades_to_parent_only() {
        let cascade = cascade(post_schema());
        let key = EntityKey::numeric("Comment", 9).with_parent(blog());

        assert_eq!(cascade.dependents_of(&key, None).unwrap(), vec![blog()]);
    }

    #[test]
    fn broken_declaration_fails_without_an_entity() {
        let cascade = cascade(post_schema().depends_on("title"));
        let key = EntityKey::numeric("Post", 1);

        let err = cascade.dependents_of(&key, None).unwrap_err();
        assert!(matches!(err, SchemaError::NotAReference { .. }));
    }

    #[tokio::test]
    async fn touch_advances_dependent_and_skips_dangling() {
        let store = MemoryEntityStore::new();
        let stored_blog = store
            .put(Entity::new(blog()).with_field("name", "main"))
            .await
            .unwrap();

        let cascade = cascade(
            post_schema()
                .field("editor", FieldType::key_of("User"))
                .depends_on("blog")
                .depends_on("editor"),
        );
        let key = EntityKey::numeric("Post", 1);
        let post = Entity::new(key.clone())
            .with_field("blog", blog())
            .with_field("editor", EntityKey::named("User", "gone"));

        let mut touched = TouchSet::seeded([&key]);
        let count = cascade
            .break_cache(&store, &key, Some(&post), &mut touched)
            .await
            .unwrap();

        assert_eq!(count, 1);
        let after = store.get(&blog()).await.unwrap().unwrap();
        assert!(after.updated_at() > stored_blog.updated_at());
        assert_eq!(after.fields(), stored_blog.fields());
    }

    #[tokio::test]
    async fn touched_keys_are_not_written_twice() {
        let store = MemoryEntityStore::new();
        store.put(Entity::new(blog())).await.unwrap();
        let cascade = cascade(post_schema().depends_on("blog"));

        let key = EntityKey::numeric("Post", 1);
        let post = Entity::new(key.clone()).with_field("blog", blog());
        let mut touched = TouchSet::seeded([&key]);

        let first = cascade
            .break_cache(&store, &key, Some(&post), &mut touched)
            .await
            .unwrap();
        let second = cascade
            .break_cache(&store, &key, Some(&post), &mut touched)
            .await
            .unwrap();

        assert_eq!((first, second), (1, 0));
        assert!(touched.contains(&blog()));
    }

    #[tokio::test]
    async fn depth_bounds_transitive_touches() {
        let store = MemoryEntityStore::new();
        let site = EntityKey::named("Site", "root");
        let site_before = store.put(Entity::new(site.clone())).await.unwrap();
        store
            .put(Entity::new(blog()).with_field("site", site.clone()))
            .await
            .unwrap();

        let schemas = Arc::new(
            SchemaRegistry::new()
                .with(
                    KindSchema::new("Blog")
                        .field("site", FieldType::key_of("Site"))
                        .depends_on("site"),
                )
                .with(post_schema().depends_on("blog")),
        );
        let key = EntityKey::numeric("Post", 1);
        let post = Entity::new(key.clone()).with_field("blog", blog());

        let one_hop = InvalidationCascade::new(schemas.clone(), CascadeConfig::default());
        one_hop
            .break_cache(&store, &key, Some(&post), &mut TouchSet::seeded([&key]))
            .await
            .unwrap();
        let site_after_one = store.get(&site).await.unwrap().unwrap();
        assert_eq!(site_after_one.updated_at(), site_before.updated_at());

        let two_hops = InvalidationCascade::new(schemas, CascadeConfig { max_depth: 2 });
        let count = two_hops
            .break_cache(&store, &key, Some(&post), &mut TouchSet::seeded([&key]))
            .await
            .unwrap();
        assert_eq!(count, 2);
        let site_after_two = store.get(&site).await.unwrap().unwrap();
        assert!(site_after_two.updated_at() > site_before.updated_at());
    }

    #[tokio::test]
    async fn zero_depth_disables_cascade() {
        let store = MemoryEntityStore::new();
        let before = store.put(Entity::new(blog())).await.unwrap();
        let cascade = InvalidationCascade::new(
            registry(post_schema().depends_on("blog")),
            CascadeConfig { max_depth: 0 },
        );
        let key = EntityKey::numeric("Post", 1).with_parent(blog());
        let post = Entity::new(key.clone()).with_field("blog", blog());

        let count = cascade
            .break_cache(&store, &key, Some(&post), &mut TouchSet::new())
            .await
            .unwrap();
        assert_eq!(count, 0);
        let after = store.get(&blog()).await.unwrap().unwrap();
        assert_eq!(after.updated_at(), before.updated_at());
    }

    #[tokio::test]
    async fn zero_depth_still_rejects_broken_declaration() {
        let store = MemoryEntityStore::new();
        let cascade = InvalidationCascade::new(
            registry(post_schema().depends_on("title")),
            CascadeConfig { max_depth: 0 },
        );
        let key = EntityKey::numeric("Post", 1);

        let err = cascade
            .break_cache(&store, &key, None, &mut TouchSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CascadeError::Configuration(SchemaError::NotAReference { .. })
        ));
    }
}
