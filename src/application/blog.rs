//! Blog demo service: one blog with posts that declare a cache break on it.

use serde::Deserialize;
use tracing::{info, instrument};

use crate::application::{
    error::AppError,
    repos::{EntityQuery, QueryOrder},
    store::CascadingStore,
};
use crate::domain::entity::{Entity, EntityKey};

pub const BLOG_KIND: &str = "Blog";
pub const POST_KIND: &str = "Post";

const UPDATED_SUFFIX: &str = " *UPDATED*";

/// Demo content loaded from `demo/seed.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Seed {
    pub blog: SeedBlog,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedBlog {
    pub name: String,
    #[serde(default)]
    pub posts: Vec<SeedPost>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedPost {
    pub title: String,
    pub body: String,
}

impl Seed {
    pub fn parse(source: &str) -> Result<Self, AppError> {
        toml::from_str(source).map_err(|err| AppError::validation(format!("invalid seed: {err}")))
    }

    /// The seed shipped with the binary.
    pub fn builtin() -> Result<Self, AppError> {
        Self::parse(include_str!("../../demo/seed.toml"))
    }
}

/// A blog and its posts, most recently written first.
#[derive(Debug, Clone)]
pub struct BlogPage {
    pub blog: Entity,
    pub posts: Vec<Entity>,
}

#[derive(Clone)]
pub struct BlogService {
    store: CascadingStore,
}

impl BlogService {
    pub fn new(store: CascadingStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CascadingStore {
        &self.store
    }

    pub fn blog_key(name: &str) -> EntityKey {
        EntityKey::named(BLOG_KIND, name)
    }

    /// Load the blog called `name`. Returns `None` until it has been populated.
    pub async fn index(&self, name: &str) -> Result<Option<BlogPage>, AppError> {
        let key = Self::blog_key(name);
        let Some(blog) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let query = EntityQuery::kind(POST_KIND)
            .filter("blog", key)
            .order(QueryOrder::UpdatedDesc);
        let posts = self.store.query(&query).await?;

        Ok(Some(BlogPage { blog, posts }))
    }

    /// Create the seed blog if missing and add one post per seed post.
    /// Returns the number of posts written.
    #[instrument(skip(self, seed), fields(blog = %seed.blog.name))]
    pub async fn populate(&self, seed: &Seed) -> Result<usize, AppError> {
        let name = seed.blog.name.trim();
        if name.is_empty() {
            return Err(AppError::validation("seed blog name must not be empty"));
        }

        let key = Self::blog_key(name);
        if self.store.get(&key).await?.is_none() {
            let blog = Entity::new(key.clone()).with_field("name", name);
            self.store.put(blog).await?;
        }

        let mut posts = Vec::with_capacity(seed.blog.posts.len());
        for post in &seed.blog.posts {
            let id = self.store.allocate_id(POST_KIND).await?;
            posts.push(
                Entity::new(EntityKey::numeric(POST_KIND, id))
                    .with_field("blog", key.clone())
                    .with_field("title", post.title.as_str())
                    .with_field("body", post.body.as_str()),
            );
        }

        let written = self.store.put_many(posts).await?.len();
        info!(written, "populated blog");
        Ok(written)
    }

    /// Append a marker to the title of the first post in key order.
    #[instrument(skip(self))]
    pub async fn update_first_post(&self) -> Result<Option<Entity>, AppError> {
        let Some(mut post) = self.first_post().await? else {
            return Ok(None);
        };

        let title = format!("{}{UPDATED_SUFFIX}", post.text("title").unwrap_or_default());
        post.set("title", title);
        let post = self.store.put(post).await?;
        info!(key = %post.key(), "updated post");
        Ok(Some(post))
    }

    #[instrument(skip(self))]
    pub async fn delete_first_post(&self) -> Result<Option<EntityKey>, AppError> {
        let Some(post) = self.first_post().await? else {
            return Ok(None);
        };

        let key = post.key().clone();
        self.store.delete(&key).await?;
        info!(key = %key, "deleted post");
        Ok(Some(key))
    }

    async fn first_post(&self) -> Result<Option<Entity>, AppError> {
        let query = EntityQuery::kind(POST_KIND)
            .order(QueryOrder::KeyAsc)
            .limit(1);
        Ok(self.store.query(&query).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::{CascadeConfig, FreshnessToken, InvalidationCascade};
    use crate::domain::schema::{FieldType, KindSchema, SchemaRegistry};
    use crate::infra::memory::MemoryEntityStore;

    fn service() -> BlogService {
        let schemas = SchemaRegistry::new()
            .with(KindSchema::new(BLOG_KIND).field("name", FieldType::Text))
            .with(
                KindSchema::new(POST_KIND)
                    .field("blog", FieldType::key_of(BLOG_KIND))
                    .field("title", FieldType::Text)
                    .field("body", FieldType::Text)
                    .depends_on("blog"),
            );
        let cascade = InvalidationCascade::new(Arc::new(schemas), CascadeConfig::default());
        let store = CascadingStore::new(Arc::new(MemoryEntityStore::new()), Arc::new(cascade));
        BlogService::new(store)
    }

    fn seed() -> Seed {
        Seed::parse(
            r#"
            [blog]
            name = "main"

            [[blog.posts]]
            title = "one"
            body = "first"

            [[blog.posts]]
            title = "two"
            body = "second"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn builtin_seed_parses() {
        let seed = Seed::builtin().unwrap();
        assert_eq!(seed.blog.name, "main");
        assert!(!seed.blog.posts.is_empty());
    }

    #[tokio::test]
    async fn index_is_empty_before_populate() {
        assert!(service().index("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn populate_creates_blog_and_posts() {
        let service = service();
        assert_eq!(service.populate(&seed()).await.unwrap(), 2);

        let page = service.index("main").await.unwrap().unwrap();
        assert_eq!(page.blog.text("name"), Some("main"));
        assert_eq!(page.posts.len(), 2);
        assert!(
            page.posts
                .iter()
                .all(|post| post.reference("blog") == Some(page.blog.key()))
        );
    }

    #[tokio::test]
    async fn update_marks_first_post_and_advances_blog_token() {
        let service = service();
        service.populate(&seed()).await.unwrap();
        let before = service.index("main").await.unwrap().unwrap();

        let updated = service.update_first_post().await.unwrap().unwrap();
        let title = updated.text("title").unwrap();
        assert!(title == "one *UPDATED*" || title == "two *UPDATED*");

        let after = service.index("main").await.unwrap().unwrap();
        assert_ne!(
            FreshnessToken::compute(&before.blog),
            FreshnessToken::compute(&after.blog)
        );
        assert_eq!(after.posts[0].key(), updated.key());
    }

    #[tokio::test]
    async fn delete_removes_first_post_and_advances_blog_token() {
        let service = service();
        service.populate(&seed()).await.unwrap();
        let before = service.index("main").await.unwrap().unwrap();

        let deleted = service.delete_first_post().await.unwrap().unwrap();

        let after = service.index("main").await.unwrap().unwrap();
        assert_eq!(after.posts.len(), 1);
        assert!(after.posts.iter().all(|post| post.key() != &deleted));
        assert!(after.blog.updated_at() > before.blog.updated_at());
    }

    #[tokio::test]
    async fn first_post_is_lowest_numeric_id_past_nine() {
        let service = service();
        let posts = (1..=12)
            .map(|n| SeedPost {
                title: format!("post {n}"),
                body: String::new(),
            })
            .collect();
        let seed = Seed {
            blog: SeedBlog {
                name: "main".to_string(),
                posts,
            },
        };
        service.populate(&seed).await.unwrap();

        let updated = service.update_first_post().await.unwrap().unwrap();
        assert_eq!(updated.key(), &EntityKey::numeric(POST_KIND, 1));
        assert_eq!(updated.text("title"), Some("post 1 *UPDATED*"));

        let deleted = service.delete_first_post().await.unwrap().unwrap();
        assert_eq!(deleted, EntityKey::numeric(POST_KIND, 1));
        let next = service.update_first_post().await.unwrap().unwrap();
        assert_eq!(next.key(), &EntityKey::numeric(POST_KIND, 2));
    }

    #[tokio::test]
    async fn update_and_delete_without_posts_are_noops() {
        let service = service();
        assert!(service.update_first_post().await.unwrap().is_none());
        assert!(service.delete_first_post().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_seed_name_is_rejected() {
        let seed = Seed::parse("[blog]\nname = \" \"\n").unwrap();
        let err = service().populate(&seed).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
