//! Write cascades through the cascading store, with kinds declared the way
//! configuration declares them.

use std::sync::Arc;

use matryoshka::application::store::CascadingStore;
use matryoshka::cache::{CascadeConfig, CascadeError, FreshnessToken, InvalidationCascade};
use matryoshka::domain::entity::{Entity, EntityKey};
use matryoshka::domain::schema::{KindDeclaration, SchemaError, SchemaRegistry};
use matryoshka::infra::memory::MemoryEntityStore;
use serde::Deserialize;

#[derive(Deserialize)]
struct Declarations {
    kinds: Vec<KindDeclaration>,
}

fn store_for(config: &str) -> CascadingStore {
    store_with_depth(config, CascadeConfig::default().max_depth)
}

fn store_with_depth(config: &str, max_depth: usize) -> CascadingStore {
    let declarations: Declarations = toml::from_str(config).expect("kind declarations parse");
    let schemas = SchemaRegistry::from_declarations(&declarations.kinds);
    let cascade = InvalidationCascade::new(Arc::new(schemas), CascadeConfig { max_depth });
    CascadingStore::new(Arc::new(MemoryEntityStore::new()), Arc::new(cascade))
}

const DECLARED: &str = r#"
[[kinds]]
name = "Blog"
fields = { name = "text" }

[[kinds]]
name = "Post"
fields = { blog = "key:Blog", title = "text" }
cache_break = "blog"
"#;

const UNDECLARED: &str = r#"
[[kinds]]
name = "Blog"
fields = { name = "text" }

[[kinds]]
name = "Post"
fields = { blog = "key:Blog", title = "text" }
"#;

fn blog_key() -> EntityKey {
    EntityKey::named("Blog", "main")
}

async fn seed_blog(store: &CascadingStore) -> Entity {
    store
        .put(Entity::new(blog_key()).with_field("name", "main"))
        .await
        .expect("blog stored")
}

fn post(id: i64, blog: EntityKey) -> Entity {
    Entity::new(EntityKey::numeric("Post", id))
        .with_field("blog", blog)
        .with_field("title", "hello")
}

async fn blog_token(store: &CascadingStore) -> FreshnessToken {
    let blog = store
        .get(&blog_key())
        .await
        .expect("blog read")
        .expect("blog exists");
    FreshnessToken::compute(&blog)
}

#[tokio::test]
async fn declared_post_write_advances_blog_token() {
    let store = store_for(DECLARED);
    seed_blog(&store).await;
    let before = blog_token(&store).await;

    store.put(post(1, blog_key())).await.expect("post stored");

    assert_ne!(blog_token(&store).await, before);
}

#[tokio::test]
async fn undeclared_post_write_leaves_blog_token() {
    let store = store_for(UNDECLARED);
    seed_blog(&store).await;
    let before = blog_token(&store).await;

    store.put(post(1, blog_key())).await.expect("post stored");

    assert_eq!(blog_token(&store).await, before);
}

#[tokio::test]
async fn nested_declaration_behaves_like_flat() {
    let store = store_for(
        r#"
        [[kinds]]
        name = "Post"
        fields = { blog = "key:Blog" }
        cascade = { cache_break = ["blog"] }
        "#,
    );
    seed_blog(&store).await;
    let before = blog_token(&store).await;

    store.put(post(1, blog_key())).await.expect("post stored");

    assert_ne!(blog_token(&store).await, before);
}

#[tokio::test]
async fn non_reference_declaration_aborts_the_write() {
    let store = store_for(
        r#"
        [[kinds]]
        name = "Post"
        fields = { blog = "key:Blog", title = "text" }
        cache_break = ["blog", "title"]
        "#,
    );
    seed_blog(&store).await;
    let before = blog_token(&store).await;

    let err = store
        .put(post(1, blog_key()))
        .await
        .expect_err("title is not a reference");

    assert!(matches!(
        err,
        CascadeError::Configuration(SchemaError::NotAReference { .. })
    ));
    assert!(
        store
            .get(&EntityKey::numeric("Post", 1))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(blog_token(&store).await, before);
}

#[tokio::test]
async fn disabled_cascade_still_aborts_on_broken_declaration() {
    let store = store_with_depth(
        r#"
        [[kinds]]
        name = "Post"
        fields = { blog = "key:Blog", title = "text" }
        cache_break = "title"
        "#,
        0,
    );

    let err = store
        .put(post(1, blog_key()))
        .await
        .expect_err("title is not a reference");

    assert!(matches!(
        err,
        CascadeError::Configuration(SchemaError::NotAReference { .. })
    ));
    assert!(
        store
            .get(&EntityKey::numeric("Post", 1))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn undefined_declaration_aborts_the_write() {
    let store = store_for(
        r#"
        [[kinds]]
        name = "Post"
        fields = { title = "text" }
        cache_break = "owner"
        "#,
    );

    let err = store
        .put(Entity::new(EntityKey::numeric("Post", 1)).with_field("title", "x"))
        .await
        .expect_err("owner is not defined");

    assert!(matches!(
        err,
        CascadeError::Configuration(SchemaError::UnknownAttribute { .. })
    ));
}

#[tokio::test]
async fn deleting_a_post_advances_blog_token() {
    let store = store_for(DECLARED);
    seed_blog(&store).await;
    let stored = store.put(post(1, blog_key())).await.expect("post stored");
    let before = blog_token(&store).await;

    store.delete(stored.key()).await.expect("post deleted");

    assert_ne!(blog_token(&store).await, before);
    assert!(store.get(stored.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn dangling_reference_is_skipped() {
    let store = store_for(DECLARED);

    let stored = store
        .put(post(1, EntityKey::named("Blog", "gone")))
        .await
        .expect("write succeeds without the blog");

    assert!(store.get(stored.key()).await.unwrap().is_some());
    assert!(
        store
            .get(&EntityKey::named("Blog", "gone"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn parent_is_touched_without_any_declaration() {
    let store = store_for(UNDECLARED);
    seed_blog(&store).await;
    let before = blog_token(&store).await;

    let child = Entity::new(EntityKey::numeric("Note", 1).with_parent(blog_key()));
    store.put(child).await.expect("child stored");

    assert_ne!(blog_token(&store).await, before);
}
