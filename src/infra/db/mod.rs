//! Postgres-backed entity store.

mod util;

pub use util::map_sqlx_error;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    Postgres, QueryBuilder, Transaction,
    migrate::MigrateError,
    postgres::{PgPool, PgPoolOptions},
    query, query_as, query_scalar,
    types::Json,
};
use time::OffsetDateTime;

use crate::application::repos::{EntityQuery, EntityStore, QueryOrder, RepoError};
use crate::domain::entity::{Entity, EntityKey, FieldValue};

const SELECT_ENTITY: &str = "SELECT key, fields, updated_at FROM entities";

// A re-put inside the same microsecond still moves `updated_at` forward.
const UPSERT_ENTITY: &str = r#"
    INSERT INTO entities (key, kind, parent, fields, updated_at)
    VALUES ($1, $2, $3, $4, clock_timestamp())
    ON CONFLICT (key) DO UPDATE
    SET fields = EXCLUDED.fields,
        updated_at = GREATEST(clock_timestamp(), entities.updated_at + INTERVAL '1 microsecond')
    RETURNING updated_at
"#;

#[derive(sqlx::FromRow)]
struct EntityRow {
    key: String,
    fields: Json<BTreeMap<String, FieldValue>>,
    updated_at: OffsetDateTime,
}

impl TryFrom<EntityRow> for Entity {
    type Error = RepoError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        let key = EntityKey::from_urlsafe(&row.key).map_err(|err| RepoError::Integrity {
            message: format!("stored key `{}` is invalid: {err}", row.key),
        })?;
        Ok(Entity::from_parts(key, row.updated_at, row.fields.0))
    }
}

#[derive(Clone)]
pub struct PostgresEntityStore {
    pool: Arc<PgPool>,
}

impl PostgresEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }

    async fn upsert<'e, E>(executor: E, entity: Entity) -> Result<Entity, RepoError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let key = entity.key();
        let stamped: OffsetDateTime = query_scalar(UPSERT_ENTITY)
            .bind(key.urlsafe())
            .bind(key.kind().to_string())
            .bind(key.parent().map(EntityKey::urlsafe))
            .bind(Json(entity.fields().clone()))
            .fetch_one(executor)
            .await
            .map_err(map_sqlx_error)?;

        Ok(entity.with_updated_at(stamped))
    }

    fn rows_to_entities(rows: Vec<EntityRow>) -> Result<Vec<Entity>, RepoError> {
        rows.into_iter().map(Entity::try_from).collect()
    }
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    async fn allocate_id(&self, _kind: &str) -> Result<i64, RepoError> {
        query_scalar::<_, i64>("SELECT nextval('entity_ids')")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<Entity>, RepoError> {
        let row: Option<EntityRow> = query_as(&format!("{SELECT_ENTITY} WHERE key = $1"))
            .bind(key.urlsafe())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(Entity::try_from).transpose()
    }

    async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, RepoError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let encoded: Vec<String> = keys.iter().map(EntityKey::urlsafe).collect();
        let rows: Vec<EntityRow> = query_as(&format!("{SELECT_ENTITY} WHERE key = ANY($1)"))
            .bind(&encoded)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let mut by_key: HashMap<String, EntityRow> =
            rows.into_iter().map(|row| (row.key.clone(), row)).collect();
        let ordered: Vec<EntityRow> = encoded
            .iter()
            .filter_map(|key| by_key.remove(key))
            .collect();
        Self::rows_to_entities(ordered)
    }

    async fn put(&self, entity: Entity) -> Result<Entity, RepoError> {
        Self::upsert(self.pool(), entity).await
    }

    async fn put_many(&self, entities: Vec<Entity>) -> Result<Vec<Entity>, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let mut stored = Vec::with_capacity(entities.len());
        for entity in entities {
            stored.push(Self::upsert(&mut *tx, entity).await?);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(stored)
    }

    async fn delete(&self, key: &EntityKey) -> Result<(), RepoError> {
        query("DELETE FROM entities WHERE key = $1")
            .bind(key.urlsafe())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn query(&self, filter: &EntityQuery) -> Result<Vec<Entity>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_ENTITY);
        qb.push(" WHERE kind = ");
        qb.push_bind(filter.kind.clone());

        if let Some((attribute, value)) = filter.filter.as_ref() {
            qb.push(" AND fields -> ");
            qb.push_bind(attribute.clone());
            qb.push(" = ");
            qb.push_bind(Json(value.clone()));
        }

        // Stored keys are encoded text, so key order is applied after decoding.
        let ordered_in_sql = filter.order == QueryOrder::UpdatedDesc;
        if ordered_in_sql {
            qb.push(" ORDER BY updated_at DESC, key ASC");
        }

        if let Some(limit) = filter.limit.filter(|_| ordered_in_sql) {
            let limit = i64::try_from(limit)
                .map_err(|_| RepoError::invalid_input("query limit exceeds supported range"))?;
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }

        let rows: Vec<EntityRow> = qb
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        let mut entities = Self::rows_to_entities(rows)?;

        if !ordered_in_sql {
            entities.sort_by(|a, b| a.key().cmp(b.key()));
            if let Some(limit) = filter.limit {
                entities.truncate(limit);
            }
        }
        Ok(entities)
    }
}
