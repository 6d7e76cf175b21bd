//! PostgreSQL implementation of CoordinationStore
//!
//! Claims are a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)
//! RETURNING` statement, so concurrent claimers never block on each other and
//! never receive the same row. Releases and deletes carry the lease fingerprint
//! in their `WHERE` clause and report the affected row count.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;

/// Rows per batch insert statement, well under the bind parameter limit
const INSERT_CHUNK: usize = 1000;

/// PostgreSQL implementation of CoordinationStore
///
/// # Example
///
/// ```ignore
/// use lockstep::PostgresCoordinationStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresCoordinationStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresCoordinationStore {
    pool: PgPool,
}

impl PostgresCoordinationStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;
        info!("lockstep schema is up to date");
        Ok(())
    }
}

fn database_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", operation, e);
        StoreError::Database(e.to_string())
    }
}

fn row_to_item(row: &PgRow) -> WorkItem {
    WorkItem {
        id: row.get("id"),
        label: row.get("label"),
        value: row.get("value"),
        priority: row.get::<i32, _>("priority").max(0) as u32,
        owner_tag: row.get("owner_tag"),
        lock_holder: row.get("lock_holder"),
        lock_expires_at: row.get("lock_expires_at"),
    }
}

fn row_to_resource(row: &PgRow) -> ResourceRecord {
    ResourceRecord {
        id: row.get("id"),
        value: row.get("value"),
        owner_pool_id: row.get("owner_pool_id"),
    }
}

fn row_to_membership(row: &PgRow) -> PoolMembership {
    PoolMembership {
        pool_id: row.get("pool_id"),
        created_at: row.get("created_at"),
        last_renewed_at: row.get("last_renewed_at"),
        expires_at: row.get("expires_at"),
    }
}

#[async_trait]
impl CoordinationStore for PostgresCoordinationStore {
    // =========================================================================
    // Work queue operations
    // =========================================================================

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn insert_items(
        &self,
        queue: &str,
        items: Vec<NewWorkItem>,
    ) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        if let Some(item) = items.iter().find(|item| item.priority > MAX_PRIORITY) {
            return Err(StoreError::Integrity(format!(
                "priority {} of label '{}' exceeds {}",
                item.priority, item.label, MAX_PRIORITY
            )));
        }

        let total = items.len();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database_error("begin insert transaction"))?;

        let mut rows = items.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<NewWorkItem> = rows.by_ref().take(INSERT_CHUNK).collect();
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO lockstep_work_items (id, queue_name, label, value, priority, owner_tag) ",
            );
            builder.push_values(chunk, |mut b, item| {
                b.push_bind(Uuid::now_v7())
                    .push_bind(queue)
                    .push_bind(item.label)
                    .push_bind(item.value)
                    .push_bind(item.priority as i32)
                    .push_bind(item.owner_tag);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(database_error("insert work items"))?;
        }

        tx.commit()
            .await
            .map_err(database_error("commit work items"))?;

        debug!(queue, count = total, "inserted work items");
        Ok(total)
    }

    #[instrument(skip(self))]
    async fn count_items(&self, queue: &str, filter: &ItemFilter) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM lockstep_work_items
            WHERE queue_name = $1
              AND ($2::text IS NULL OR label = $2)
              AND ($3::text IS NULL OR owner_tag = $3)
            "#,
        )
        .bind(queue)
        .bind(filter.label.as_deref())
        .bind(filter.owner_tag.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("count work items"))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn claim_item(
        &self,
        queue: &str,
        claimant: &str,
        labels: &[String],
        lease: Duration,
    ) -> Result<Option<WorkItem>, StoreError> {
        // SKIP LOCKED lets concurrent claimers pass over a row another
        // transaction is taking instead of waiting for it
        let row = sqlx::query(
            r#"
            UPDATE lockstep_work_items t
            SET lock_holder = $3,
                lock_expires_at = NOW() + make_interval(secs => $4)
            WHERE t.id = (
                SELECT id
                FROM lockstep_work_items
                WHERE queue_name = $1
                  AND (cardinality($2::text[]) = 0 OR label = ANY($2))
                  AND lock_expires_at <= NOW()
                ORDER BY priority, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING t.id, t.label, t.value, t.priority, t.owner_tag,
                      t.lock_holder, t.lock_expires_at
            "#,
        )
        .bind(queue)
        .bind(labels)
        .bind(claimant)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("claim work item"))?;

        let item = row.as_ref().map(row_to_item);
        if let Some(item) = &item {
            debug!(queue, claimant, item_id = %item.id, label = %item.label, "claimed work item");
        }
        Ok(item)
    }

    #[instrument(skip(self, fingerprint), fields(item_id = %fingerprint.id))]
    async fn release_item(
        &self,
        queue: &str,
        fingerprint: &LeaseFingerprint,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lockstep_work_items
            SET lock_holder = NULL,
                lock_expires_at = 'epoch'
            WHERE queue_name = $1
              AND id = $2
              AND lock_holder IS NOT DISTINCT FROM $3
              AND lock_expires_at = $4
            "#,
        )
        .bind(queue)
        .bind(fingerprint.id)
        .bind(fingerprint.lock_holder.as_deref())
        .bind(fingerprint.lock_expires_at)
        .execute(&self.pool)
        .await
        .map_err(database_error("release work item"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, fingerprint), fields(item_id = %fingerprint.id))]
    async fn delete_item(
        &self,
        queue: &str,
        fingerprint: &LeaseFingerprint,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM lockstep_work_items
            WHERE queue_name = $1
              AND id = $2
              AND lock_holder IS NOT DISTINCT FROM $3
              AND lock_expires_at = $4
            "#,
        )
        .bind(queue)
        .bind(fingerprint.id)
        .bind(fingerprint.lock_holder.as_deref())
        .bind(fingerprint.lock_expires_at)
        .execute(&self.pool)
        .await
        .map_err(database_error("delete work item"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn drop_queue(&self, queue: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM lockstep_work_items WHERE queue_name = $1")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(database_error("drop queue"))?;

        info!(queue, removed = result.rows_affected(), "dropped queue");
        Ok(())
    }

    // =========================================================================
    // Pool membership operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn upsert_membership(
        &self,
        pool: &str,
        pool_id: &str,
        ttl: Duration,
    ) -> Result<PoolMembership, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO lockstep_pool_members
                (pool_name, pool_id, created_at, last_renewed_at, expires_at)
            VALUES ($1, $2, NOW(), NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (pool_name, pool_id) DO UPDATE
            SET created_at = NOW(),
                last_renewed_at = NOW(),
                expires_at = EXCLUDED.expires_at
            RETURNING pool_id, created_at, last_renewed_at, expires_at
            "#,
        )
        .bind(pool)
        .bind(pool_id)
        .bind(ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("upsert pool membership"))?;

        Ok(row_to_membership(&row))
    }

    #[instrument(skip(self))]
    async fn renew_membership(
        &self,
        pool: &str,
        pool_id: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lockstep_pool_members
            SET last_renewed_at = NOW(),
                expires_at = NOW() + make_interval(secs => $3)
            WHERE pool_name = $1 AND pool_id = $2
            "#,
        )
        .bind(pool)
        .bind(pool_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(database_error("renew pool membership"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn remove_membership(&self, pool: &str, pool_id: &str) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM lockstep_pool_members WHERE pool_name = $1 AND pool_id = $2")
                .bind(pool)
                .bind(pool_id)
                .execute(&self.pool)
                .await
                .map_err(database_error("remove pool membership"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn remove_expired_memberships(&self, pool: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM lockstep_pool_members WHERE pool_name = $1 AND expires_at <= NOW()",
        )
        .bind(pool)
        .execute(&self.pool)
        .await
        .map_err(database_error("remove expired pool memberships"))?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(pool, removed, "removed expired pool memberships");
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn live_memberships(&self, pool: &str) -> Result<Vec<PoolMembership>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT pool_id, created_at, last_renewed_at, expires_at
            FROM lockstep_pool_members
            WHERE pool_name = $1 AND expires_at > NOW()
            ORDER BY pool_id
            "#,
        )
        .bind(pool)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("list pool memberships"))?;

        Ok(rows.iter().map(row_to_membership).collect())
    }

    // =========================================================================
    // Resource operations
    // =========================================================================

    #[instrument(skip(self, value))]
    async fn upsert_resource(
        &self,
        pool: &str,
        value: &serde_json::Value,
    ) -> Result<ResourceRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO lockstep_resources (id, pool_name, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (pool_name, value) DO UPDATE
            SET value = EXCLUDED.value
            RETURNING id, value, owner_pool_id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(pool)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("upsert resource"))?;

        Ok(row_to_resource(&row))
    }

    #[instrument(skip(self))]
    async fn count_resources(&self, pool: &str, owner: Option<&str>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM lockstep_resources
            WHERE pool_name = $1
              AND ($2::text IS NULL OR owner_pool_id = $2)
            "#,
        )
        .bind(pool)
        .bind(owner)
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("count resources"))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, live_members), fields(live = live_members.len()))]
    async fn claim_resource(
        &self,
        pool: &str,
        owner: &str,
        live_members: &[String],
    ) -> Result<Option<ResourceRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE lockstep_resources r
            SET owner_pool_id = $2
            WHERE r.id = (
                SELECT id
                FROM lockstep_resources
                WHERE pool_name = $1
                  AND (owner_pool_id IS NULL OR NOT (owner_pool_id = ANY($3)))
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING r.id, r.value, r.owner_pool_id
            "#,
        )
        .bind(pool)
        .bind(owner)
        .bind(live_members)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("claim resource"))?;

        Ok(row.as_ref().map(row_to_resource))
    }

    #[instrument(skip(self))]
    async fn disown_resource(
        &self,
        pool: &str,
        resource_id: Uuid,
        owner: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lockstep_resources
            SET owner_pool_id = NULL
            WHERE pool_name = $1 AND id = $2 AND owner_pool_id = $3
            "#,
        )
        .bind(pool)
        .bind(resource_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(database_error("disown resource"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn drop_pool(&self, pool: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database_error("begin drop pool transaction"))?;

        sqlx::query("DELETE FROM lockstep_pool_members WHERE pool_name = $1")
            .bind(pool)
            .execute(&mut *tx)
            .await
            .map_err(database_error("drop pool memberships"))?;
        sqlx::query("DELETE FROM lockstep_resources WHERE pool_name = $1")
            .bind(pool)
            .execute(&mut *tx)
            .await
            .map_err(database_error("drop pool resources"))?;

        tx.commit()
            .await
            .map_err(database_error("commit drop pool"))?;

        info!(pool, "dropped pool");
        Ok(())
    }
}
