//! `PostgreSQL` store backend (feature `postgres`).
//!
//! Two tables: an append-only `reservations` log and one `sale_items` row
//! per item per window. A purchase is a conditional UPDATE guarded on
//! `purchased_flag = FALSE`; zero rows affected means the row was already
//! taken and the caller's purchase must not commit.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{QueryBuilder, Row};

use flashsale_core::store::{PurchaseFact, ReservationFact};
use flashsale_core::UnixMillis;

use super::StoreBackend;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS reservations (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        item_id BIGINT NOT NULL,
        code UUID NOT NULL,
        created_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS reservations_expires_at_idx
        ON reservations (expires_at)",
    "CREATE TABLE IF NOT EXISTS sale_items (
        window_id BIGINT NOT NULL,
        item_id BIGINT NOT NULL,
        purchased_flag BOOLEAN NOT NULL DEFAULT FALSE,
        purchased_by BIGINT,
        purchased_at BIGINT,
        PRIMARY KEY (window_id, item_id)
    )",
];

/// `PostgreSQL`-backed [`StoreBackend`] over a connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects a pool to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool (tests, shared pools).
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when any DDL statement fails.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for PostgresStore {
    async fn write_reservations(&self, batch: &[ReservationFact]) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::new(
            "INSERT INTO reservations (user_id, item_id, code, created_at, expires_at) ",
        );
        builder.push_values(batch, |mut row, fact| {
            row.push_bind(fact.user_id)
                .push_bind(fact.item_index)
                .push_bind(fact.code)
                .push_bind(fact.created_at)
                .push_bind(fact.expires_at);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn write_purchase(&self, fact: &PurchaseFact) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE sale_items
                SET purchased_flag = TRUE, purchased_by = $1, purchased_at = $2
              WHERE window_id = $3 AND item_id = $4 AND purchased_flag = FALSE",
        )
        .bind(fact.user_id)
        .bind(fact.purchased_at)
        .bind(fact.window_id)
        .bind(fact.item_index)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!(
                "purchase update affected zero rows for window {} item {}",
                fact.window_id,
                fact.item_index
            );
        }
        Ok(())
    }

    async fn ensure_window(&self, window_id: i64, items: i64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sale_items (window_id, item_id)
             SELECT $1, g FROM generate_series(0, $2 - 1) AS g
             ON CONFLICT DO NOTHING",
        )
        .bind(window_id)
        .bind(items)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_active_reservations(
        &self,
        now: UnixMillis,
    ) -> anyhow::Result<Vec<ReservationFact>> {
        let rows = sqlx::query(
            "SELECT user_id, item_id, code, created_at, expires_at
               FROM reservations
              WHERE expires_at > $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut facts = Vec::with_capacity(rows.len());
        for row in rows {
            facts.push(ReservationFact {
                code: row.try_get("code")?,
                user_id: row.try_get("user_id")?,
                item_index: row.try_get("item_id")?,
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
            });
        }
        Ok(facts)
    }

    async fn load_purchases(&self, window_id: i64) -> anyhow::Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT item_id, purchased_by
               FROM sale_items
              WHERE window_id = $1 AND purchased_flag = TRUE",
        )
        .bind(window_id)
        .fetch_all(&self.pool)
        .await?;

        let mut purchases = Vec::with_capacity(rows.len());
        for row in rows {
            purchases.push((row.try_get("item_id")?, row.try_get("purchased_by")?));
        }
        Ok(purchases)
    }
}
