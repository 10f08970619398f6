use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::error::{Error, ErrorDetails};
use crate::ledger::{CreditAllocation, DeductOutcome, Ledger, UsageEvent, WindowRow};
use crate::tier::UNLIMITED;
use crate::window::WindowKind;

/// Postgres-backed durable ledger.
///
/// Window upserts ride `ON CONFLICT ... DO UPDATE`; the credit deduct is a
/// single conditional `UPDATE ... RETURNING` so two members of an org can
/// never both spend the last unit of a shared pool.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::LedgerConnection {
                    message: format!("Failed to connect to ledger database: {e}"),
                })
            })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), Error> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::LedgerQuery {
                    message: format!("Failed to run ledger migrations: {e}"),
                })
            })?;
        info!("Ledger migrations applied");
        Ok(())
    }

    fn query_error(e: sqlx::Error) -> Error {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Error::new_without_logging(ErrorDetails::LedgerConnection {
                    message: e.to_string(),
                })
            }
            _ => Error::new_without_logging(ErrorDetails::LedgerQuery {
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn upsert_window(
        &self,
        identity: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO window_counters (identity, window_kind, window_start, count, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (identity, window_kind, window_start)
            DO UPDATE SET count = window_counters.count + EXCLUDED.count
            RETURNING count
            "#,
        )
        .bind(identity)
        .bind(kind.as_str())
        .bind(window_start)
        .bind(delta)
        .bind(kind.end_of(window_start))
        .fetch_one(&self.pool)
        .await
        .map_err(Self::query_error)?;
        Ok(count)
    }

    async fn window_count(
        &self,
        identity: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT count FROM window_counters
            WHERE identity = $1 AND window_kind = $2 AND window_start = $3
            "#,
        )
        .bind(identity)
        .bind(kind.as_str())
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::query_error)?;
        Ok(count.unwrap_or(0))
    }

    async fn active_windows(&self, now: DateTime<Utc>) -> Result<Vec<WindowRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT identity, window_kind, window_start, count, expires_at
            FROM window_counters
            WHERE window_start <= $1 AND expires_at > $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::query_error)?;

        let mut windows = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: WindowKind = row.get::<String, _>("window_kind").parse()?;
            windows.push(WindowRow {
                identity: row.get("identity"),
                kind,
                window_start: row.get("window_start"),
                count: row.get("count"),
                expires_at: row.get("expires_at"),
            });
        }
        Ok(windows)
    }

    async fn record_event(&self, event: &UsageEvent) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO usage_events
                (event_id, identity, org_id, endpoint, tokens_used, cost_minor_units,
                 status, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.identity)
        .bind(&event.org_id)
        .bind(&event.endpoint)
        .bind(event.tokens_used)
        .bind(event.cost_minor_units)
        .bind(&event.status)
        .bind(event.created_at)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error)?;
        Ok(())
    }

    async fn credit_allocation(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditAllocation>, Error> {
        let row = sqlx::query(
            r#"
            SELECT org_id, user_id, allocated_credits, used_credits, period_start, period_end
            FROM credit_allocations
            WHERE org_id = $1 AND period_start <= $2 AND period_end > $2
            "#,
        )
        .bind(org_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::query_error)?;

        Ok(row.map(|row| CreditAllocation {
            org_id: row.get("org_id"),
            user_id: row.get("user_id"),
            allocated_credits: row.get("allocated_credits"),
            used_credits: row.get("used_credits"),
            period_start: row.get("period_start"),
            period_end: row.get("period_end"),
        }))
    }

    async fn deduct_credits(
        &self,
        org_id: &str,
        user_id: &str,
        amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome, Error> {
        let mut tx = self.pool.begin().await.map_err(Self::query_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_deductions (idempotency_key, org_id, user_id, amount)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(idempotency_key)
        .bind(org_id)
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(Self::query_error)?
        .rows_affected();

        if inserted == 0 {
            // Replayed deduct: report the current balance without spending.
            tx.rollback().await.map_err(Self::query_error)?;
            return match self.credit_allocation(org_id, now).await? {
                Some(allocation) => Ok(DeductOutcome::Deducted {
                    remaining: allocation.remaining(),
                }),
                None => Ok(DeductOutcome::NoAllocation),
            };
        }

        let row = sqlx::query(
            r#"
            UPDATE credit_allocations
            SET used_credits = used_credits + $2
            WHERE org_id = $1
              AND period_start <= $3 AND period_end > $3
              AND (used_credits + $2 <= allocated_credits OR allocated_credits = -1)
            RETURNING allocated_credits, used_credits
            "#,
        )
        .bind(org_id)
        .bind(amount)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Self::query_error)?;

        match row {
            Some(row) => {
                tx.commit().await.map_err(Self::query_error)?;
                let allocated: i64 = row.get("allocated_credits");
                let used: i64 = row.get("used_credits");
                let remaining = if allocated == UNLIMITED {
                    UNLIMITED
                } else {
                    allocated - used
                };
                Ok(DeductOutcome::Deducted { remaining })
            }
            None => {
                // Zero-row update: either the pool is short or there is no
                // allocation at all. Roll back the dedupe row so a later
                // retry with the same key can still spend.
                tx.rollback().await.map_err(Self::query_error)?;
                match self.credit_allocation(org_id, now).await? {
                    Some(allocation) => Ok(DeductOutcome::InsufficientCredit {
                        remaining: allocation.remaining(),
                    }),
                    None => Ok(DeductOutcome::NoAllocation),
                }
            }
        }
    }

    async fn reset_quota(
        &self,
        identity: &str,
        org_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.map_err(Self::query_error)?;

        for kind in [WindowKind::Day, WindowKind::Month] {
            sqlx::query(
                r#"
                DELETE FROM window_counters
                WHERE identity = $1 AND window_kind = $2 AND window_start = $3
                "#,
            )
            .bind(identity)
            .bind(kind.as_str())
            .bind(kind.truncate(now))
            .execute(&mut *tx)
            .await
            .map_err(Self::query_error)?;
        }

        if let Some(org_id) = org_id {
            sqlx::query(
                r#"
                UPDATE credit_allocations
                SET used_credits = 0
                WHERE org_id = $1 AND period_start <= $2 AND period_end > $2
                "#,
            )
            .bind(org_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Self::query_error)?;
        }

        tx.commit().await.map_err(Self::query_error)?;
        Ok(())
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let purged = sqlx::query(
            r#"
            DELETE FROM usage_events WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error)?
        .rows_affected();
        Ok(purged)
    }
}
