use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::tokens::{ClaimTokenRepository, PendingTokenRelease};
use crate::error::Result;

/// Claim token registry backed by the `claims` table.
#[derive(Debug, Clone)]
pub struct PostgresClaimTokenRepository {
    pool: PgPool,
}

impl PostgresClaimTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ClaimTokenRepository for PostgresClaimTokenRepository {
    async fn check_in(&self, token: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO claims (url)
            VALUES ($1)
            "#,
        )
        .bind(token)
        .execute(&self.pool)
        .await?;

        debug!(token, "claim token checked in");
        Ok(())
    }

    async fn begin_release(&self, token: &str) -> Result<Box<dyn PendingTokenRelease>> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM claims
            WHERE url = $1
            "#,
        )
        .bind(token)
        .execute(&mut *tx)
        .await?;

        Ok(Box::new(PostgresPendingRelease {
            tx,
            rows_affected: result.rows_affected(),
        }))
    }
}

struct PostgresPendingRelease {
    tx: Transaction<'static, Postgres>,
    rows_affected: u64,
}

#[async_trait]
impl PendingTokenRelease for PostgresPendingRelease {
    fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
