//! Append-only record of ingested source archives.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nomina_core::LedgerEntry;
use sqlx::PgPool;
use tracing::info;

#[async_trait]
pub trait IngestionLedger: Send + Sync {
    /// Locators of every archive that was ingested successfully at least once.
    async fn list_completed_sources(&self) -> Result<HashSet<String>>;

    async fn record_completion(
        &self,
        locator: &str,
        checksum: &str,
        row_count: u64,
    ) -> Result<LedgerEntry>;
}

#[derive(Debug, Clone)]
pub struct PgIngestionLedger {
    pool: PgPool,
}

impl PgIngestionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestionLedger for PgIngestionLedger {
    async fn list_completed_sources(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT resource_url
              FROM download_history
             WHERE was_succeed
             GROUP BY resource_url
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing completed downloads")?;
        Ok(rows.into_iter().collect())
    }

    async fn record_completion(
        &self,
        locator: &str,
        checksum: &str,
        row_count: u64,
    ) -> Result<LedgerEntry> {
        let entries = i64::try_from(row_count).context("row count overflows BIGINT")?;
        let (download_id, resource_url, check_sum, entries, download_at_utc, was_succeed) =
            sqlx::query_as::<_, (String, String, String, i64, DateTime<Utc>, bool)>(
                r#"
                INSERT INTO download_history (download_id, resource_url, check_sum, entries, was_succeed)
                SELECT 'D' || LPAD(
                           (COALESCE(MAX(REGEXP_REPLACE(download_id, '\D', '', 'g')::BIGINT), 0) + 1)::TEXT,
                           7,
                           '0'
                       ),
                       $1, $2, $3, TRUE
                  FROM download_history
                RETURNING download_id, resource_url, check_sum, entries, download_at_utc, was_succeed
                "#,
            )
            .bind(locator)
            .bind(checksum)
            .bind(entries)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("recording ledger entry for {locator}"))?;

        info!(%download_id, %resource_url, entries, "recorded completed download");
        Ok(LedgerEntry {
            download_id,
            resource_url,
            check_sum,
            entries,
            download_at_utc,
            was_succeed,
        })
    }
}
