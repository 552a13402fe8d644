//! HTTP fetch utilities + the region-day store contract and its backends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use covreg_core::{sort_rows, RegionDayRecord, SortDirection, SortField};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "covreg-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

/// Thin wrapper over a shared `reqwest` client.
///
/// One outbound GET per call, bounded by the configured timeout and a global
/// concurrency cap. Deliberately no retry loop: retry policy belongs to the
/// caller, and 404 must reach the format layer undisturbed.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

impl HttpError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// GET `url` and return the body on any 2xx status.
    ///
    /// Non-2xx statuses come back as [`HttpError::Status`] so the caller can
    /// tell a missing resource (404) apart from upstream failure.
    pub async fn fetch_bytes(&self, resource: &str, url: &str) -> Result<FetchedResponse, HttpError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", resource, url);
        let client = self.client.clone();
        let url = url.to_string();
        async move {
            let resp = client.get(&url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(HttpError::Status {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store holds no rows for {0} immediately after a completed upsert")]
    InconsistentRead(NaiveDate),
}

/// Durable keyed storage for region-day rows.
///
/// Rows are keyed on `(submission_date, region_name)`; `upsert_batch` must
/// commit the whole batch or none of it.
#[async_trait]
pub trait RegionDayStore: Send + Sync {
    async fn exists(&self, date: NaiveDate) -> Result<bool, StoreError>;

    async fn read_by_date(
        &self,
        date: NaiveDate,
        sort_field: Option<SortField>,
        direction: SortDirection,
    ) -> Result<Vec<RegionDayRecord>, StoreError>;

    async fn read_one(
        &self,
        date: NaiveDate,
        region_code: &str,
    ) -> Result<Option<RegionDayRecord>, StoreError>;

    async fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError>;

    async fn upsert_batch(
        &self,
        rows: &[RegionDayRecord],
    ) -> Result<Vec<RegionDayRecord>, StoreError>;
}

/// In-memory store backend, used by tests and as the zero-setup default.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<(NaiveDate, String), RegionDayRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegionDayStore for MemoryStore {
    async fn exists(&self, date: NaiveDate) -> Result<bool, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.keys().any(|(d, _)| *d == date))
    }

    async fn read_by_date(
        &self,
        date: NaiveDate,
        sort_field: Option<SortField>,
        direction: SortDirection,
    ) -> Result<Vec<RegionDayRecord>, StoreError> {
        let rows = self.rows.read().await;
        let mut out: Vec<RegionDayRecord> = rows
            .values()
            .filter(|r| r.submission_date == date)
            .cloned()
            .collect();
        sort_rows(&mut out, sort_field, direction);
        Ok(out)
    }

    async fn read_one(
        &self,
        date: NaiveDate,
        region_code: &str,
    ) -> Result<Option<RegionDayRecord>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .find(|r| r.submission_date == date && r.region_code == region_code)
            .cloned())
    }

    async fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.keys().map(|(d, _)| *d).max())
    }

    async fn upsert_batch(
        &self,
        batch: &[RegionDayRecord],
    ) -> Result<Vec<RegionDayRecord>, StoreError> {
        let mut rows = self.rows.write().await;
        let mut out = Vec::with_capacity(batch.len());
        for row in batch {
            let key = (row.submission_date, row.region_name.clone());
            rows.insert(key, row.clone());
            out.push(row.clone());
        }
        Ok(out)
    }
}

/// Postgres store backend over runtime `sqlx` queries.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `regional_covid_data` table and its uniqueness constraint.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS regional_covid_data (
                id BIGSERIAL PRIMARY KEY,
                submission_date DATE NOT NULL,
                region_code TEXT NOT NULL,
                region_name TEXT NOT NULL,
                total_positive_cases BIGINT NOT NULL DEFAULT 0,
                UNIQUE (submission_date, region_name)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS regional_covid_data_submission_date_idx
             ON regional_covid_data (submission_date)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn order_by_clause(sort_field: Option<SortField>, direction: SortDirection) -> String {
        // Column names come from the SortField whitelist, never from caller
        // input, so interpolation here is safe.
        match sort_field {
            Some(field) => {
                let keyword = match direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("ORDER BY {} {}", field.column(), keyword)
            }
            None => "ORDER BY total_positive_cases DESC, region_name ASC".to_string(),
        }
    }

    fn row_from_pg(row: &sqlx::postgres::PgRow) -> RegionDayRecord {
        RegionDayRecord {
            submission_date: row.get("submission_date"),
            region_code: row.get("region_code"),
            region_name: row.get("region_name"),
            total_positive_cases: row.get("total_positive_cases"),
        }
    }
}

#[async_trait]
impl RegionDayStore for PgStore {
    async fn exists(&self, date: NaiveDate) -> Result<bool, StoreError> {
        let found = sqlx::query("SELECT 1 FROM regional_covid_data WHERE submission_date = $1 LIMIT 1")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn read_by_date(
        &self,
        date: NaiveDate,
        sort_field: Option<SortField>,
        direction: SortDirection,
    ) -> Result<Vec<RegionDayRecord>, StoreError> {
        let sql = format!(
            "SELECT submission_date, region_code, region_name, total_positive_cases
             FROM regional_covid_data WHERE submission_date = $1 {}",
            Self::order_by_clause(sort_field, direction)
        );
        let rows = sqlx::query(&sql).bind(date).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::row_from_pg).collect())
    }

    async fn read_one(
        &self,
        date: NaiveDate,
        region_code: &str,
    ) -> Result<Option<RegionDayRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT submission_date, region_code, region_name, total_positive_cases
             FROM regional_covid_data WHERE submission_date = $1 AND region_code = $2",
        )
        .bind(date)
        .bind(region_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_from_pg))
    }

    async fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query("SELECT MAX(submission_date) AS latest FROM regional_covid_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("latest"))
    }

    async fn upsert_batch(
        &self,
        batch: &[RegionDayRecord],
    ) -> Result<Vec<RegionDayRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(batch.len());
        for row in batch {
            let stored = sqlx::query(
                "INSERT INTO regional_covid_data
                     (submission_date, region_code, region_name, total_positive_cases)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (submission_date, region_name) DO UPDATE
                     SET region_code = EXCLUDED.region_code,
                         total_positive_cases = EXCLUDED.total_positive_cases
                 RETURNING submission_date, region_code, region_name, total_positive_cases",
            )
            .bind(row.submission_date)
            .bind(&row.region_code)
            .bind(&row.region_name)
            .bind(row.total_positive_cases)
            .fetch_one(&mut *tx)
            .await?;
            out.push(Self::row_from_pg(&stored));
        }
        tx.commit().await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: (i32, u32, u32), code: &str, name: &str, cases: i64) -> RegionDayRecord {
        RegionDayRecord {
            submission_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            region_code: code.to_string(),
            region_name: name.to_string(),
            total_positive_cases: cases,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_date_and_region_name() {
        let store = MemoryStore::new();
        let date = (2020, 3, 15);
        store
            .upsert_batch(&[row(date, "12", "Lazio", 300), row(date, "13", "Abruzzo", 40)])
            .await
            .unwrap();
        store
            .upsert_batch(&[row(date, "12", "Lazio", 350)])
            .await
            .unwrap();

        let rows = store
            .read_by_date(
                NaiveDate::from_ymd_opt(2020, 3, 15).unwrap(),
                None,
                SortDirection::default(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].region_name, "Lazio");
        assert_eq!(rows[0].total_positive_cases, 350);
    }

    #[tokio::test]
    async fn read_by_date_applies_default_order() {
        let store = MemoryStore::new();
        let date = (2020, 3, 15);
        store
            .upsert_batch(&[
                row(date, "13", "Abruzzo", 40),
                row(date, "09", "Toscana", 900),
                row(date, "12", "Lazio", 350),
            ])
            .await
            .unwrap();

        let rows = store
            .read_by_date(
                NaiveDate::from_ymd_opt(2020, 3, 15).unwrap(),
                None,
                SortDirection::default(),
            )
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.region_name.as_str()).collect();
        assert_eq!(names, vec!["Toscana", "Lazio", "Abruzzo"]);
    }

    #[tokio::test]
    async fn latest_date_and_point_lookup() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[row((2020, 3, 14), "12", "Lazio", 280)])
            .await
            .unwrap();
        store
            .upsert_batch(&[row((2020, 3, 15), "12", "Lazio", 350)])
            .await
            .unwrap();

        assert_eq!(
            store.latest_date().await.unwrap(),
            Some(NaiveDate::from_ymd_opt(2020, 3, 15).unwrap())
        );
        let one = store
            .read_one(NaiveDate::from_ymd_opt(2020, 3, 14).unwrap(), "12")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(one.total_positive_cases, 280);
        assert!(store
            .read_one(NaiveDate::from_ymd_opt(2020, 3, 14).unwrap(), "99")
            .await
            .unwrap()
            .is_none());
    }
}
