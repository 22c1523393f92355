use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

use crate::codec::RenderedAnswer;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialize answers: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One resolved query. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub request_id: String,
    /// Queried name, lowercased, trailing dot stripped.
    pub domain: String,
    pub query_type: String,
    pub client_ip: String,
    /// Identity string of the resolver that answered, e.g. `1.1.1.1:53`.
    pub upstream: String,
    pub is_domestic: bool,
    pub response_code: u16,
    pub answer_count: usize,
    pub total_time_ms: f64,
    pub created_at: DateTime<Utc>,
    pub answers: Vec<RenderedAnswer>,
}

/// Cached outcome of one filing lookup, keyed by main domain.
#[derive(Debug, Clone)]
pub struct FilingCacheEntry {
    pub is_domestic: bool,
    pub api_response: String,
    pub updated_at: DateTime<Utc>,
}

/// Append-only sink for query records plus the classifier's filing cache.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, record: &QueryRecord) -> Result<(), JournalError>;

    async fn get_cache(&self, domain: &str) -> Result<Option<FilingCacheEntry>, JournalError>;

    async fn put_cache(
        &self,
        domain: &str,
        is_domestic: bool,
        api_response: &str,
    ) -> Result<(), JournalError>;

    /// Removes cache rows older than `max_age`, returning how many went.
    async fn delete_cache_older_than(&self, max_age: Duration) -> Result<u64, JournalError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dns_queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    domain TEXT NOT NULL,
    query_type TEXT NOT NULL,
    client_ip TEXT NOT NULL,
    upstream TEXT NOT NULL,
    is_domestic BOOLEAN NOT NULL,
    response_code INTEGER NOT NULL,
    answer_count INTEGER NOT NULL,
    total_time_ms REAL NOT NULL,
    created_at DATETIME NOT NULL,
    answers TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_dns_queries_created_at ON dns_queries(created_at);
CREATE INDEX IF NOT EXISTS idx_dns_queries_domain ON dns_queries(domain);

CREATE TABLE IF NOT EXISTS filing_cache (
    domain TEXT PRIMARY KEY,
    is_domestic BOOLEAN NOT NULL,
    api_response TEXT NOT NULL DEFAULT '{}',
    updated_at DATETIME NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_filing_cache_updated_at ON filing_cache(updated_at);
";

/// SQLite-backed journal. WAL mode plus a busy timeout keeps the concurrent
/// handler tasks from tripping over the single writer.
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!(path = %path.display(), "journal database ready");

        Ok(Self { pool })
    }

    /// Last `limit` records, newest first. Feeds the operator console and the
    /// integration tests.
    #[allow(dead_code)]
    pub async fn recent(&self, limit: i64) -> Result<Vec<QueryRecord>, JournalError> {
        let rows = sqlx::query(
            "SELECT request_id, domain, query_type, client_ip, upstream, is_domestic, \
             response_code, answer_count, total_time_ms, created_at, answers \
             FROM dns_queries ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let answers: Vec<RenderedAnswer> =
                    serde_json::from_str(row.get::<String, _>("answers").as_str())?;
                Ok(QueryRecord {
                    request_id: row.get("request_id"),
                    domain: row.get("domain"),
                    query_type: row.get("query_type"),
                    client_ip: row.get("client_ip"),
                    upstream: row.get("upstream"),
                    is_domestic: row.get("is_domestic"),
                    response_code: row.get::<i64, _>("response_code") as u16,
                    answer_count: row.get::<i64, _>("answer_count") as usize,
                    total_time_ms: row.get("total_time_ms"),
                    created_at: row.get("created_at"),
                    answers,
                })
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&self, record: &QueryRecord) -> Result<(), JournalError> {
        let answers = serde_json::to_string(&record.answers)?;
        sqlx::query(
            "INSERT INTO dns_queries (request_id, domain, query_type, client_ip, upstream, \
             is_domestic, response_code, answer_count, total_time_ms, created_at, answers) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.request_id)
        .bind(&record.domain)
        .bind(&record.query_type)
        .bind(&record.client_ip)
        .bind(&record.upstream)
        .bind(record.is_domestic)
        .bind(record.response_code as i64)
        .bind(record.answer_count as i64)
        .bind(record.total_time_ms)
        .bind(record.created_at)
        .bind(answers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cache(&self, domain: &str) -> Result<Option<FilingCacheEntry>, JournalError> {
        let row = sqlx::query(
            "SELECT is_domestic, api_response, updated_at FROM filing_cache WHERE domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| FilingCacheEntry {
            is_domestic: row.get("is_domestic"),
            api_response: row.get("api_response"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn put_cache(
        &self,
        domain: &str,
        is_domestic: bool,
        api_response: &str,
    ) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO filing_cache (domain, is_domestic, api_response, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(domain) DO UPDATE SET \
                 is_domestic = excluded.is_domestic, \
                 api_response = excluded.api_response, \
                 updated_at = excluded.updated_at",
        )
        .bind(domain)
        .bind(is_domestic)
        .bind(api_response)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_cache_older_than(&self, max_age: Duration) -> Result<u64, JournalError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let result = sqlx::query("DELETE FROM filing_cache WHERE updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteJournal) {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = SqliteJournal::open(&dir.path().join("test.db"))
            .await
            .expect("open journal");
        (dir, journal)
    }

    fn sample_record() -> QueryRecord {
        QueryRecord {
            request_id: "8a9bfa67-1111-4222-8333-abcdefabcdef".to_string(),
            domain: "www.taobao.com".to_string(),
            query_type: "A".to_string(),
            client_ip: "127.0.0.1".to_string(),
            upstream: "120.53.53.53:53".to_string(),
            is_domestic: true,
            response_code: 0,
            answer_count: 1,
            total_time_ms: 12.5,
            created_at: Utc::now(),
            answers: vec![RenderedAnswer {
                name: "www.taobao.com.".to_string(),
                record_type: "A".to_string(),
                ttl: 300,
                data: "1.2.3.4".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn append_then_recent_round_trips() {
        let (_dir, journal) = open_temp().await;

        let record = sample_record();
        journal.append(&record).await.expect("append");

        let rows = journal.recent(10).await.expect("recent");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.request_id, record.request_id);
        assert_eq!(row.domain, "www.taobao.com");
        assert_eq!(row.upstream, "120.53.53.53:53");
        assert!(row.is_domestic);
        assert_eq!(row.answer_count, 1);
        assert_eq!(row.answers.len(), 1);
        assert_eq!(row.answers[0].data, "1.2.3.4");
        assert!((row.total_time_ms - 12.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cache_put_get_and_overwrite() {
        let (_dir, journal) = open_temp().await;

        assert!(journal.get_cache("taobao.com").await.expect("get").is_none());

        journal
            .put_cache("taobao.com", true, r#"{"StateCode":1}"#)
            .await
            .expect("put");
        let entry = journal
            .get_cache("taobao.com")
            .await
            .expect("get")
            .expect("entry");
        assert!(entry.is_domestic);
        assert_eq!(entry.api_response, r#"{"StateCode":1}"#);

        journal
            .put_cache("taobao.com", false, r#"{"StateCode":0}"#)
            .await
            .expect("overwrite");
        let entry = journal
            .get_cache("taobao.com")
            .await
            .expect("get")
            .expect("entry");
        assert!(!entry.is_domestic);
    }

    #[tokio::test]
    async fn sweep_removes_only_aged_rows() {
        let (_dir, journal) = open_temp().await;

        journal.put_cache("old.com", true, "{}").await.expect("put");
        journal.put_cache("new.com", true, "{}").await.expect("put");

        // back-date one row past the 24 h horizon
        let aged = Utc::now() - chrono::Duration::hours(25);
        sqlx::query("UPDATE filing_cache SET updated_at = ? WHERE domain = ?")
            .bind(aged)
            .bind("old.com")
            .execute(&journal.pool)
            .await
            .expect("backdate");

        let deleted = journal
            .delete_cache_older_than(Duration::from_secs(24 * 3600))
            .await
            .expect("sweep");
        assert_eq!(deleted, 1);
        assert!(journal.get_cache("old.com").await.expect("get").is_none());
        assert!(journal.get_cache("new.com").await.expect("get").is_some());
    }
}
