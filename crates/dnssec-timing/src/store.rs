//! The SQLite store of measurements.
//!
//! Record content is stored once per distinct hash; every signed
//! answer adds a timing row pointing at its content.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::fmt;
use std::str::FromStr;

use crate::aggregator::AnswerReceiver;
use crate::normalise::normalise;

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS content (
        hash TEXT PRIMARY KEY,
        rrdata TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS timing (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        resolved INTEGER NOT NULL,
        domain TEXT NOT NULL,
        rrtype INTEGER NOT NULL,
        hash TEXT NOT NULL REFERENCES content(hash),
        inception INTEGER NOT NULL,
        expiration INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_timing_rrtype ON timing(rrtype, resolved)",
    "CREATE INDEX IF NOT EXISTS idx_timing_domain ON timing(domain)",
];

/// What one pass wrote.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    /// Timing rows added.
    pub facts: u64,
    /// Content rows added; the rest were already present.
    pub new_content: u64,
    /// Answers dropped for having no signature.
    pub unsigned: u64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the database at `url`, creating it and the tables if
    /// needed.
    ///
    /// # Errors
    ///
    /// If the URL is invalid, or the database cannot be opened or
    /// initialised.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // every connection to an in-memory database gets its own
        // empty database
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::debug!(%url, "store open");
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Write every answer from the channel in one transaction, which
    /// is committed only once the channel is drained.  Unsigned
    /// answers are logged and skipped.
    ///
    /// # Errors
    ///
    /// If any statement fails.  Nothing from the pass is kept: the
    /// transaction is rolled back when it is dropped.
    pub async fn write_pass(
        &self,
        mut answers: AnswerReceiver,
        resolved: i64,
    ) -> Result<WriteSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = WriteSummary::default();

        while let Some(answer) = answers.recv().await {
            let Some(normalised) = normalise(&answer) else {
                tracing::info!(domain = %answer.domain, rtype = %answer.rtype, "unsigned");
                summary.unsigned += 1;
                continue;
            };

            let inserted = sqlx::query("INSERT OR IGNORE INTO content (hash, rrdata) VALUES (?, ?)")
                .bind(&normalised.hash)
                .bind(&normalised.rrdata)
                .execute(&mut *tx)
                .await?;
            summary.new_content += inserted.rows_affected();

            sqlx::query(
                "INSERT INTO timing (resolved, domain, rrtype, hash, inception, expiration)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(resolved)
            .bind(normalised.domain.to_dotted_string())
            .bind(i64::from(u16::from(normalised.rtype)))
            .bind(&normalised.hash)
            .bind(i64::from(normalised.signature.inception))
            .bind(i64::from(normalised.signature.expiration))
            .execute(&mut *tx)
            .await?;
            summary.facts += 1;

            tracing::trace!(domain = %normalised.domain, rtype = %normalised.rtype, hash = %normalised.hash, "stored");
        }

        tx.commit().await?;
        tracing::info!(
            facts = summary.facts,
            new_content = summary.new_content,
            unsigned = summary.unsigned,
            "pass committed"
        );
        Ok(summary)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Database(sqlx::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Database(error) => write!(f, "database error: {error}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(error) => Some(error),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Database(error)
    }
}

#[cfg(test)]
pub mod test_util {
    use super::*;

    /// Every timing row as (domain, rrtype, hash, inception, expiration).
    pub async fn timing_rows(store: &Store) -> Vec<(String, i64, String, i64, i64)> {
        sqlx::query_as(
            "SELECT domain, rrtype, hash, inception, expiration FROM timing ORDER BY id",
        )
        .fetch_all(store.pool())
        .await
        .unwrap()
    }

    pub async fn content_count(store: &Store) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM content")
            .fetch_one(store.pool())
            .await
            .unwrap();
        count
    }
}
