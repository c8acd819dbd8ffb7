use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use thiserror::Error;
use tracing::info;

use crate::listen::Listen;

/// Enumeration of errors returned by a listen store.
/// Transient errors may succeed on a later attempt, rejected batches never will.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    Connection(sqlx::Error),
    #[error("insert failed with a transient error: {0}")]
    Transient(sqlx::Error),
    #[error("insert was rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if is_transient(&error) {
            StoreError::Transient(error)
        } else {
            StoreError::Rejected(error.to_string())
        }
    }
}

/// Connectivity problems and serialization conflicts are worth retrying; constraint and
/// encoding errors (e.g. 22P05 untranslatable character) are not.
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map_or(false, |code| is_transient_sqlstate(code.as_ref())),
        _ => false,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P02" | "57P03")
}

/// Hands out one writer per worker. Each writer owns its connection for its whole life.
#[async_trait]
pub trait ListenStore: Send + Sync {
    type Writer: BatchWriter + 'static;

    async fn writer(&self) -> Result<Self::Writer, StoreError>;
}

#[async_trait]
pub trait BatchWriter: Send {
    /// Insert all listens with a single statement and commit.
    /// Returns how many rows were actually inserted; rows already present are skipped.
    async fn insert_batch(&mut self, listens: &[Listen]) -> Result<u64, StoreError>;
}

/// Bulk insert into a Postgres (Timescale) table. The table and its unique index on
/// `(listened_at, recording_msid, user_name)` are created out of band.
#[derive(Clone)]
pub struct PgListenStore {
    table: String,
    pool: PgPool,
}

impl PgListenStore {
    pub async fn new(table: &str, url: &str, max_connections: u32) -> Result<Self, StoreError> {
        info!("connecting to listen store");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(StoreError::Connection)?;
        info!("connected to listen store");

        Ok(Self::new_from_pool(table, pool))
    }

    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }
}

#[async_trait]
impl ListenStore for PgListenStore {
    type Writer = PgBatchWriter;

    async fn writer(&self) -> Result<PgBatchWriter, StoreError> {
        let connection = self.pool.acquire().await.map_err(StoreError::Connection)?;

        Ok(PgBatchWriter {
            query: insert_query(&self.table),
            pool: self.pool.clone(),
            connection: Some(connection),
        })
    }
}

pub struct PgBatchWriter {
    query: String,
    pool: PgPool,
    connection: Option<PoolConnection<Postgres>>,
}

/// Column arrays for a single UNNEST insert.
#[derive(Default)]
struct ListenColumns {
    listened_at: Vec<i64>,
    recording_ids: Vec<String>,
    user_names: Vec<String>,
    payloads: Vec<String>,
}

impl ListenColumns {
    fn from_listens(listens: &[Listen]) -> Result<Self, StoreError> {
        let mut columns = ListenColumns {
            listened_at: Vec::with_capacity(listens.len()),
            recording_ids: Vec::with_capacity(listens.len()),
            user_names: Vec::with_capacity(listens.len()),
            payloads: Vec::with_capacity(listens.len()),
        };
        for listen in listens {
            let payload = listen
                .payload()
                .map_err(|e| StoreError::Rejected(format!("failed to encode payload: {}", e)))?;
            columns.listened_at.push(listen.listened_at);
            columns.recording_ids.push(listen.recording_id.clone());
            columns.user_names.push(listen.user_name.clone());
            columns.payloads.push(payload);
        }
        Ok(columns)
    }
}

// TODO: Escaping. sqlx doesn't support binding identifiers.
fn insert_query(table: &str) -> String {
    format!(
        r#"
INSERT INTO "{0}"
    (listened_at, recording_msid, user_name, data)
SELECT
    listened_at, recording_msid, user_name, data::jsonb
FROM
    UNNEST($1::bigint[], $2::text[], $3::text[], $4::text[])
    AS batch(listened_at, recording_msid, user_name, data)
ON CONFLICT DO NOTHING
        "#,
        table
    )
}

#[async_trait]
impl BatchWriter for PgBatchWriter {
    async fn insert_batch(&mut self, listens: &[Listen]) -> Result<u64, StoreError> {
        let columns = ListenColumns::from_listens(listens)?;

        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.pool.acquire().await.map_err(StoreError::Connection)?,
        };

        let result = sqlx::query(&self.query)
            .bind(&columns.listened_at)
            .bind(&columns.recording_ids)
            .bind(&columns.user_names)
            .bind(&columns.payloads)
            .execute(&mut *connection)
            .await;

        match result {
            Ok(done) => {
                self.connection = Some(connection);
                Ok(done.rows_affected())
            }
            Err(error) => {
                let error = StoreError::from(error);
                // A connection that failed mid-statement is not trusted again; the next
                // attempt re-acquires one from the pool.
                if !error.is_retryable() {
                    self.connection = Some(connection);
                }
                Err(error)
            }
        }
    }
}

/// Logs batches instead of writing them. Used for dry runs.
#[derive(Clone, Default)]
pub struct PrintStore {}

pub struct PrintWriter {}

#[async_trait]
impl ListenStore for PrintStore {
    type Writer = PrintWriter;

    async fn writer(&self) -> Result<PrintWriter, StoreError> {
        Ok(PrintWriter {})
    }
}

#[async_trait]
impl BatchWriter for PrintWriter {
    async fn insert_batch(&mut self, listens: &[Listen]) -> Result<u64, StoreError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of listens");
        let _enter = span.enter();

        metrics::histogram!("listen_import_print_batch_size").record(listens.len() as f64);
        for listen in listens {
            tracing::info!(
                listened_at = listen.listened_at,
                user_name = listen.user_name.as_str(),
                "listen: {:?}",
                listen.track_metadata
            );
        }

        Ok(listens.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listen::decode_line;

    fn listens() -> Vec<Listen> {
        [
            r#"{"listened_at": 100, "recording_msid": "00000000-0000-0000-0000-000000000001", "user_name": "bob", "track_metadata": {"track_name": "One"}}"#,
            r#"{"listened_at": 101, "recording_msid": "00000000-0000-0000-0000-000000000002", "user_name": "bob", "track_metadata": {"track_name": "Two"}}"#,
        ]
        .iter()
        .map(|line| decode_line(line).unwrap())
        .collect()
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("40001"));
        assert!(!is_transient_sqlstate("22P05"));
        assert!(!is_transient_sqlstate("23505"));

        assert!(StoreError::from(sqlx::Error::PoolClosed).is_retryable());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_columns_follow_batch_order() {
        let columns = ListenColumns::from_listens(&listens()).unwrap();
        assert_eq!(columns.listened_at, vec![100, 101]);
        assert_eq!(columns.user_names, vec!["bob", "bob"]);
        assert_eq!(
            columns.payloads,
            vec![r#"{"track_name":"One"}"#, r#"{"track_name":"Two"}"#]
        );
    }

    #[test]
    fn test_insert_query_targets_table() {
        let query = insert_query("listen");
        assert!(query.contains(r#"INSERT INTO "listen""#));
        assert!(query.contains("ON CONFLICT DO NOTHING"));
    }

    #[tokio::test]
    async fn test_print_store_accepts_everything() {
        let mut writer = PrintStore::default().writer().await.unwrap();
        assert_eq!(writer.insert_batch(&listens()).await.unwrap(), 2);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_insert_batch_skips_existing_rows(db: PgPool) {
        let store = PgListenStore::new_from_pool("listen", db.clone());
        let mut writer = store.writer().await.expect("failed to acquire writer");

        assert_eq!(writer.insert_batch(&listens()).await.unwrap(), 2);
        // Same natural keys again: nothing new lands.
        assert_eq!(writer.insert_batch(&listens()).await.unwrap(), 0);

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM listen")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
