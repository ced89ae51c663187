//! SQLite 持久化后端：会话文档按版本号做条件更新，账本按条目 ID 幂等追加。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChangeFeed, DocumentStore, LedgerStore, SessionChange, SessionDocument, StoreError};
use crate::billing::ledger::{LedgerHistory, PendingItem};

const STORE_TARGET: &str = "store";

#[derive(Debug, Clone)]
pub enum SqlitePath {
    File(PathBuf),
    Memory,
}

impl SqlitePath {
    fn to_manager(&self) -> SqliteConnectionManager {
        match self {
            SqlitePath::File(path) => {
                SqliteConnectionManager::file(path).with_flags(Self::open_flags())
            }
            SqlitePath::Memory => SqliteConnectionManager::memory().with_flags(Self::open_flags()),
        }
    }

    fn open_flags() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    }

    fn as_path(&self) -> Option<&Path> {
        match self {
            SqlitePath::File(path) => Some(path.as_path()),
            SqlitePath::Memory => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub path: SqlitePath,
    pub pool_size: u32,
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: SqlitePath::File(path.into()),
            pool_size: 4,
            busy_timeout: Duration::from_millis(250),
        }
    }

    pub fn memory() -> Self {
        Self {
            path: SqlitePath::Memory,
            pool_size: 1,
            busy_timeout: Duration::from_millis(250),
        }
    }
}

/// Pooled SQLite store implementing both [`DocumentStore`] and [`LedgerStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    db_path: Option<PathBuf>,
    feed: Arc<ChangeFeed>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens the pool and runs migrations.
    pub fn bootstrap(config: SqliteConfig) -> Result<Self> {
        let busy_timeout = config.busy_timeout;
        let manager = config
            .path
            .to_manager()
            .with_init(move |conn| Self::configure_connection(conn, busy_timeout));

        // 每个内存连接都是独立数据库，只能用单连接池。
        let pool_size = match config.path {
            SqlitePath::Memory => 1,
            SqlitePath::File(_) => config.pool_size.max(1),
        };

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .context("failed to create SQLite connection pool")?;

        {
            let mut conn = pool
                .get()
                .context("failed to acquire SQLite bootstrap connection")?;
            Self::run_migrations(&mut conn)?;
        }

        Ok(Self {
            pool,
            db_path: config.path.as_path().map(Path::to_path_buf),
            feed: Arc::new(ChangeFeed::default()),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn raw_connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .context("failed to obtain SQLite connection")
    }

    #[cfg(test)]
    pub(crate) fn run_migrations_for_tests(conn: &mut Connection) -> Result<()> {
        Self::run_migrations(conn)
    }

    fn configure_connection(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(())
    }

    fn run_migrations(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS session_documents (
                session_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                document TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL UNIQUE,
                participant_id TEXT NOT NULL,
                session_kind TEXT NOT NULL,
                item_kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS ledger_items_owner
                ON ledger_items (participant_id, session_kind, seq);
            "#,
        )
        .context("failed to run SQLite migrations")?;
        Ok(())
    }

    /// Runs `work` on a pooled connection off the async runtime.
    async fn with_connection<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PooledConnection<SqliteConnectionManager>) -> Result<T, StoreError>
            + Send
            + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| StoreError::backend(format!("connection unavailable: {err}")))?;
            work(&mut conn)
        })
        .await
        .map_err(|err| StoreError::backend(format!("store task failed: {err}")))?
    }
}

fn sql_error(err: rusqlite::Error) -> StoreError {
    StoreError::backend(err.to_string())
}

fn encode(document: &SessionDocument) -> Result<String, StoreError> {
    serde_json::to_string(document)
        .map_err(|err| StoreError::backend(format!("failed to encode session document: {err}")))
}

fn decode(raw: &str, version: i64) -> Result<SessionDocument, StoreError> {
    let mut document: SessionDocument = serde_json::from_str(raw)
        .map_err(|err| StoreError::backend(format!("corrupt session document: {err}")))?;
    document.version = version as u64;
    Ok(document)
}

fn item_row(item: &PendingItem) -> (&'static str, &str, u64) {
    match item {
        PendingItem::Ledger(entry) => ("ledger", &entry.session_kind, entry.timestamp_ms),
        PendingItem::Usage(delta) => ("usage", &delta.session_kind, delta.timestamp_ms),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert(&self, mut document: SessionDocument) -> Result<SessionDocument, StoreError> {
        document.version = 1;
        let stored = document.clone();
        let stored = self
            .with_connection(move |conn| {
                let raw = encode(&document)?;
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO session_documents (session_id, version, document, updated_at_ms)
                         VALUES (?1, 1, ?2, ?3)",
                        params![document.session_id, raw, document.updated_at_ms as i64],
                    )
                    .map_err(sql_error)?;
                if inserted == 0 {
                    return Err(StoreError::AlreadyExists(document.session_id));
                }
                Ok(stored)
            })
            .await?;

        self.feed.publish(SessionChange::Updated(stored.clone()));
        Ok(stored)
    }

    async fn read(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError> {
        let session_id = session_id.to_string();
        self.with_connection(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT document, version FROM session_documents WHERE session_id = ?1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_error)?;
            row.map(|(raw, version)| decode(&raw, version)).transpose()
        })
        .await
    }

    async fn compare_and_set(
        &self,
        mut document: SessionDocument,
        expected_version: u64,
    ) -> Result<SessionDocument, StoreError> {
        document.version = expected_version + 1;
        let stored = self
            .with_connection(move |conn| {
                let raw = encode(&document)?;
                let updated = conn
                    .execute(
                        "UPDATE session_documents SET version = ?1, document = ?2, updated_at_ms = ?3
                         WHERE session_id = ?4 AND version = ?5",
                        params![
                            document.version as i64,
                            raw,
                            document.updated_at_ms as i64,
                            document.session_id,
                            expected_version as i64
                        ],
                    )
                    .map_err(sql_error)?;

                if updated == 1 {
                    return Ok(document);
                }

                let found: Option<i64> = conn
                    .query_row(
                        "SELECT version FROM session_documents WHERE session_id = ?1",
                        params![document.session_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(sql_error)?;
                match found {
                    Some(found) => Err(StoreError::Conflict {
                        session_id: document.session_id,
                        expected: expected_version,
                        found: found as u64,
                    }),
                    None => Err(StoreError::NotFound(document.session_id)),
                }
            })
            .await?;

        self.feed.publish(SessionChange::Updated(stored.clone()));
        Ok(stored)
    }

    async fn remove(&self, session_id: &str) -> Result<bool, StoreError> {
        let owned = session_id.to_string();
        let removed = self
            .with_connection(move |conn| {
                conn.execute(
                    "DELETE FROM session_documents WHERE session_id = ?1",
                    params![owned],
                )
                .map(|deleted| deleted > 0)
                .map_err(sql_error)
            })
            .await?;

        if removed {
            self.feed.publish(SessionChange::Removed {
                session_id: session_id.to_string(),
            });
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<SessionDocument>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT document, version FROM session_documents ORDER BY session_id")
                .map_err(sql_error)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(sql_error)?;

            let mut documents = Vec::new();
            for row in rows {
                let (raw, version) = row.map_err(sql_error)?;
                documents.push(decode(&raw, version)?);
            }
            Ok(documents)
        })
        .await
    }

    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionChange> {
        self.feed.subscribe(session_id)
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn append_batch(&self, batch: &[PendingItem]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let batch = batch.to_vec();
        let written = self
            .with_connection(move |conn| {
                let tx = conn.transaction().map_err(sql_error)?;
                let mut written = 0;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT OR IGNORE INTO ledger_items
                                (entry_id, participant_id, session_kind, item_kind, payload, timestamp_ms)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        )
                        .map_err(sql_error)?;

                    for item in &batch {
                        let payload = serde_json::to_string(item).map_err(|err| {
                            StoreError::backend(format!("failed to encode ledger item: {err}"))
                        })?;
                        let (kind, session_kind, timestamp_ms) = item_row(item);
                        written += stmt
                            .execute(params![
                                item.entry_id().to_string(),
                                item.participant_id(),
                                session_kind,
                                kind,
                                payload,
                                timestamp_ms as i64
                            ])
                            .map_err(sql_error)?;
                    }
                }
                tx.commit().map_err(sql_error)?;
                Ok(written)
            })
            .await?;

        debug!(target: STORE_TARGET, written, "ledger batch appended");
        Ok(written)
    }

    async fn history(
        &self,
        participant_id: &str,
        session_kind: &str,
    ) -> Result<LedgerHistory, StoreError> {
        let participant_id = participant_id.to_string();
        let session_kind = session_kind.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT payload FROM ledger_items
                     WHERE participant_id = ?1 AND session_kind = ?2
                     ORDER BY seq",
                )
                .map_err(sql_error)?;
            let rows = stmt
                .query_map(params![participant_id, session_kind], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(sql_error)?;

            let mut history = LedgerHistory::default();
            for row in rows {
                let raw = row.map_err(sql_error)?;
                let item: PendingItem = serde_json::from_str(&raw).map_err(|err| {
                    StoreError::backend(format!("corrupt ledger item: {err}"))
                })?;
                match item {
                    PendingItem::Ledger(entry) => history.entries.push(entry),
                    PendingItem::Usage(delta) => history.usage.push(delta),
                }
            }
            Ok(history)
        })
        .await
    }
}
