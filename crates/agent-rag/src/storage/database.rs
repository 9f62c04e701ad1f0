//! SQLite memory store
//!
//! Durable storage for ingested documents and their fragments. Every worker
//! opens its own connection; WAL mode lets several of them write to the same
//! file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::StoreConnection;
use crate::error::{Error, Result};
use crate::types::{Document, Fragment, Provenance};

use super::memory_store::{MemoryRecord, MemoryStore, MemoryTable, StoreConnector};

/// Database file created inside an embedded data directory
pub const DATABASE_FILE: &str = "knowledge.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed memory store
#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
    location: String,
}

impl SqliteMemoryStore {
    /// Create or open the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::store_write(format!("Failed to open database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            location: path.as_ref().display().to_string(),
        };

        store.migrate()?;
        Ok(store)
    }

    /// Create a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::store_write(format!("Failed to open in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            location: ":memory:".to_string(),
        };

        store.migrate()?;
        Ok(store)
    }

    /// Where the database lives, for logging
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.busy_timeout(BUSY_TIMEOUT)?;

        // journal_mode returns a row, so it goes through query_row
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#,
        )?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                correlation_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                content TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                page_count INTEGER,
                provenance TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_correlation
                ON documents(agent_id, correlation_id);

            CREATE TABLE IF NOT EXISTS fragments (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                content TEXT NOT NULL,
                char_start INTEGER NOT NULL,
                char_end INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_fragments_document
                ON fragments(agent_id, document_id, position);
        "#,
        )?;

        Ok(())
    }

    /// Insert a document, returning its new store ID
    pub fn insert_document(&self, doc: &Document) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock();

        conn.execute(
            r#"INSERT INTO documents
                (id, correlation_id, agent_id, tenant_id, filename, content_type, content,
                 byte_size, content_hash, page_count, provenance, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                id.to_string(),
                doc.correlation_id.to_string(),
                doc.agent_id.to_string(),
                doc.tenant_id.to_string(),
                doc.filename,
                doc.content_type,
                doc.text,
                doc.byte_size as i64,
                doc.content_hash,
                doc.page_count.map(i64::from),
                doc.provenance.as_str(),
                doc.created_at.to_rfc3339(),
            ],
        )?;

        Ok(id)
    }

    /// Insert a fragment, returning its new store ID
    pub fn insert_fragment(&self, fragment: &Fragment) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock();

        conn.execute(
            r#"INSERT INTO fragments
                (id, agent_id, tenant_id, document_id, position, content, char_start, char_end, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                id.to_string(),
                fragment.agent_id.to_string(),
                fragment.tenant_id.to_string(),
                fragment.document_id.to_string(),
                fragment.position as i64,
                fragment.text,
                fragment.char_start as i64,
                fragment.char_end as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(id)
    }

    /// Get a document by store ID
    pub fn find_document(&self, store_id: Uuid) -> Result<Option<Document>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS))?;
        let doc = stmt
            .query_row(params![store_id.to_string()], row_to_document)
            .optional()?;

        Ok(doc)
    }

    /// Documents stored under a correlation ID, oldest first
    pub fn find_documents_by_correlation(
        &self,
        agent_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<Document>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM documents WHERE agent_id = ?1 AND correlation_id = ?2 ORDER BY created_at, rowid",
            DOCUMENT_COLUMNS
        ))?;
        let docs = stmt
            .query_map(
                params![agent_id.to_string(), correlation_id.to_string()],
                row_to_document,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(docs)
    }

    /// Fragments referencing a correlation ID, ordered by position
    pub fn find_fragments(&self, agent_id: Uuid, correlation_id: Uuid) -> Result<Vec<Fragment>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"SELECT document_id, position, content, char_start, char_end, agent_id, tenant_id
               FROM fragments WHERE agent_id = ?1 AND document_id = ?2
               ORDER BY position, rowid"#,
        )?;
        let fragments = stmt
            .query_map(
                params![agent_id.to_string(), correlation_id.to_string()],
                row_to_fragment,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(fragments)
    }

    /// Row counts for (documents, fragments)
    pub fn counts(&self) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let documents: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let fragments: i64 = conn.query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))?;
        Ok((documents as usize, fragments as usize))
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn create_memory(&self, record: &MemoryRecord, table: MemoryTable) -> Result<Uuid> {
        if record.table() != table {
            return Err(Error::store_write(format!(
                "cannot write a {} record into '{}'",
                record.table(),
                table
            )));
        }

        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || match &record {
            MemoryRecord::Document(doc) => store.insert_document(doc),
            MemoryRecord::Fragment(fragment) => store.insert_fragment(fragment),
        })
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn get_document(&self, store_id: Uuid) -> Result<Option<Document>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.find_document(store_id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn documents_by_correlation(
        &self,
        agent_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<Document>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.find_documents_by_correlation(agent_id, correlation_id)
        })
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn fragments_for_document(
        &self,
        agent_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<Fragment>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.find_fragments(agent_id, correlation_id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

/// Opens a fresh [`SqliteMemoryStore`] connection per worker. In-memory
/// connection strings all share one database, opened on first use and kept
/// alive by the connector and its clones.
#[derive(Clone, Default)]
pub struct SqliteConnector {
    memory: Arc<OnceCell<SqliteMemoryStore>>,
}

impl SqliteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a connection descriptor to a database location.
    /// `None` means the connector's in-memory database.
    pub fn database_path(connection: &StoreConnection) -> Result<Option<PathBuf>> {
        match connection {
            StoreConnection::Embedded { data_dir } => Ok(Some(data_dir.join(DATABASE_FILE))),
            StoreConnection::Remote { url } => {
                if url == "sqlite::memory:" || url == "sqlite://:memory:" {
                    return Ok(None);
                }
                match url.strip_prefix("sqlite://") {
                    Some(path) if !path.is_empty() => Ok(Some(PathBuf::from(path))),
                    _ => Err(Error::Config(format!(
                        "unsupported store connection string '{}' (expected sqlite://<path>)",
                        url
                    ))),
                }
            }
        }
    }
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    async fn connect(
        &self,
        agent_id: Uuid,
        connection: &StoreConnection,
    ) -> Result<Arc<dyn MemoryStore>> {
        let store = match Self::database_path(connection)? {
            Some(path) => tokio::task::spawn_blocking(move || -> Result<SqliteMemoryStore> {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                SqliteMemoryStore::open(&path)
            })
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))??,
            None => self
                .memory
                .get_or_try_init(|| async {
                    tokio::task::spawn_blocking(SqliteMemoryStore::in_memory)
                        .await
                        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
                })
                .await?
                .clone(),
        };

        tracing::debug!("[{}] Opened memory store at {}", agent_id, store.location());
        Ok(Arc::new(store))
    }
}

const DOCUMENT_COLUMNS: &str = "id, correlation_id, agent_id, tenant_id, filename, content_type, \
     content, byte_size, content_hash, page_count, provenance, created_at";

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let id: String = row.get(0)?;
    let correlation_id: String = row.get(1)?;
    let agent_id: String = row.get(2)?;
    let tenant_id: String = row.get(3)?;
    let byte_size: i64 = row.get(7)?;
    let page_count: Option<i64> = row.get(9)?;
    let provenance: String = row.get(10)?;
    let created_at_str: String = row.get(11)?;

    Ok(Document {
        correlation_id: parse_uuid(1, &correlation_id)?,
        store_id: Some(parse_uuid(0, &id)?),
        agent_id: parse_uuid(2, &agent_id)?,
        tenant_id: parse_uuid(3, &tenant_id)?,
        filename: row.get(4)?,
        content_type: row.get(5)?,
        text: row.get(6)?,
        byte_size: byte_size as u64,
        content_hash: row.get(8)?,
        page_count: page_count.map(|p| p as u32),
        provenance: Provenance::parse(&provenance),
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_fragment(row: &rusqlite::Row) -> rusqlite::Result<Fragment> {
    let document_id: String = row.get(0)?;
    let position: i64 = row.get(1)?;
    let char_start: i64 = row.get(3)?;
    let char_end: i64 = row.get(4)?;
    let agent_id: String = row.get(5)?;
    let tenant_id: String = row.get(6)?;

    Ok(Fragment {
        document_id: parse_uuid(0, &document_id)?,
        position: position as u32,
        text: row.get(2)?,
        char_start: char_start as usize,
        char_end: char_end as usize,
        agent_id: parse_uuid(5, &agent_id)?,
        tenant_id: parse_uuid(6, &tenant_id)?,
    })
}
