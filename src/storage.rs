//! SQLite-backed request ledger and price table.

use crate::cost::ModelPrice;
use crate::error::{ProxyError, Result};
use crate::ledger::{EntryId, LedgerEntry, NewEntry, PriceRow, PriceStore, RequestLedger, ResponseRecord};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    client_addr TEXT NOT NULL,
    request_headers TEXT NOT NULL,
    request_body TEXT NOT NULL,
    request_type TEXT NOT NULL,
    model TEXT NOT NULL,
    is_streaming INTEGER NOT NULL,
    processing_time_ms INTEGER NOT NULL DEFAULT 0,
    response_status INTEGER NOT NULL DEFAULT 0,
    response_headers TEXT NOT NULL DEFAULT '',
    response_body TEXT NOT NULL DEFAULT '',
    additional_params TEXT NOT NULL,
    usage TEXT,
    cost REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_request_logs_request_id ON request_logs(request_id);
CREATE TABLE IF NOT EXISTS model_prices (
    model_name TEXT PRIMARY KEY,
    input_price REAL NOT NULL,
    output_price REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const ENTRY_COLUMNS: &str = "id, request_id, started_at, ended_at, client_addr, request_headers, \
     request_body, request_type, model, is_streaming, processing_time_ms, response_status, \
     response_headers, response_body, additional_params, usage, cost";

#[derive(Clone)]
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories as needed.
    pub fn open(database_path: impl AsRef<Path>) -> Result<Self> {
        let path = database_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ProxyError::storage(format!(
                        "Failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(path)?;
        tracing::info!("Database initialized at: {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let started_at: String = row.get(2)?;
    let ended_at: Option<String> = row.get(3)?;
    let status: i64 = row.get(11)?;

    Ok(LedgerEntry {
        id: row.get(0)?,
        request_id: row.get(1)?,
        started_at: parse_time(2, &started_at)?,
        ended_at: ended_at.as_deref().map(|t| parse_time(3, t)).transpose()?,
        client_addr: row.get(4)?,
        request_headers: row.get(5)?,
        request_body: row.get(6)?,
        request_type: row.get(7)?,
        model: row.get(8)?,
        is_streaming: row.get(9)?,
        processing_time_ms: row.get(10)?,
        response_status: u16::try_from(status).unwrap_or_default(),
        response_headers: row.get(12)?,
        response_body: row.get(13)?,
        additional_params: row.get(14)?,
        usage: row.get(15)?,
        cost: row.get(16)?,
    })
}

#[async_trait]
impl RequestLedger for SqliteStore {
    async fn create(&self, entry: NewEntry) -> Result<EntryId> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO request_logs (
                request_id, started_at, client_addr, request_headers, request_body,
                request_type, model, is_streaming, additional_params
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.request_id,
                Utc::now().to_rfc3339(),
                entry.client_addr,
                entry.request_headers,
                entry.request_body,
                entry.request_type,
                entry.model,
                entry.is_streaming,
                entry.additional_params,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update(&self, id: EntryId, record: ResponseRecord) -> Result<()> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE request_logs SET
                response_status = ?1,
                response_headers = ?2,
                response_body = ?3,
                processing_time_ms = ?4,
                ended_at = ?5,
                usage = COALESCE(?6, usage),
                cost = COALESCE(?7, cost)
             WHERE id = ?8",
            params![
                i64::from(record.status),
                record.headers,
                record.body,
                record.elapsed_ms,
                Utc::now().to_rfc3339(),
                record.usage,
                record.cost,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(ProxyError::storage(format!("No ledger entry with id {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        let conn = self.connection.lock().await;
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM request_logs WHERE id = ?1"),
                [id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    async fn list(&self, offset: u64, limit: u64) -> Result<(Vec<LedgerEntry>, u64)> {
        let conn = self.connection.lock().await;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM request_logs", [], |r| r.get(0))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM request_logs ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(
            params![
                i64::try_from(limit).unwrap_or(i64::MAX),
                i64::try_from(offset).unwrap_or(i64::MAX)
            ],
            entry_from_row,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok((entries, u64::try_from(total).unwrap_or_default()))
    }
}

#[async_trait]
impl PriceStore for SqliteStore {
    async fn get_price(&self, model: &str) -> Result<Option<ModelPrice>> {
        let conn = self.connection.lock().await;
        let price = conn
            .query_row(
                "SELECT model_name, input_price, output_price FROM model_prices WHERE model_name = ?1",
                [model],
                |row| {
                    Ok(ModelPrice {
                        model_name: row.get(0)?,
                        input_price: row.get(1)?,
                        output_price: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(price)
    }

    async fn list_prices(&self) -> Result<Vec<PriceRow>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT model_name, input_price, output_price, created_at FROM model_prices ORDER BY model_name",
        )?;
        let rows = stmt.query_map([], |row| {
            let created_at: String = row.get(3)?;
            Ok(PriceRow {
                price: ModelPrice {
                    model_name: row.get(0)?,
                    input_price: row.get(1)?,
                    output_price: row.get(2)?,
                },
                created_at: parse_time(3, &created_at)?,
            })
        })?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn upsert_price(&self, price: &ModelPrice) -> Result<()> {
        let conn = self.connection.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO model_prices (model_name, input_price, output_price, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(model_name) DO UPDATE SET
                input_price = excluded.input_price,
                output_price = excluded.output_price,
                updated_at = excluded.updated_at",
            params![price.model_name, price.input_price, price.output_price, now],
        )?;
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        let conn = self.connection.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM model_prices", [], |r| r.get(0))?;
        Ok(count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(model: &str) -> NewEntry {
        NewEntry {
            request_id: crate::ledger::new_request_id(),
            client_addr: "127.0.0.1:5000".to_string(),
            request_headers: "{}".to_string(),
            request_body: "{\"model\":\"m\"}".to_string(),
            request_type: "anthropic".to_string(),
            model: model.to_string(),
            is_streaming: false,
            additional_params: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_then_update_entry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.create(new_entry("claude-3")).await.unwrap();

        let created = store.get(id).await.unwrap().unwrap();
        assert_eq!(created.model, "claude-3");
        assert_eq!(created.response_status, 0);
        assert!(created.ended_at.is_none());
        assert!(created.usage.is_none());

        store
            .update(
                id,
                ResponseRecord {
                    status: 200,
                    headers: "{}".to_string(),
                    body: "Streaming response".to_string(),
                    elapsed_ms: 0,
                    usage: None,
                    cost: None,
                },
            )
            .await
            .unwrap();
        store
            .update(
                id,
                ResponseRecord {
                    status: 200,
                    headers: "{}".to_string(),
                    body: "Hello world".to_string(),
                    elapsed_ms: 42,
                    usage: Some(r#"{"input_tokens":2,"output_tokens":2}"#.to_string()),
                    cost: Some(0.5),
                },
            )
            .await
            .unwrap();

        let done = store.get(id).await.unwrap().unwrap();
        assert_eq!(done.response_status, 200);
        assert_eq!(done.response_body, "Hello world");
        assert_eq!(done.processing_time_ms, 42);
        assert_eq!(done.cost, 0.5);
        assert!(done.ended_at.is_some());
        assert_eq!(done.parsed_usage().unwrap().input_tokens, 2);
    }

    #[tokio::test]
    async fn test_update_without_usage_keeps_previous_usage() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.create(new_entry("m")).await.unwrap();
        store
            .update(
                id,
                ResponseRecord {
                    status: 200,
                    usage: Some("{}".to_string()),
                    cost: Some(1.0),
                    ..ResponseRecord::default()
                },
            )
            .await
            .unwrap();
        store
            .update(
                id,
                ResponseRecord {
                    status: 500,
                    body: "boom".to_string(),
                    ..ResponseRecord::default()
                },
            )
            .await
            .unwrap();

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.response_status, 500);
        assert_eq!(entry.usage.as_deref(), Some("{}"));
        assert_eq!(entry.cost, 1.0);
    }

    #[tokio::test]
    async fn test_update_unknown_entry_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.update(99, ResponseRecord::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_paged() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.create(new_entry(&format!("m{i}"))).await.unwrap();
        }

        let (page, total) = store.list(0, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(
            page.iter().map(|e| e.model.as_str()).collect::<Vec<_>>(),
            vec!["m4", "m3"]
        );

        let (last, _) = store.list(4, 2).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].model, "m0");
    }

    #[tokio::test]
    async fn test_price_upsert_and_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.is_empty().await.unwrap());
        assert!(store.get_price("gpt-4").await.unwrap().is_none());

        let mut price = ModelPrice {
            model_name: "gpt-4".to_string(),
            input_price: 0.00003,
            output_price: 0.00006,
        };
        store.upsert_price(&price).await.unwrap();
        price.output_price = 0.00009;
        store.upsert_price(&price).await.unwrap();

        assert!(!store.is_empty().await.unwrap());
        assert_eq!(store.get_price("gpt-4").await.unwrap(), Some(price));
        assert_eq!(store.list_prices().await.unwrap().len(), 1);
        // Exact-name match only.
        assert!(store.get_price("GPT-4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.is_empty().await.unwrap());
    }
}
