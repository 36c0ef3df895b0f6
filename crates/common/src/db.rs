//! SQLite database for Divisora desired state

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const COLUMNS: &str =
    "id, name, spec, status, labels, annotations, created_at, updated_at, generation";

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let mut batch = String::new();
        for table in ["nodes", "images", "users", "networks", "cubicles"] {
            batch.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    spec TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'null',
                    labels TEXT NOT NULL DEFAULT '{{}}',
                    annotations TEXT NOT NULL DEFAULT '{{}}',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    generation INTEGER NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(name);
                "#
            ));
        }
        batch.push_str(
            r#"
            CREATE INDEX IF NOT EXISTS idx_networks_node ON networks(json_extract(spec, '$.node_id'));
            CREATE INDEX IF NOT EXISTS idx_cubicles_node ON cubicles(json_extract(spec, '$.node_id'));
            "#,
        );
        conn.execute_batch(&batch)?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Generic CRUD operations
    // ========================================================================

    /// Insert a resource
    pub fn insert<S: serde::Serialize, T: serde::Serialize>(
        &self,
        table: &str,
        id: &str,
        name: &str,
        spec: &S,
        status: &T,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        Self::insert_in(&conn, table, id, name, spec, status, labels)
    }

    /// Insert a resource on an already locked connection or open transaction
    pub fn insert_in<S: serde::Serialize, T: serde::Serialize>(
        conn: &Connection,
        table: &str,
        id: &str,
        name: &str,
        spec: &S,
        status: &T,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            &format!(
                "INSERT INTO {} (id, name, spec, status, labels, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                table
            ),
            params![
                id,
                name,
                serde_json::to_string(spec)?,
                serde_json::to_string(status)?,
                serde_json::to_string(labels)?,
                now,
                now,
            ],
        )?;

        debug!("Inserted {} with id {}", table, id);
        Ok(())
    }

    /// Replace the spec of a resource
    pub fn update_spec<S: serde::Serialize>(&self, table: &str, id: &str, spec: &S) -> Result<bool> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        let rows = conn.execute(
            &format!(
                "UPDATE {} SET spec = ?1, updated_at = ?2, generation = generation + 1 WHERE id = ?3",
                table
            ),
            params![serde_json::to_string(spec)?, now, id],
        )?;

        debug!("Updated {} spec with id {}", table, id);
        Ok(rows > 0)
    }

    /// Read-modify-write the status of a resource inside one transaction.
    ///
    /// Returns `false` when no row has the given id.
    pub fn modify_status<T, F>(&self, table: &str, id: &str, f: F) -> Result<bool>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce(&mut T),
    {
        self.with_transaction(|tx| {
            let raw: Option<String> = tx
                .query_row(
                    &format!("SELECT status FROM {} WHERE id = ?1", table),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(raw) = raw else {
                return Ok(false);
            };

            let mut status: T = serde_json::from_str(&raw)?;
            f(&mut status);

            tx.execute(
                &format!("UPDATE {} SET status = ?1, updated_at = ?2 WHERE id = ?3", table),
                params![
                    serde_json::to_string(&status)?,
                    chrono::Utc::now().timestamp(),
                    id
                ],
            )?;
            Ok(true)
        })
    }

    /// Run `f` inside a transaction. The transaction commits when `f`
    /// returns `Ok` and rolls back otherwise; the connection lock is held
    /// for the whole closure and released on return.
    pub fn with_transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Get a resource by ID
    pub fn get<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<ResourceRow<S, T>>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM {} WHERE id = ?1", COLUMNS, table),
                params![id],
                RawRow::from_row,
            )
            .optional()?;

        row.map(RawRow::parse).transpose()
    }

    /// Get a resource by name
    pub fn get_by_name<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        name: &str,
    ) -> Result<Option<ResourceRow<S, T>>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM {} WHERE name = ?1", COLUMNS, table),
                params![name],
                RawRow::from_row,
            )
            .optional()?;

        row.map(RawRow::parse).transpose()
    }

    /// List all resources in insertion order
    pub fn list<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
    ) -> Result<Vec<ResourceRow<S, T>>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid ASC",
            COLUMNS, table
        ))?;

        let rows = stmt.query_map([], RawRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }

        Ok(results)
    }

    /// List resources whose spec has `field` equal to `value`
    pub fn list_where<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<ResourceRow<S, T>>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE json_extract(spec, ?1) = ?2 ORDER BY rowid ASC",
            COLUMNS, table
        ))?;

        let rows = stmt.query_map(params![format!("$.{}", field), value], RawRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }

        Ok(results)
    }

    /// Check if a name is taken
    pub fn name_exists(&self, table: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE name = ?1", table),
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Raw database row before parsing
struct RawRow {
    id: String,
    name: String,
    spec: String,
    status: String,
    labels: String,
    annotations: String,
    created_at: i64,
    updated_at: i64,
    generation: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            id: row.get(0)?,
            name: row.get(1)?,
            spec: row.get(2)?,
            status: row.get(3)?,
            labels: row.get(4)?,
            annotations: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            generation: row.get(8)?,
        })
    }

    fn parse<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        self,
    ) -> Result<ResourceRow<S, T>> {
        Ok(ResourceRow {
            id: self.id,
            name: self.name,
            spec: serde_json::from_str(&self.spec)?,
            status: serde_json::from_str(&self.status)?,
            labels: serde_json::from_str(&self.labels)?,
            annotations: serde_json::from_str(&self.annotations)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            generation: self.generation,
        })
    }
}

/// Parsed resource row
#[derive(Debug, Clone)]
pub struct ResourceRow<S, T> {
    pub id: String,
    pub name: String,
    pub spec: S,
    pub status: T,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub generation: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestSpec {
        node_id: String,
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct TestStatus {
        hits: u32,
    }

    fn insert(db: &Database, id: &str, node_id: &str) {
        db.insert(
            "cubicles",
            id,
            &format!("name-{}", id),
            &TestSpec { node_id: node_id.to_string() },
            &TestStatus::default(),
            &HashMap::new(),
        )
        .unwrap();
    }

    #[test]
    fn test_crud() {
        let db = Database::open_memory().unwrap();
        insert(&db, "a", "n1");
        insert(&db, "b", "n2");
        insert(&db, "c", "n1");

        let row: ResourceRow<TestSpec, TestStatus> = db.get("cubicles", "a").unwrap().unwrap();
        assert_eq!(row.name, "name-a");
        assert_eq!(row.spec.node_id, "n1");

        let rows: Vec<ResourceRow<TestSpec, TestStatus>> = db.list("cubicles").unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let rows: Vec<ResourceRow<TestSpec, TestStatus>> =
            db.list_where("cubicles", "node_id", "n1").unwrap();
        assert_eq!(rows.len(), 2);

        assert!(db.name_exists("cubicles", "name-b").unwrap());
        assert!(!db.name_exists("cubicles", "name-z").unwrap());

        let by_name: Option<ResourceRow<TestSpec, TestStatus>> =
            db.get_by_name("cubicles", "name-c").unwrap();
        assert_eq!(by_name.unwrap().id, "c");
    }

    #[test]
    fn test_modify_status() {
        let db = Database::open_memory().unwrap();
        insert(&db, "a", "n1");

        assert!(db
            .modify_status::<TestStatus, _>("cubicles", "a", |s| s.hits += 2)
            .unwrap());
        let row: ResourceRow<TestSpec, TestStatus> = db.get("cubicles", "a").unwrap().unwrap();
        assert_eq!(row.status.hits, 2);

        assert!(!db
            .modify_status::<TestStatus, _>("cubicles", "missing", |s| s.hits += 1)
            .unwrap());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::open_memory().unwrap();
        insert(&db, "a", "n1");

        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute("DELETE FROM cubicles WHERE id = 'a'", [])?;
            Err(crate::Error::not_found("cubicle", "a"))
        });
        assert!(result.is_err());

        let row: Option<ResourceRow<TestSpec, TestStatus>> = db.get("cubicles", "a").unwrap();
        assert!(row.is_some());
    }
}
