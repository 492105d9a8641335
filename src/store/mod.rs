mod annotations;
mod builder;
mod cache;
mod registry;
mod schema;
mod segmentations;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde_json::Value;

pub use builder::segmentation_table_name;
pub use cache::{TableHandle, TableKind};

use crate::config::{DEFAULT_INSERT_LIMIT, DbConfig};
use crate::error::{Error, Result};
use crate::schema::{Column, ColumnType, SchemaCatalog};
use cache::TableCache;
use schema::SCHEMA;

/// Context object owning the database connection, the schema catalog handle
/// and a process-local cache of resolved table layouts.
///
/// Every mutation method runs inside one transaction: either all of its
/// writes commit or none do, and the transaction is released on every exit
/// path.
pub struct AnnotationDb {
    conn: Mutex<Connection>,
    catalog: Arc<dyn SchemaCatalog>,
    cache: Mutex<TableCache>,
    insert_limit: usize,
}

impl AnnotationDb {
    pub fn new<P: AsRef<Path>>(db_path: P, catalog: Arc<dyn SchemaCatalog>) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
            catalog,
            cache: Mutex::new(TableCache::new()),
            insert_limit: DEFAULT_INSERT_LIMIT,
        })
    }

    pub fn with_config(config: &DbConfig, catalog: Arc<dyn SchemaCatalog>) -> Result<Self> {
        let mut db = Self::new(config.db_path(), catalog)?;
        db.insert_limit = config.insert_limit;
        Ok(db)
    }

    /// Creates the always-present metadata catalog relations.
    pub fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        tracing::info!("annotation metadata catalog initialized");
        Ok(())
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn catalog(&self) -> &dyn SchemaCatalog {
        self.catalog.as_ref()
    }

    pub(crate) fn insert_limit(&self) -> usize {
        self.insert_limit
    }

    /// Drops a memoized table layout. The cache is keyed by name only, so a
    /// caller that drops a table and recreates it under the same name with a
    /// different schema must invalidate explicitly.
    pub fn invalidate_cached_table(&self, table_name: &str) {
        self.cache().invalidate(table_name);
    }

    pub(crate) fn cache(&self) -> std::sync::MutexGuard<'_, TableCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(|e| e.into_inner());
        conn.close().map_err(|(_, e)| Error::Database(e))
    }
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Converts one JSON field value to its SQL representation for the given
/// column. Geometry values are persisted as JSON `[x, y, z]` text.
pub(crate) fn json_to_sql(column: &Column, value: &Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;

    if value.is_null() {
        return Ok(Sql::Null);
    }
    let invalid = |reason: &str| Error::InvalidFieldValue {
        column: column.name.clone(),
        reason: reason.to_string(),
    };
    match column.column_type {
        ColumnType::Integer | ColumnType::BigInt => value
            .as_i64()
            .map(Sql::Integer)
            .ok_or_else(|| invalid("expected an integer")),
        ColumnType::Float => value
            .as_f64()
            .map(Sql::Real)
            .ok_or_else(|| invalid("expected a number")),
        ColumnType::Text | ColumnType::Timestamp => value
            .as_str()
            .map(|s| Sql::Text(s.to_string()))
            .ok_or_else(|| invalid("expected a string")),
        ColumnType::Boolean => value
            .as_bool()
            .map(|b| Sql::Integer(b as i64))
            .ok_or_else(|| invalid("expected a boolean")),
        ColumnType::Geometry => {
            if !value.is_array() {
                return Err(invalid("expected a coordinate array"));
            }
            Ok(Sql::Text(value.to_string()))
        }
    }
}

/// Converts one stored SQL value back to JSON for the given column.
pub(crate) fn sql_to_json(column: &Column, value: ValueRef<'_>) -> Result<Value> {
    let invalid = |reason: String| Error::InvalidFieldValue {
        column: column.name.clone(),
        reason,
    };
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => match column.column_type {
            ColumnType::Boolean => Ok(Value::Bool(i != 0)),
            _ => Ok(Value::from(i)),
        },
        ValueRef::Real(f) => Ok(Value::from(f)),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| invalid(e.to_string()))?;
            match column.column_type {
                ColumnType::Geometry => {
                    serde_json::from_str(text).map_err(|e| invalid(e.to_string()))
                }
                _ => Ok(Value::from(text)),
            }
        }
        ValueRef::Blob(_) => Err(invalid("unexpected blob value".to_string())),
    }
}
