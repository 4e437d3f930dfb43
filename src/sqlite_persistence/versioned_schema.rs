use anyhow::{bail, Context, Result};
use rusqlite::{params, types::Type, Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub const BASE_DB_VERSION: usize = 99999;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // Allow unused_mut because the variable is only mutated when optional
            // field assignments are passed to the macro (e.g., `is_primary_key = true`)
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Blob => "BLOB",
        }
    }
}

pub struct Column<'a, S: AsRef<str>> {
    pub name: S,
    pub sql_type: &'a SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<S>,
}

/// An index on a table. `predicate` turns it into a partial index, which is
/// how "at most one row in state X per key" constraints are expressed.
pub struct Index {
    pub name: &'static str,
    pub columns: &'static str,
    pub unique: bool,
    pub predicate: Option<&'static str>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column<'static, &'static str>],
    pub indices: &'static [Index],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let columns_sql = self
            .columns
            .iter()
            .map(|column| {
                let mut sql = format!("{} {}", column.name, column.sql_type.as_sql());
                if column.is_primary_key {
                    sql.push_str(" PRIMARY KEY");
                }
                if column.non_null {
                    sql.push_str(" NOT NULL");
                }
                if let Some(default_value) = column.default_value {
                    sql.push_str(&format!(" DEFAULT {}", default_value));
                }
                sql
            })
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!("CREATE TABLE {} ({});", self.name, columns_sql),
            params![],
        )?;

        for index in self.indices {
            let mut sql = format!(
                "CREATE {}INDEX {} ON {}({})",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                self.name,
                index.columns
            );
            if let Some(predicate) = index.predicate {
                sql.push_str(&format!(" WHERE {}", predicate));
            }
            conn.execute(&sql, params![])?;
        }
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual_columns = stmt
            .query_map(params![], |row| {
                let sql_type = match row.get::<_, String>(2)?.as_str() {
                    "TEXT" => &SqlType::Text,
                    "INTEGER" => &SqlType::Integer,
                    "REAL" => &SqlType::Real,
                    "BLOB" => &SqlType::Blob,
                    _ => {
                        return Err(rusqlite::Error::InvalidColumnType(
                            2,
                            "".to_string(),
                            Type::Text,
                        ))
                    }
                };
                Ok(Column {
                    name: row.get::<_, String>(1)?,
                    sql_type,
                    non_null: row.get::<_, i32>(3)? == 1,
                    default_value: row.get::<_, Option<String>>(4)?,
                    is_primary_key: row.get::<_, i32>(5)? == 1,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read columns of table {}", self.name))?;

        if actual_columns.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {}",
                self.name,
                actual_columns.len(),
                self.columns.len()
            );
        }

        for (actual, expected) in actual_columns.iter().zip(self.columns.iter()) {
            if actual.name != expected.name {
                bail!(
                    "Table {} Column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    actual.name
                );
            }
            if actual.sql_type != expected.sql_type {
                bail!(
                    "Table {} Column {} type mismatch: expected {:?}, got {:?}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    actual.sql_type
                );
            }
            if actual.non_null != expected.non_null {
                bail!(
                    "Table {} Column {} non-null mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.non_null,
                    actual.non_null
                );
            }
            if actual.is_primary_key != expected.is_primary_key {
                bail!(
                    "Table {} Column {} primary key mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.is_primary_key,
                    actual.is_primary_key
                );
            }
            // Default values might be wrapped in parentheses
            if actual.default_value.as_deref().map(strip_parentheses)
                != expected.default_value.map(strip_parentheses)
            {
                bail!(
                    "Table {} Column {} default value mismatch: expected {:?}, got {:?}",
                    self.name,
                    expected.name,
                    expected.default_value,
                    actual.default_value
                );
            }
        }

        // PRAGMA index_list returns: seq, name, unique, origin, partial
        let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", self.name))?;
        let actual_indices: Vec<(String, bool, bool)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)? == 1,
                    row.get::<_, i32>(4)? == 1,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for index in self.indices {
            match actual_indices.iter().find(|(name, _, _)| name == index.name) {
                None => bail!("Table {} is missing index '{}'", self.name, index.name),
                Some((_, unique, partial)) => {
                    if *unique != index.unique || *partial != index.predicate.is_some() {
                        bail!(
                            "Table {} index '{}' has unexpected shape (unique={}, partial={})",
                            self.name,
                            index.name,
                            unique,
                            partial
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn strip_parentheses(s: &str) -> String {
    if s.starts_with('(') && s.ends_with(')') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

/// Open (or create) a database governed by `schemas`, validating the stored
/// version's layout and running any pending migrations.
pub fn open_versioned(
    db_path: &Path,
    schemas: &'static [VersionedSchema],
    label: &str,
) -> Result<Connection> {
    let latest = schemas.last().context("No schemas defined")?;

    if !db_path.exists() {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to create {} database", label))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        latest.create(&conn)?;
        info!("Created new {} database at {:?}", label, db_path);
        return Ok(conn);
    }

    let mut conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open {} database", label))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let db_version = conn
        .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
        .context("Failed to read database version")?
        - BASE_DB_VERSION as i64;
    if db_version < 0 {
        bail!(
            "{} database version {} is too old, does not contain base db version {}",
            label,
            db_version,
            BASE_DB_VERSION
        );
    }
    let version = db_version as usize;

    let schema = schemas
        .iter()
        .find(|s| s.version == version)
        .with_context(|| format!("Unknown {} database version {}", label, version))?;
    schema
        .validate(&conn)
        .with_context(|| format!("{} database schema validation failed", label))?;

    if version < latest.version {
        info!(
            "Migrating {} database from version {} to {}",
            label, version, latest.version
        );
        let tx = conn.transaction()?;
        for schema in schemas.iter().filter(|s| s.version > version) {
            if let Some(migration_fn) = schema.migration {
                migration_fn(&tx).with_context(|| {
                    format!("Failed to run migration to version {}", schema.version)
                })?;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest.version),
            [],
        )?;
        tx.commit()?;
    }

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_column;
    use tempfile::TempDir;

    const TEST_TABLE: Table = Table {
        name: "test_table",
        columns: &[
            sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
            sqlite_column!("key", &SqlType::Text, non_null = true),
            sqlite_column!("state", &SqlType::Text, non_null = true),
        ],
        indices: &[Index {
            name: "idx_test_key_active",
            columns: "key",
            unique: true,
            predicate: Some("state = 'active'"),
        }],
    };

    const TEST_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
        version: 0,
        tables: &[TEST_TABLE],
        migration: None,
    }];

    #[test]
    fn test_partial_unique_index_only_applies_to_predicate_rows() {
        let conn = Connection::open_in_memory().unwrap();
        TEST_SCHEMAS[0].create(&conn).unwrap();

        conn.execute(
            "INSERT INTO test_table (key, state) VALUES ('a', 'active')",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO test_table (key, state) VALUES ('a', 'idle')", [])
            .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO test_table (key, state) VALUES ('a', 'active')",
            [],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_validate_detects_missing_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE test_table (id INTEGER PRIMARY KEY, key TEXT NOT NULL, state TEXT NOT NULL)",
            [],
        )
        .unwrap();

        let err = TEST_SCHEMAS[0].validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing index"));
        assert!(err.contains("idx_test_key_active"));
    }

    #[test]
    fn test_validate_detects_non_partial_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE test_table (id INTEGER PRIMARY KEY, key TEXT NOT NULL, state TEXT NOT NULL)",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE UNIQUE INDEX idx_test_key_active ON test_table(key)",
            [],
        )
        .unwrap();

        let err = TEST_SCHEMAS[0].validate(&conn).unwrap_err().to_string();
        assert!(err.contains("unexpected shape"));
    }

    #[test]
    fn test_open_versioned_creates_then_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");

        {
            let conn = open_versioned(&path, TEST_SCHEMAS, "test").unwrap();
            conn.execute(
                "INSERT INTO test_table (key, state) VALUES ('a', 'active')",
                [],
            )
            .unwrap();
        }

        let conn = open_versioned(&path, TEST_SCHEMAS, "test").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM test_table", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_versioned_rejects_foreign_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("foreign.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE other (id INTEGER)", []).unwrap();
        }

        let result = open_versioned(&path, TEST_SCHEMAS, "test");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("too old"));
    }
}
