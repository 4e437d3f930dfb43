//! Database schema for index_queue.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, Index, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Index Queue Table - Version 0
// =============================================================================

/// Pending and in-flight re-index jobs.
const INDEX_QUEUE_TABLE_V0: Table = Table {
    name: "index_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("object_id", &SqlType::Integer, non_null = true),
        sqlite_column!("object_type", &SqlType::Text, non_null = true),
        sqlite_column!("start_time", &SqlType::Integer),
        sqlite_column!("status", &SqlType::Text, non_null = true),
    ],
    indices: &[
        // Enqueue deduplication: a second queued row for the same object is
        // rejected, while a running row may coexist with a fresh queued one.
        Index {
            name: "idx_index_queue_queued_object",
            columns: "object_id, object_type",
            unique: true,
            predicate: Some("status = 'queued'"),
        },
        Index {
            name: "idx_index_queue_status_start",
            columns: "status, start_time",
            unique: false,
            predicate: None,
        },
        Index {
            name: "idx_index_queue_type_status",
            columns: "object_type, status",
            unique: false,
            predicate: None,
        },
    ],
};

// =============================================================================
// Index Queue Table - Version 1
// =============================================================================

/// Adds `claimed_at`, the time a job went `running`, so jobs stranded by a
/// crashed or failed dispatch can be found and returned to the queue.
const INDEX_QUEUE_TABLE_V1: Table = Table {
    name: "index_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("object_id", &SqlType::Integer, non_null = true),
        sqlite_column!("object_type", &SqlType::Text, non_null = true),
        sqlite_column!("start_time", &SqlType::Integer),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("claimed_at", &SqlType::Integer),
    ],
    indices: INDEX_QUEUE_TABLE_V0.indices,
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE index_queue ADD COLUMN claimed_at INTEGER", [])?;
    Ok(())
}

pub const INDEX_QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[INDEX_QUEUE_TABLE_V0],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[INDEX_QUEUE_TABLE_V1],
        migration: Some(migrate_v0_to_v1),
    },
];
