//! Database schema for object_cache.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, Index, SqlType, Table, VersionedSchema};

// =============================================================================
// Object Cache Table - Version 0
// =============================================================================

/// Short-lived integer values grouped by concern, with an optional expiry.
const OBJECT_CACHE_TABLE_V0: Table = Table {
    name: "object_cache",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("cache_group", &SqlType::Text, non_null = true),
        sqlite_column!("cache_key", &SqlType::Text, non_null = true),
        sqlite_column!("value", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer),
    ],
    indices: &[
        Index {
            name: "idx_object_cache_group_key",
            columns: "cache_group, cache_key",
            unique: true,
            predicate: None,
        },
        Index {
            name: "idx_object_cache_expires_at",
            columns: "expires_at",
            unique: false,
            predicate: None,
        },
    ],
};

pub const OBJECT_CACHE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[OBJECT_CACHE_TABLE_V0],
    migration: None,
}];
