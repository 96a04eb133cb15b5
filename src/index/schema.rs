use rusqlite::{params, Connection, OptionalExtension, Result};
use tracing::{debug, info};

/// Store schema version. Any mismatch on open recreates the store from scratch.
pub const SCHEMA_VERSION: i64 = 3;

/// Reserved key in the meta partition holding the schema version
pub const SCHEMA_VERSION_KEY: &[u8] = b"__schema_version";

/// Logical partitions of the store, one table each
pub const PARTITION_TABLES: &[&str] = &["meta", "files", "packages", "declarations", "file_declarations"];

/// Read the schema version marker, `None` when the store is empty or foreign
pub fn read_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meta')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(None);
    }

    let raw: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let version = raw
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| text.trim().parse::<i64>().ok());

    debug!("Stored schema version: {:?}", version);
    Ok(version)
}

/// Create every partition table and stamp the schema version
pub fn init_schema(conn: &Connection) -> Result<()> {
    info!("Initializing kindex store schema v{}", SCHEMA_VERSION);

    // Ordered byte keys: WITHOUT ROWID keeps each partition clustered on its key
    for table in PARTITION_TABLES {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key BLOB PRIMARY KEY,
                    value BLOB NOT NULL
                ) WITHOUT ROWID",
                table
            ),
            [],
        )?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_string().into_bytes()],
    )?;

    Ok(())
}

/// Drop all partition tables
pub fn drop_schema(conn: &Connection) -> Result<()> {
    info!("Dropping all store partitions");

    for table in PARTITION_TABLES {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
    }

    Ok(())
}
