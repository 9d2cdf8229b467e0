use rusqlite::{Connection, Result};
use tracing::{debug, info};

/// SQLite schema version of the snapshot file
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the snapshot schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version = schema_version(conn)?;
    debug!("Current snapshot schema version: {}", current_version);

    if current_version < SCHEMA_VERSION {
        info!("Creating snapshot schema v{}", SCHEMA_VERSION);
        apply_migrations(conn, current_version)?;
    }

    Ok(())
}

/// Highest applied schema version, 0 for a fresh database
pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=SCHEMA_VERSION {
        if version == 1 {
            create_v1_schema(conn)?;
        }
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }
    Ok(())
}

fn create_v1_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS snapshot_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            seq INTEGER PRIMARY KEY,
            uri TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            parse_duration_ms INTEGER NOT NULL,
            has_errors INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS namespaces (
            file_seq INTEGER NOT NULL REFERENCES files(seq) ON DELETE CASCADE,
            ordinal INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (file_seq, ordinal)
        );

        CREATE TABLE IF NOT EXISTS symbols (
            file_seq INTEGER NOT NULL REFERENCES files(seq) ON DELETE CASCADE,
            namespace_ordinal INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            fqn TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            namespace TEXT NOT NULL,
            container TEXT,
            start_line INTEGER NOT NULL,
            start_character INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            end_character INTEGER NOT NULL,
            PRIMARY KEY (file_seq, namespace_ordinal, ordinal)
        );

        CREATE TABLE IF NOT EXISTS definitions (
            file_seq INTEGER NOT NULL REFERENCES files(seq) ON DELETE CASCADE,
            ordinal INTEGER NOT NULL,
            fqn TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            container TEXT,
            start_line INTEGER NOT NULL,
            start_character INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            end_character INTEGER NOT NULL,
            signature TEXT,
            documentation TEXT,
            parents TEXT NOT NULL,
            PRIMARY KEY (file_seq, ordinal)
        );

        CREATE INDEX IF NOT EXISTS idx_definitions_fqn ON definitions(fqn);

        CREATE TABLE IF NOT EXISTS symbol_references (
            file_seq INTEGER NOT NULL REFERENCES files(seq) ON DELETE CASCADE,
            ordinal INTEGER NOT NULL,
            fqn TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            start_character INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            end_character INTEGER NOT NULL,
            fallback TEXT,
            PRIMARY KEY (file_seq, ordinal)
        );

        CREATE INDEX IF NOT EXISTS idx_references_fqn ON symbol_references(fqn);",
    )
}
