// On-disk index snapshots

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, Row};
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{init_schema, schema_version, SCHEMA_VERSION};
use super::{Definition, File, Namespace, Position, Range, Reference, Symbol, SymbolKind};

/// Bumped whenever the meaning of stored records changes
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A whole-repository copy, files in insertion order
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub files: Vec<File>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot at {0}")]
    Missing(PathBuf),
    #[error("snapshot format {found} is not supported (expected {expected})")]
    Incompatible { found: u32, expected: u32 },
    #[error("snapshot is unreadable: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for SnapshotError {
    fn from(err: rusqlite::Error) -> Self {
        SnapshotError::Corrupt(err.to_string())
    }
}

/// SQLite file holding one snapshot
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write the snapshot next to the target, then move it into place
    pub fn save(&self, snapshot: &IndexSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("tmp");
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }

        {
            let mut conn = Connection::open(&tmp)
                .with_context(|| format!("Failed to open snapshot: {}", tmp.display()))?;
            init_schema(&conn)?;

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO snapshot_meta (key, value) VALUES ('format_version', ?1), ('created_at', ?2)",
                params![snapshot.version.to_string(), snapshot.created_at.to_rfc3339()],
            )?;
            for (seq, file) in snapshot.files.iter().enumerate() {
                write_file(&tx, seq as i64, file)?;
            }
            tx.commit()?;
        }

        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move snapshot into {}", self.path.display()))?;
        info!("Saved snapshot of {} files to {}", snapshot.files.len(), self.path.display());
        Ok(())
    }

    pub fn load(&self) -> Result<IndexSnapshot, SnapshotError> {
        if !self.exists() {
            return Err(SnapshotError::Missing(self.path.clone()));
        }

        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let schema = schema_version(&conn)?;
        if schema != SCHEMA_VERSION {
            return Err(SnapshotError::Incompatible {
                found: schema.max(0) as u32,
                expected: SCHEMA_VERSION as u32,
            });
        }

        let version: u32 = meta(&conn, "format_version")?
            .parse()
            .map_err(|_| SnapshotError::Corrupt("bad format_version".to_string()))?;
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::Incompatible {
                found: version,
                expected: SNAPSHOT_FORMAT_VERSION,
            });
        }
        let created_at = DateTime::parse_from_rfc3339(&meta(&conn, "created_at")?)
            .map_err(|err| SnapshotError::Corrupt(err.to_string()))?
            .with_timezone(&Utc);

        let files = read_files(&conn)?;
        debug!("Loaded snapshot of {} files from {}", files.len(), self.path.display());
        Ok(IndexSnapshot {
            version,
            created_at,
            files,
        })
    }
}

fn meta(conn: &Connection, key: &str) -> Result<String, SnapshotError> {
    Ok(conn.query_row(
        "SELECT value FROM snapshot_meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )?)
}

fn write_file(conn: &Connection, seq: i64, file: &File) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO files (seq, uri, content_hash, parse_duration_ms, has_errors)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            seq,
            file.uri,
            file.content_hash,
            file.parse_duration_ms as i64,
            file.has_errors
        ],
    )?;

    let mut namespace_stmt =
        conn.prepare_cached("INSERT INTO namespaces (file_seq, ordinal, name) VALUES (?1, ?2, ?3)")?;
    let mut symbol_stmt = conn.prepare_cached(
        "INSERT INTO symbols (file_seq, namespace_ordinal, ordinal, fqn, name, kind, namespace, container,
            start_line, start_character, end_line, end_character)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for (ns_ordinal, namespace) in file.namespaces.iter().enumerate() {
        namespace_stmt.execute(params![seq, ns_ordinal as i64, namespace.name])?;
        for (ordinal, symbol) in namespace.symbols.iter().enumerate() {
            symbol_stmt.execute(params![
                seq,
                ns_ordinal as i64,
                ordinal as i64,
                symbol.fqn,
                symbol.name,
                symbol.kind.as_str(),
                symbol.namespace,
                symbol.container,
                symbol.range.start.line,
                symbol.range.start.character,
                symbol.range.end.line,
                symbol.range.end.character,
            ])?;
        }
    }

    let mut definition_stmt = conn.prepare_cached(
        "INSERT INTO definitions (file_seq, ordinal, fqn, name, kind, container,
            start_line, start_character, end_line, end_character, signature, documentation, parents)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?;
    for (ordinal, definition) in file.definitions.iter().enumerate() {
        definition_stmt.execute(params![
            seq,
            ordinal as i64,
            definition.fqn,
            definition.name,
            definition.kind.as_str(),
            definition.container,
            definition.range.start.line,
            definition.range.start.character,
            definition.range.end.line,
            definition.range.end.character,
            definition.signature,
            definition.documentation,
            serde_json::to_string(&definition.parents)?,
        ])?;
    }

    let mut reference_stmt = conn.prepare_cached(
        "INSERT INTO symbol_references (file_seq, ordinal, fqn,
            start_line, start_character, end_line, end_character, fallback)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (ordinal, reference) in file.references.iter().enumerate() {
        reference_stmt.execute(params![
            seq,
            ordinal as i64,
            reference.fqn,
            reference.range.start.line,
            reference.range.start.character,
            reference.range.end.line,
            reference.range.end.character,
            reference.fallback,
        ])?;
    }

    Ok(())
}

fn range_at(row: &Row, first: usize) -> rusqlite::Result<Range> {
    Ok(Range::new(
        Position::new(row.get(first)?, row.get(first + 1)?),
        Position::new(row.get(first + 2)?, row.get(first + 3)?),
    ))
}

fn kind_at(row: &Row, index: usize) -> rusqlite::Result<SymbolKind> {
    let value: String = row.get(index)?;
    SymbolKind::from_str(&value)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.into()))
}

fn read_files(conn: &Connection) -> Result<Vec<File>, SnapshotError> {
    let mut files: BTreeMap<i64, File> = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT seq, uri, content_hash, parse_duration_ms, has_errors FROM files ORDER BY seq",
    )?;
    let rows = stmt.query_map([], |row| {
        let seq: i64 = row.get(0)?;
        let duration: i64 = row.get(3)?;
        Ok((
            seq,
            File {
                uri: row.get(1)?,
                content_hash: row.get(2)?,
                parse_duration_ms: duration.max(0) as u64,
                has_errors: row.get(4)?,
                namespaces: Vec::new(),
                definitions: Vec::new(),
                references: Vec::new(),
            },
        ))
    })?;
    for row in rows {
        let (seq, file) = row?;
        files.insert(seq, file);
    }

    let mut stmt = conn.prepare("SELECT file_seq, name FROM namespaces ORDER BY file_seq, ordinal")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (seq, name) = row?;
        owning(&mut files, seq)?.namespaces.push(Namespace {
            name,
            symbols: Vec::new(),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT file_seq, namespace_ordinal, fqn, name, kind, namespace, container,
            start_line, start_character, end_line, end_character
         FROM symbols ORDER BY file_seq, namespace_ordinal, ordinal",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            Symbol {
                fqn: row.get(2)?,
                name: row.get(3)?,
                kind: kind_at(row, 4)?,
                namespace: row.get(5)?,
                container: row.get(6)?,
                range: range_at(row, 7)?,
            },
        ))
    })?;
    for row in rows {
        let (seq, ns_ordinal, symbol) = row?;
        let file = owning(&mut files, seq)?;
        match file.namespaces.get_mut(ns_ordinal.max(0) as usize) {
            Some(namespace) => namespace.symbols.push(symbol),
            None => {
                return Err(SnapshotError::Corrupt(format!(
                    "symbol {} has no namespace",
                    symbol.fqn
                )))
            }
        }
    }

    let mut stmt = conn.prepare(
        "SELECT file_seq, fqn, name, kind, container,
            start_line, start_character, end_line, end_character, signature, documentation, parents
         FROM definitions ORDER BY file_seq, ordinal",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            kind_at(row, 3)?,
            row.get::<_, Option<String>>(4)?,
            range_at(row, 5)?,
            row.get::<_, Option<String>>(9)?,
            row.get::<_, Option<String>>(10)?,
            row.get::<_, String>(11)?,
        ))
    })?;
    for row in rows {
        let (seq, fqn, name, kind, container, range, signature, documentation, parents) = row?;
        let parents: Vec<String> =
            serde_json::from_str(&parents).map_err(|err| SnapshotError::Corrupt(err.to_string()))?;
        let file = owning(&mut files, seq)?;
        let uri = file.uri.clone();
        file.definitions.push(Definition {
            fqn,
            name,
            kind,
            uri,
            range,
            container,
            signature,
            documentation,
            parents,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT file_seq, fqn, start_line, start_character, end_line, end_character, fallback
         FROM symbol_references ORDER BY file_seq, ordinal",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            range_at(row, 2)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;
    for row in rows {
        let (seq, fqn, range, fallback) = row?;
        let file = owning(&mut files, seq)?;
        let uri = file.uri.clone();
        file.references.push(Reference {
            fqn,
            uri,
            range,
            fallback,
        });
    }

    Ok(files.into_values().collect())
}

fn owning(files: &mut BTreeMap<i64, File>, seq: i64) -> Result<&mut File, SnapshotError> {
    files
        .get_mut(&seq)
        .ok_or_else(|| SnapshotError::Corrupt(format!("row refers to missing file {}", seq)))
}
