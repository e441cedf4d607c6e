// 📒 Download Ledger - append-only audit trail of fetch / clean actions
//
// Entries are never updated or deleted. The newest `fetch` entry decides
// whether the cached CSV is still fresh. Timestamps are stored as fixed-width
// RFC 3339 UTC so text ordering matches time ordering.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

// ============================================================================
// ACTION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerAction {
    Fetch,
    Clean,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAction::Fetch => "fetch",
            LedgerAction::Clean => "clean",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fetch" => Some(LedgerAction::Fetch),
            "clean" => Some(LedgerAction::Clean),
            _ => None,
        }
    }
}

// ============================================================================
// LEDGER ENTRY
// ============================================================================

/// One immutable fetch-or-clean record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Row id, `None` until appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub recorded_at: DateTime<Utc>,

    /// Human-readable size, e.g. "12.40 MB"
    pub size_label: String,

    pub file_path: PathBuf,

    /// Source URL for fetches, the cleaned path for clean actions
    pub source: String,

    /// Snapshot of the category filter in effect ("----" for clean actions)
    pub categories: String,

    pub action: LedgerAction,

    /// Import run that produced the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// SHA-256 of the file at the time of the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl LedgerEntry {
    /// Entry for a finished download
    pub fn fetch(file_path: &Path, source_url: &str, categories: &str, size_bytes: u64) -> Self {
        LedgerEntry {
            id: None,
            recorded_at: Utc::now(),
            size_label: human_size(size_bytes),
            file_path: file_path.to_path_buf(),
            source: source_url.to_string(),
            categories: categories.to_string(),
            action: LedgerAction::Fetch,
            run_id: None,
            checksum: None,
        }
    }

    /// Entry for a finished sanitize pass
    pub fn clean(file_path: &Path, size_bytes: u64) -> Self {
        LedgerEntry {
            id: None,
            recorded_at: Utc::now(),
            size_label: human_size(size_bytes),
            file_path: file_path.to_path_buf(),
            source: file_path.display().to_string(),
            categories: "----".to_string(),
            action: LedgerAction::Clean,
            run_id: None,
            checksum: None,
        }
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    /// Whole seconds between this entry and `now` (negative if in the future)
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.recorded_at).num_seconds()
    }

    pub fn file_exists(&self) -> bool {
        self.file_path.is_file()
    }
}

/// Size in MiB with two decimals
pub fn human_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// Hex SHA-256 of a file's contents
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// LEDGER STORE
// ============================================================================

pub struct DownloadLedger {
    conn: Connection,
}

impl DownloadLedger {
    /// Wrap a connection, creating the table if needed
    pub fn new(conn: Connection) -> Result<Self> {
        setup_ledger(&conn)?;
        Ok(DownloadLedger { conn })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger database {}", path.display()))?;
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Durable insert; returns the entry with its id filled in
    pub fn append(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        self.conn
            .execute(
                "INSERT INTO ledger_entries (
                    recorded_at, size_label, file_path, source, categories,
                    action, run_id, checksum
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    entry.size_label,
                    entry.file_path.to_string_lossy().into_owned(),
                    entry.source,
                    entry.categories,
                    entry.action.as_str(),
                    entry.run_id,
                    entry.checksum,
                ],
            )
            .context("Failed to append ledger entry")?;

        let mut stored = entry.clone();
        stored.id = Some(self.conn.last_insert_rowid());
        Ok(stored)
    }

    /// Newest entry, optionally restricted to one action kind
    pub fn most_recent(&self, action: Option<LedgerAction>) -> Result<Option<LedgerEntry>> {
        let entry = match action {
            Some(action) => self
                .conn
                .query_row(
                    &format!("{} WHERE action = ?1 ORDER BY recorded_at DESC, id DESC LIMIT 1", SELECT_ENTRY),
                    params![action.as_str()],
                    entry_from_row,
                )
                .optional()?,
            None => self
                .conn
                .query_row(
                    &format!("{} ORDER BY recorded_at DESC, id DESC LIMIT 1", SELECT_ENTRY),
                    [],
                    entry_from_row,
                )
                .optional()?,
        };

        Ok(entry)
    }

    /// Newest-first listing for audit display
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} ORDER BY recorded_at DESC, id DESC LIMIT ?1",
            SELECT_ENTRY
        ))?;

        let entries = stmt
            .query_map(params![limit as i64], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    pub fn count(&self) -> Result<i64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count)
    }
}

const SELECT_ENTRY: &str = "SELECT id, recorded_at, size_label, file_path, source, categories,
        action, run_id, checksum
     FROM ledger_entries";

fn setup_ledger(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_at TEXT NOT NULL,
            size_label TEXT NOT NULL,
            file_path TEXT NOT NULL,
            source TEXT NOT NULL,
            categories TEXT NOT NULL,
            action TEXT NOT NULL,
            run_id TEXT,
            checksum TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_action_time ON ledger_entries(action, recorded_at)",
        [],
    )?;

    Ok(())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let recorded_at_str: String = row.get(1)?;
    let file_path: String = row.get(3)?;
    let action_str: String = row.get(6)?;

    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    let action = LedgerAction::parse(&action_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown ledger action: {}", action_str).into(),
        )
    })?;

    Ok(LedgerEntry {
        id: Some(row.get(0)?),
        recorded_at,
        size_label: row.get(2)?,
        file_path: PathBuf::from(file_path),
        source: row.get(4)?,
        categories: row.get(5)?,
        action,
        run_id: row.get(7)?,
        checksum: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_append_and_most_recent() {
        let ledger = DownloadLedger::open_in_memory().unwrap();
        let now = Utc::now();

        let old = LedgerEntry::fetch(Path::new("/tmp/a.csv"), "https://x", "", 10)
            .with_recorded_at(now - Duration::seconds(600));
        let newer = LedgerEntry::fetch(Path::new("/tmp/b.csv"), "https://x", "", 20)
            .with_recorded_at(now - Duration::seconds(60));
        let clean = LedgerEntry::clean(Path::new("/tmp/b.csv"), 19).with_recorded_at(now);

        ledger.append(&old).unwrap();
        let stored = ledger.append(&newer).unwrap();
        ledger.append(&clean).unwrap();

        assert!(stored.id.is_some());
        assert_eq!(ledger.count().unwrap(), 3);

        let latest = ledger.most_recent(None).unwrap().unwrap();
        assert_eq!(latest.action, LedgerAction::Clean);
        assert_eq!(latest.categories, "----");

        let latest_fetch = ledger.most_recent(Some(LedgerAction::Fetch)).unwrap().unwrap();
        assert_eq!(latest_fetch.file_path, PathBuf::from("/tmp/b.csv"));
        assert_eq!(latest_fetch.age_seconds(now), 60);

        println!("✅ Ledger append/most_recent test PASSED");
    }

    #[test]
    fn test_empty_ledger() {
        let ledger = DownloadLedger::open_in_memory().unwrap();
        assert!(ledger.most_recent(None).unwrap().is_none());
        assert!(ledger.most_recent(Some(LedgerAction::Fetch)).unwrap().is_none());
        assert!(ledger.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_recent_is_newest_first() {
        let ledger = DownloadLedger::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            let entry = LedgerEntry::fetch(Path::new(&format!("/tmp/{}.csv", i)), "u", "", 0)
                .with_recorded_at(now - Duration::seconds(100 - i))
                .with_run_id("run-1");
            ledger.append(&entry).unwrap();
        }

        let entries = ledger.recent(3).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].file_path, PathBuf::from("/tmp/4.csv"));
        assert_eq!(entries[2].file_path, PathBuf::from("/tmp/2.csv"));
        assert_eq!(entries[0].run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_human_size_and_checksum() {
        assert_eq!(human_size(0), "0.00 MB");
        assert_eq!(human_size(1024 * 1024 * 3 / 2), "1.50 MB");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.csv");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
