//! Trade record persistence
//! Keyed upsert over a JSON-lines file or an SQLite table
//!
//! Each trade is written once at entry and updated in place at exit, so both
//! backends key records by trade_id and keep insertion order for reads.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::TradeRecord;

/// Keyed trade storage
pub trait TradeStore: Send {
    /// Insert a new record or replace the one with the same trade_id
    fn upsert(&mut self, record: &TradeRecord) -> Result<()>;

    fn get(&self, trade_id: &str) -> Result<Option<TradeRecord>>;

    /// All records in insertion order
    fn all(&self) -> Result<Vec<TradeRecord>>;
}

// =============================================================================
// JSON lines
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredLine {
    trade_id: String,
    trade_data: TradeRecord,
}

/// A line of the trade file as read from disk.
///
/// Lines that do not parse as the current record schema are kept verbatim so
/// a rewrite puts them back exactly as they were.
#[derive(Debug)]
enum Line {
    Record(StoredLine),
    Raw(String),
}

impl Line {
    fn record(&self) -> Option<&StoredLine> {
        match self {
            Line::Record(stored) => Some(stored),
            Line::Raw(_) => None,
        }
    }
}

/// One `{"trade_id", "trade_data"}` object per line.
///
/// New trades are appended. Updating an existing trade rewrites the whole file
/// through a temporary file and a rename. Unreadable lines survive rewrites.
pub struct JsonlTradeStore {
    path: PathBuf,
}

impl JsonlTradeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        info!("JSONL trade store initialized: {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<Line>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        let mut lines = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredLine>(&line) {
                Ok(stored) => lines.push(Line::Record(stored)),
                Err(e) => {
                    warn!("Skipping unreadable trade line {} in {}: {}", n + 1, self.path.display(), e);
                    lines.push(Line::Raw(line));
                }
            }
        }
        Ok(lines)
    }

    fn records(&self) -> Result<impl Iterator<Item = StoredLine>> {
        Ok(self.read_lines()?.into_iter().filter_map(|line| match line {
            Line::Record(stored) => Some(stored),
            Line::Raw(_) => None,
        }))
    }

    fn append(&self, line: &StoredLine) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(line)?)?;
        file.sync_all()?;
        Ok(())
    }

    fn rewrite(&self, lines: &[Line]) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            for line in lines {
                match line {
                    Line::Record(stored) => writeln!(file, "{}", serde_json::to_string(stored)?)?,
                    Line::Raw(raw) => writeln!(file, "{}", raw)?,
                }
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl TradeStore for JsonlTradeStore {
    fn upsert(&mut self, record: &TradeRecord) -> Result<()> {
        let mut lines = self.read_lines()?;
        let stored = StoredLine {
            trade_id: record.trade_id.clone(),
            trade_data: record.clone(),
        };

        let existing = lines
            .iter()
            .position(|l| l.record().is_some_and(|s| s.trade_id == record.trade_id));
        match existing {
            Some(idx) => {
                lines[idx] = Line::Record(stored);
                self.rewrite(&lines)?;
                debug!("Updated trade record {}", record.trade_id);
            }
            None => {
                self.append(&stored)?;
                debug!("Appended trade record {}", record.trade_id);
            }
        }
        Ok(())
    }

    fn get(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        Ok(self
            .records()?
            .find(|l| l.trade_id == trade_id)
            .map(|l| l.trade_data))
    }

    fn all(&self) -> Result<Vec<TradeRecord>> {
        Ok(self.records()?.map(|l| l.trade_data).collect())
    }
}

// =============================================================================
// SQLite
// =============================================================================

/// Trade records in a keyed SQLite table, serialized as JSON documents
pub struct SqliteTradeStore {
    conn: Connection,
}

impl SqliteTradeStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                closed INTEGER NOT NULL DEFAULT 0,
                trade_data TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp)",
            [],
        )?;

        info!("SQLite trade store initialized: {}", db_path.display());
        Ok(Self { conn })
    }
}

impl TradeStore for SqliteTradeStore {
    fn upsert(&mut self, record: &TradeRecord) -> Result<()> {
        let data = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO trades (trade_id, symbol, timestamp, closed, trade_data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(trade_id) DO UPDATE SET
                closed = excluded.closed,
                trade_data = excluded.trade_data,
                updated_at = CURRENT_TIMESTAMP",
            params![
                record.trade_id,
                record.symbol.as_str(),
                record.timestamp.to_rfc3339(),
                record.is_closed(),
                data,
            ],
        )?;
        debug!("Upserted trade record {}", record.trade_id);
        Ok(())
    }

    fn get(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT trade_data FROM trades WHERE trade_id = ?1",
                params![trade_id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|d| serde_json::from_str(&d).context("Corrupt trade record"))
            .transpose()
    }

    fn all(&self) -> Result<Vec<TradeRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT trade_data FROM trades ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let data = row?;
            match serde_json::from_str(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable trade row: {}", e),
            }
        }
        Ok(records)
    }
}
