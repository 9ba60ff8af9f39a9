//! Per-cycle data archive
//!
//! Optional CSV record of what each cycle saw and decided: base timeframe
//! bars, the indicator snapshot, the prompt with the raw reply and its parsed
//! form, and every order sent. Files are split per symbol and UTC day under
//! `market_data/`, `indicators/`, `decisions/` and `trades/`.
//!
//! Archiving never stops trading. Callers log write failures and move on.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use csv::WriterBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::broker::{OrderReceipt, OrderRequest};
use crate::decision::{DecisionError, TradeDecision};
use crate::indicators::IndicatorSnapshot;
use crate::{Candle, Symbol, Timeframe};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub data_dir: PathBuf,
    /// Also dump the full bar window every cycle
    pub save_market_data: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("data/archive"),
            save_market_data: false,
        }
    }
}

/// Archive subdirectory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    MarketData,
    Indicators,
    Decisions,
    Trades,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 4] = [
        ArchiveKind::MarketData,
        ArchiveKind::Indicators,
        ArchiveKind::Decisions,
        ArchiveKind::Trades,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            ArchiveKind::MarketData => "market_data",
            ArchiveKind::Indicators => "indicators",
            ArchiveKind::Decisions => "decisions",
            ArchiveKind::Trades => "trades",
        }
    }

    /// Tag between symbol and date in daily file names
    fn file_tag(self) -> &'static str {
        match self {
            ArchiveKind::MarketData => "bars",
            ArchiveKind::Indicators => "indicators",
            ArchiveKind::Decisions => "decisions",
            ArchiveKind::Trades => "trades",
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRow {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for BarRow {
    fn from(bar: &Candle) -> Self {
        Self {
            time: bar.datetime,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// One indicator snapshot, flat so it maps onto CSV columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub price: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub sma_fast: f64,
    pub sma_slow: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub atr: f64,
}

impl IndicatorRow {
    fn new(timestamp: DateTime<Utc>, symbol: &Symbol, price: f64, s: &IndicatorSnapshot) -> Self {
        Self {
            timestamp,
            symbol: symbol.to_string(),
            price,
            rsi: s.rsi,
            macd: s.macd,
            macd_signal: s.macd_signal,
            macd_histogram: s.macd_histogram,
            bb_upper: s.bb_upper,
            bb_middle: s.bb_middle,
            bb_lower: s.bb_lower,
            sma_fast: s.sma_fast,
            sma_slow: s.sma_slow,
            ema_fast: s.ema_fast,
            ema_slow: s.ema_slow,
            stoch_k: s.stoch_k,
            stoch_d: s.stoch_d,
            atr: s.atr,
        }
    }
}

/// Prompt, raw reply and either the parsed decision or why it was refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRow {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub prompt: String,
    pub response: String,
    pub action: Option<String>,
    pub volume: Option<f64>,
    pub stop_loss_pips: Option<f64>,
    pub take_profit_pips: Option<f64>,
    pub reasoning: Option<String>,
    pub error: Option<String>,
}

impl DecisionRow {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Order sent to the broker and what came back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: String,
    pub requested_volume: f64,
    pub sl: f64,
    pub tp: f64,
    pub magic: u64,
    pub success: bool,
    pub ticket: Option<u64>,
    pub filled_volume: Option<f64>,
    pub price: Option<f64>,
    pub retcode: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub files: usize,
    pub bytes: u64,
}

impl DirectoryStats {
    pub fn size_mb(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageStats {
    pub enabled: bool,
    pub data_dir: PathBuf,
    pub directories: Vec<(&'static str, DirectoryStats)>,
}

impl StorageStats {
    pub fn total(&self) -> DirectoryStats {
        self.directories
            .iter()
            .fold(DirectoryStats::default(), |acc, (_, d)| DirectoryStats {
                files: acc.files + d.files,
                bytes: acc.bytes + d.bytes,
            })
    }
}

// =============================================================================
// Archive
// =============================================================================

pub struct DataArchive {
    config: ArchiveConfig,
}

impl DataArchive {
    pub fn new(config: ArchiveConfig) -> Self {
        if config.enabled {
            info!("Data archive enabled: {}", config.data_dir.display());
        } else {
            debug!("Data archive disabled");
        }
        Self { config }
    }

    fn dir(&self, kind: ArchiveKind) -> PathBuf {
        self.config.data_dir.join(kind.dir_name())
    }

    fn daily_path(&self, kind: ArchiveKind, symbol: &str, day: DateTime<Utc>) -> PathBuf {
        self.dir(kind).join(format!(
            "{}_{}_{}.csv",
            symbol,
            kind.file_tag(),
            day.format("%Y%m%d")
        ))
    }

    /// Append rows to `path`, writing the header only when the file is new
    fn append_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let need_header = file.metadata().map_or(true, |m| m.len() == 0);

        let mut writer = WriterBuilder::new().has_headers(need_header).from_writer(file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Full bar window, one file per call
    pub fn save_market_data(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        bars: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>> {
        if !self.config.enabled || !self.config.save_market_data || bars.is_empty() {
            return Ok(None);
        }
        let path = self.dir(ArchiveKind::MarketData).join(format!(
            "{}_{}_{}.csv",
            symbol,
            timeframe,
            now.format("%Y%m%d_%H%M%S")
        ));
        let rows: Vec<BarRow> = bars.iter().map(BarRow::from).collect();
        Self::append_rows(&path, &rows)?;
        debug!("Market data saved: {}", path.display());
        Ok(Some(path))
    }

    pub fn save_indicators(
        &self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        price: f64,
        snapshot: &IndicatorSnapshot,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let path = self.daily_path(ArchiveKind::Indicators, symbol.as_str(), now);
        Self::append_rows(&path, &[IndicatorRow::new(now, symbol, price, snapshot)])
    }

    pub fn save_decision(
        &self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        prompt: &str,
        response: &str,
        decision: Result<&TradeDecision, &DecisionError>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut row = DecisionRow {
            timestamp: now,
            symbol: symbol.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            action: None,
            volume: None,
            stop_loss_pips: None,
            take_profit_pips: None,
            reasoning: None,
            error: None,
        };
        match decision {
            Ok(d) => {
                row.action = Some(d.action.as_str().to_string());
                row.volume = d.volume;
                row.stop_loss_pips = d.stop_loss_pips;
                row.take_profit_pips = d.take_profit_pips;
                row.reasoning = Some(d.reasoning.clone());
            }
            Err(e) => row.error = Some(e.to_string()),
        }
        let path = self.daily_path(ArchiveKind::Decisions, symbol.as_str(), now);
        Self::append_rows(&path, &[row])
    }

    pub fn save_execution(
        &self,
        now: DateTime<Utc>,
        request: &OrderRequest,
        result: Result<&OrderReceipt, String>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut row = ExecutionRow {
            timestamp: now,
            symbol: request.symbol.to_string(),
            action: request.side.as_str().to_string(),
            requested_volume: request.volume,
            sl: request.sl,
            tp: request.tp,
            magic: request.magic,
            success: result.is_ok(),
            ticket: None,
            filled_volume: None,
            price: None,
            retcode: None,
            message: String::new(),
        };
        match result {
            Ok(receipt) => {
                row.ticket = Some(receipt.ticket);
                row.filled_volume = Some(receipt.volume);
                row.price = Some(receipt.price);
                row.retcode = Some(receipt.retcode);
                row.message = receipt.comment.clone();
            }
            Err(message) => row.message = message,
        }
        let path = self.daily_path(ArchiveKind::Trades, request.symbol.as_str(), now);
        Self::append_rows(&path, &[row])
    }

    // =========================================================================
    // Reading back
    // =========================================================================

    /// Daily files of `kind` for the last `days` UTC days, oldest day first
    fn daily_files(
        &self,
        kind: ArchiveKind,
        symbol: Option<&Symbol>,
        now: DateTime<Utc>,
        days: i64,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        let mut files = Vec::new();
        for offset in (0..days.max(1)).rev() {
            let suffix = format!(
                "_{}_{}.csv",
                kind.file_tag(),
                (now - Duration::days(offset)).format("%Y%m%d")
            );
            files.extend(
                names
                    .iter()
                    .filter(|name| name.ends_with(&suffix))
                    .filter(|name| symbol.map_or(true, |s| name.strip_suffix(&suffix) == Some(s.as_str())))
                    .map(|name| dir.join(name)),
            );
        }
        Ok(files)
    }

    fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut rows = Vec::new();
        for (n, result) in reader.deserialize().enumerate() {
            match result {
                Ok(row) => rows.push(row),
                Err(e) => warn!("Skipping unreadable row {} in {}: {}", n + 1, path.display(), e),
            }
        }
        Ok(rows)
    }

    /// Indicator snapshots for `symbol` over the last `days` days, oldest first
    pub fn load_historical_indicators(
        &self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        days: i64,
    ) -> Result<Vec<IndicatorRow>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for path in self.daily_files(ArchiveKind::Indicators, Some(symbol), now, days)? {
            rows.extend(Self::read_rows::<IndicatorRow>(&path)?);
        }
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    /// Latest `limit` decisions, newest first
    pub fn recent_decisions(
        &self,
        symbol: Option<&Symbol>,
        now: DateTime<Utc>,
        days: i64,
        limit: usize,
    ) -> Result<Vec<DecisionRow>> {
        let mut rows = Vec::new();
        for path in self.daily_files(ArchiveKind::Decisions, symbol, now, days)? {
            rows.extend(Self::read_rows::<DecisionRow>(&path)?);
        }
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }

    /// Latest `limit` order attempts, newest first
    pub fn recent_executions(
        &self,
        symbol: Option<&Symbol>,
        now: DateTime<Utc>,
        days: i64,
        limit: usize,
    ) -> Result<Vec<ExecutionRow>> {
        let mut rows = Vec::new();
        for path in self.daily_files(ArchiveKind::Trades, symbol, now, days)? {
            rows.extend(Self::read_rows::<ExecutionRow>(&path)?);
        }
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }

    /// File count and size per archive directory
    pub fn storage_stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats {
            enabled: self.config.enabled,
            data_dir: self.config.data_dir.clone(),
            directories: Vec::new(),
        };
        if !self.config.enabled {
            return Ok(stats);
        }

        for kind in ArchiveKind::ALL {
            let dir = self.dir(kind);
            let mut entry_stats = DirectoryStats::default();
            if dir.exists() {
                for entry in fs::read_dir(&dir)
                    .with_context(|| format!("Failed to list {}", dir.display()))?
                {
                    let metadata = entry?.metadata()?;
                    if metadata.is_file() {
                        entry_stats.files += 1;
                        entry_stats.bytes += metadata.len();
                    }
                }
            }
            stats.directories.push((kind.dir_name(), entry_stats));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, Side};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn archive(dir: &TempDir) -> DataArchive {
        DataArchive::new(ArchiveConfig {
            enabled: true,
            data_dir: dir.path().join("archive"),
            save_market_data: true,
        })
    }

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, h, m, 0).unwrap()
    }

    fn snapshot(rsi: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi,
            macd: 0.00012,
            macd_signal: 0.00008,
            macd_histogram: 0.00004,
            bb_upper: 1.0870,
            bb_middle: 1.0850,
            bb_lower: 1.0830,
            sma_fast: 1.0850,
            sma_slow: 1.0800,
            ema_fast: 1.0855,
            ema_slow: 1.0848,
            stoch_k: 60.0,
            stoch_d: 55.0,
            atr: 0.0004,
        }
    }

    fn decision() -> TradeDecision {
        TradeDecision {
            action: Action::Buy,
            volume: Some(0.02),
            stop_loss_pips: None,
            take_profit_pips: None,
            reasoning: "uptrend, mid band, momentum rising".to_string(),
        }
    }

    fn request() -> OrderRequest {
        OrderRequest {
            symbol: Symbol::new("EURUSD"),
            side: Side::Buy,
            volume: 0.02,
            sl: 1.0836,
            tp: 1.0878,
            deviation: 10,
            magic: 123_457,
            comment: "fx-pilot buy".to_string(),
        }
    }

    #[test]
    fn test_indicators_append_to_daily_file() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        let eurusd = Symbol::new("EURUSD");

        archive.save_indicators(&eurusd, at(4, 23, 55), 1.0850, &snapshot(40.0)).unwrap();
        archive.save_indicators(&eurusd, at(5, 12, 5), 1.0855, &snapshot(55.0)).unwrap();
        archive.save_indicators(&eurusd, at(5, 12, 0), 1.0852, &snapshot(50.0)).unwrap();
        archive
            .save_indicators(&Symbol::new("GBPUSD"), at(5, 12, 0), 1.2650, &snapshot(70.0))
            .unwrap();

        let today = dir.path().join("archive/indicators/EURUSD_indicators_20240305.csv");
        let contents = fs::read_to_string(&today).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.starts_with("timestamp,symbol,price,rsi"));

        let rows = archive.load_historical_indicators(&eurusd, at(5, 13, 0), 2).unwrap();
        let rsi: Vec<f64> = rows.iter().map(|r| r.rsi).collect();
        assert_eq!(rsi, vec![40.0, 50.0, 55.0]);
        assert!(rows.iter().all(|r| r.symbol == "EURUSD"));

        let today_only = archive.load_historical_indicators(&eurusd, at(5, 13, 0), 1).unwrap();
        assert_eq!(today_only.len(), 2);
    }

    #[test]
    fn test_decisions_keep_prompt_response_and_errors() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        let eurusd = Symbol::new("EURUSD");
        let prompt = "EURUSD @ 1.0850\nRSI: 55.0";
        let reply = "Sure, here it is:\n{\"action\": \"buy\", \"reasoning\": \"x, y\"}";

        archive
            .save_decision(&eurusd, at(5, 12, 0), prompt, reply, Ok(&decision()))
            .unwrap();
        archive
            .save_decision(&eurusd, at(5, 12, 5), prompt, "no idea", Err(&DecisionError::NoJson))
            .unwrap();

        let rows = archive.recent_decisions(Some(&eurusd), at(5, 13, 0), 1, 10).unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].response, "no idea");
        assert!(!rows[0].is_valid());
        assert_eq!(rows[0].error.as_deref(), Some("no JSON object in response"));
        assert_eq!(rows[0].action, None);

        assert_eq!(rows[1].prompt, prompt);
        assert_eq!(rows[1].response, reply);
        assert_eq!(rows[1].action.as_deref(), Some("buy"));
        assert_eq!(rows[1].volume, Some(0.02));
        assert_eq!(rows[1].stop_loss_pips, None);

        let latest = archive.recent_decisions(None, at(5, 13, 0), 1, 1).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].timestamp, at(5, 12, 5));
    }

    #[test]
    fn test_executions_record_success_and_failure() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        let receipt = OrderReceipt {
            retcode: 10009,
            ticket: 7,
            volume: 0.02,
            price: 1.08503,
            comment: "done".to_string(),
        };

        archive.save_execution(at(5, 12, 0), &request(), Ok(&receipt)).unwrap();
        archive
            .save_execution(at(5, 12, 5), &request(), Err("market closed".to_string()))
            .unwrap();

        let rows = archive.recent_executions(None, at(5, 13, 0), 1, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].success);
        assert_eq!(rows[0].message, "market closed");
        assert_eq!(rows[0].ticket, None);
        assert!(rows[1].success);
        assert_eq!(rows[1].ticket, Some(7));
        assert_eq!(rows[1].action, "buy");
    }

    #[test]
    fn test_storage_stats_counts_files() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        let eurusd = Symbol::new("EURUSD");
        let bars: Vec<Candle> = (0..3)
            .map(|i| Candle {
                datetime: at(5, 12, i * 5),
                open: 1.085,
                high: 1.086,
                low: 1.084,
                close: 1.0855,
                volume: 100.0,
            })
            .collect();

        let path = archive
            .save_market_data(&eurusd, Timeframe::M5, &bars, at(5, 12, 10))
            .unwrap()
            .unwrap();
        assert!(path.ends_with("market_data/EURUSD_M5_20240305_121000.csv"));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 4);
        archive.save_indicators(&eurusd, at(5, 12, 10), 1.0855, &snapshot(50.0)).unwrap();

        let stats = archive.storage_stats().unwrap();
        assert!(stats.enabled);
        assert_eq!(stats.directories.len(), 4);
        assert_eq!(stats.directories[0].0, "market_data");
        assert_eq!(stats.directories[0].1.files, 1);
        assert_eq!(stats.directories[1].1.files, 1);
        assert_eq!(stats.directories[2].1.files, 0);
        assert_eq!(stats.total().files, 2);
        assert!(stats.total().bytes > 0);
    }

    #[test]
    fn test_disabled_archive_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let archive = DataArchive::new(ArchiveConfig {
            enabled: false,
            data_dir: dir.path().join("archive"),
            save_market_data: true,
        });
        let eurusd = Symbol::new("EURUSD");

        archive.save_indicators(&eurusd, at(5, 12, 0), 1.085, &snapshot(50.0)).unwrap();
        archive
            .save_decision(&eurusd, at(5, 12, 0), "p", "r", Ok(&decision()))
            .unwrap();
        archive.save_execution(at(5, 12, 0), &request(), Err("x".to_string())).unwrap();

        assert!(!dir.path().join("archive").exists());
        let stats = archive.storage_stats().unwrap();
        assert!(!stats.enabled);
        assert!(stats.directories.is_empty());
    }
}
