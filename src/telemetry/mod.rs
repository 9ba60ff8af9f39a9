//! Trade telemetry
//!
//! Every entry is logged with the market features present at the moment of
//! entry, and updated in place when the trade closes. The resulting history
//! feeds performance statistics and the weekly report.
//!
//! R multiples are `profit_loss / risk_amount`, so trades with different
//! sizes stay comparable.

mod store;

pub use store::{JsonlTradeStore, SqliteTradeStore, TradeStore};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::indicators::IndicatorSnapshot;
use crate::types::round_dp;
use crate::{Action, Symbol};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub data_dir: PathBuf,
    pub backend: StoreBackend,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/telemetry"),
            backend: StoreBackend::Jsonl,
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Full lifecycle record of one trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeRecord {
    pub trade_id: String,
    /// Broker position id
    pub ticket: Option<u64>,
    /// Entry time
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub action: Action,
    pub volume: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub sl_price: f64,
    pub tp_price: f64,

    // Outcome
    pub profit_loss: f64,
    pub profit_pips: f64,
    pub result_r: f64,
    pub bars_in_trade: u32,

    // Market conditions at entry
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub ema_separation: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub rsi: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    /// Price position within the Bollinger channel, 0-100
    pub bb_position_pct: f64,
    pub atr: f64,
    pub spread_pips: f64,
    pub session: String,
    pub hour_utc: u32,

    // Risk
    pub risk_amount: f64,
    pub risk_pct: f64,
    pub pip_size: f64,

    // Lifecycle quality
    pub mfe_pips: f64,
    pub mae_pips: f64,
    pub exit_reason: String,

    pub magic_number: u64,
    pub config_hash: String,
}

impl Default for TradeRecord {
    fn default() -> Self {
        Self {
            trade_id: String::new(),
            ticket: None,
            timestamp: DateTime::<Utc>::default(),
            symbol: Symbol::new(""),
            action: Action::Hold,
            volume: 0.0,
            entry_price: 0.0,
            exit_price: None,
            exit_time: None,
            sl_price: 0.0,
            tp_price: 0.0,
            profit_loss: 0.0,
            profit_pips: 0.0,
            result_r: 0.0,
            bars_in_trade: 0,
            ema_fast: 0.0,
            ema_slow: 0.0,
            ema_separation: 0.0,
            macd_line: 0.0,
            macd_signal: 0.0,
            rsi: 50.0,
            bb_upper: 0.0,
            bb_middle: 0.0,
            bb_lower: 0.0,
            bb_position_pct: 50.0,
            atr: 0.0,
            spread_pips: 0.0,
            session: "unknown".to_string(),
            hour_utc: 0,
            risk_amount: 0.0,
            risk_pct: 0.0,
            pip_size: 0.0001,
            mfe_pips: 0.0,
            mae_pips: 0.0,
            exit_reason: "open".to_string(),
            magic_number: 0,
            config_hash: String::new(),
        }
    }
}

impl TradeRecord {
    pub fn is_closed(&self) -> bool {
        self.exit_price.is_some()
    }

    pub fn is_win(&self) -> bool {
        self.profit_loss > 0.0
    }

    /// Price move in the trade direction, in pips
    pub fn pips_in_favor(&self, price: f64) -> f64 {
        let sign = match self.action {
            Action::Sell => -1.0,
            _ => 1.0,
        };
        if self.pip_size <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) * sign / self.pip_size
    }
}

/// Everything known at the moment an order is filled
#[derive(Debug, Clone)]
pub struct EntryRequest<'a> {
    pub symbol: &'a Symbol,
    pub ticket: Option<u64>,
    pub action: Action,
    pub volume: f64,
    pub entry_price: f64,
    pub sl_price: f64,
    pub tp_price: f64,
    pub indicators: &'a IndicatorSnapshot,
    pub spread_pips: f64,
    pub risk_amount: f64,
    /// Realized risk as a fraction of balance
    pub risk_pct: f64,
    pub pip_size: f64,
    pub magic_number: u64,
    pub now: DateTime<Utc>,
}

/// Trading session label for a UTC hour
pub fn session_label(hour_utc: u32) -> &'static str {
    match hour_utc {
        0..=5 => "asian",
        6..=9 => "london_pre",
        10..=16 => "london_ny_overlap",
        17..=21 => "ny_close",
        _ => "off_hours",
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent
    pub win_rate: f64,

    pub avg_win_pips: f64,
    pub avg_loss_pips: f64,
    pub avg_win_r: f64,
    pub avg_loss_r: f64,

    pub total_profit_pips: f64,
    pub total_profit_r: f64,
    pub expectancy_pips: f64,
    pub expectancy_r: f64,

    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,

    /// Gross profit / gross loss magnitude
    pub profit_factor: f64,
    pub r_std_dev: f64,
    /// Per-trade mean R over its standard deviation
    pub sharpe_ratio: f64,

    pub best_trade_r: f64,
    pub worst_trade_r: f64,
}

fn mean_abs(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.map(f64::abs).collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().mean()
    }
}

/// Aggregate statistics over closed trades; open trades are ignored
pub fn stats(trades: &[TradeRecord]) -> PerformanceStats {
    let closed: Vec<&TradeRecord> = trades.iter().filter(|t| t.is_closed()).collect();
    if closed.is_empty() {
        return PerformanceStats::default();
    }

    let (wins, losses): (Vec<&TradeRecord>, Vec<&TradeRecord>) =
        closed.iter().copied().partition(|t| t.is_win());

    let total = closed.len();
    let total_profit_pips: f64 = closed.iter().map(|t| t.profit_pips).sum();
    let total_profit_r: f64 = closed.iter().map(|t| t.result_r).sum();

    let gross_profit: f64 = wins.iter().map(|t| t.profit_loss).sum();
    let gross_loss: f64 = losses.iter().map(|t| t.profit_loss).sum::<f64>().abs();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let streaks: Vec<(usize, bool)> = closed.iter().map(|t| t.is_win()).dedup_with_count().collect();
    let longest = |win: bool| {
        streaks
            .iter()
            .filter(|(_, w)| *w == win)
            .map(|(n, _)| *n)
            .max()
            .unwrap_or(0)
    };

    let rs: Vec<f64> = closed.iter().map(|t| t.result_r).collect();
    let best = rs.iter().copied().map(OrderedFloat).max().map_or(0.0, |r| r.0);
    let worst = rs.iter().copied().map(OrderedFloat).min().map_or(0.0, |r| r.0);

    let expectancy_r = total_profit_r / total as f64;
    let r_std_dev = if rs.len() >= 2 { rs.iter().std_dev() } else { 0.0 };
    let sharpe_ratio = if r_std_dev > 0.0 { expectancy_r / r_std_dev } else { 0.0 };

    PerformanceStats {
        total_trades: total,
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate: wins.len() as f64 / total as f64 * 100.0,
        avg_win_pips: mean_abs(wins.iter().map(|t| t.profit_pips)),
        avg_loss_pips: mean_abs(losses.iter().map(|t| t.profit_pips)),
        avg_win_r: mean_abs(wins.iter().map(|t| t.result_r)),
        avg_loss_r: mean_abs(losses.iter().map(|t| t.result_r)),
        total_profit_pips,
        total_profit_r,
        expectancy_pips: total_profit_pips / total as f64,
        expectancy_r,
        max_consecutive_wins: longest(true),
        max_consecutive_losses: longest(false),
        profit_factor,
        r_std_dev,
        sharpe_ratio,
        best_trade_r: best,
        worst_trade_r: worst,
    }
}

// =============================================================================
// Telemetry
// =============================================================================

pub struct TradeTelemetry {
    data_dir: PathBuf,
    store: Box<dyn TradeStore>,
    config_hash: String,
}

impl TradeTelemetry {
    /// Open the configured backend under `data_dir`
    pub fn open(config: &TelemetryConfig) -> Result<Self> {
        let trades_dir = config.data_dir.join("trades");
        fs::create_dir_all(&trades_dir)
            .with_context(|| format!("Failed to create {}", trades_dir.display()))?;
        fs::create_dir_all(config.data_dir.join("reports"))?;

        let store: Box<dyn TradeStore> = match config.backend {
            StoreBackend::Jsonl => Box::new(JsonlTradeStore::open(trades_dir.join("trade_metrics.jsonl"))?),
            StoreBackend::Sqlite => Box::new(SqliteTradeStore::open(trades_dir.join("trade_metrics.db"))?),
        };

        info!("Trade telemetry initialized: {}", config.data_dir.display());
        Ok(Self::with_store(&config.data_dir, store))
    }

    pub fn with_store(data_dir: impl AsRef<Path>, store: Box<dyn TradeStore>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            store,
            config_hash: String::new(),
        }
    }

    /// Tag subsequent entries with a configuration fingerprint
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Record a new trade with its entry features; returns the trade id
    pub fn log_entry(&mut self, entry: EntryRequest<'_>) -> Result<String> {
        let ind = entry.indicators;
        let trade_id = format!("{}_{}", entry.symbol, entry.now.format("%Y%m%d_%H%M%S_%6f"));
        let bb_position_pct = ind
            .bb_position(entry.entry_price)
            .map_or(50.0, |p| round_dp(p * 100.0, 2));
        let hour_utc = entry.now.hour();

        let record = TradeRecord {
            trade_id: trade_id.clone(),
            ticket: entry.ticket,
            timestamp: entry.now,
            symbol: entry.symbol.clone(),
            action: entry.action,
            volume: entry.volume,
            entry_price: entry.entry_price,
            sl_price: entry.sl_price,
            tp_price: entry.tp_price,
            ema_fast: ind.ema_fast,
            ema_slow: ind.ema_slow,
            ema_separation: round_dp((ind.ema_fast - ind.ema_slow).abs(), 6),
            macd_line: ind.macd,
            macd_signal: ind.macd_signal,
            rsi: ind.rsi,
            bb_upper: ind.bb_upper,
            bb_middle: ind.bb_middle,
            bb_lower: ind.bb_lower,
            bb_position_pct,
            atr: ind.atr,
            spread_pips: round_dp(entry.spread_pips, 2),
            session: session_label(hour_utc).to_string(),
            hour_utc,
            risk_amount: entry.risk_amount,
            risk_pct: entry.risk_pct,
            pip_size: entry.pip_size,
            magic_number: entry.magic_number,
            config_hash: self.config_hash.clone(),
            ..TradeRecord::default()
        };

        self.store.upsert(&record)?;
        info!(
            "Trade entry logged: {} - {} {} {} at {}",
            trade_id, entry.action, entry.volume, entry.symbol, entry.entry_price
        );
        Ok(trade_id)
    }

    /// Close out a trade by id, updating its record in place
    pub fn log_exit(
        &mut self,
        trade_id: &str,
        exit_price: f64,
        profit_loss: f64,
        exit_reason: &str,
        bars_in_trade: u32,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord> {
        let Some(mut record) = self.store.get(trade_id)? else {
            bail!("Trade record {} not found", trade_id);
        };

        record.exit_price = Some(exit_price);
        record.exit_time = Some(now);
        record.profit_loss = profit_loss;
        record.profit_pips = round_dp(record.pips_in_favor(exit_price), 1);
        record.result_r = if record.risk_amount > 0.0 {
            profit_loss / record.risk_amount
        } else {
            0.0
        };
        record.bars_in_trade = bars_in_trade;
        record.exit_reason = exit_reason.to_string();

        self.store.upsert(&record)?;
        info!(
            "Trade exit logged: {} - {} {:+.2} ({:+.1} pips, {:+.2}R)",
            trade_id, exit_reason, profit_loss, record.profit_pips, record.result_r
        );
        Ok(record)
    }

    /// Update running MFE/MAE of an open trade at the current price
    pub fn record_excursion(&mut self, trade_id: &str, price: f64) -> Result<()> {
        let Some(mut record) = self.store.get(trade_id)? else {
            bail!("Trade record {} not found", trade_id);
        };
        if record.is_closed() {
            return Ok(());
        }

        let pips = round_dp(record.pips_in_favor(price), 1);
        let mfe = record.mfe_pips.max(pips);
        let mae = record.mae_pips.max(-pips);
        if mfe != record.mfe_pips || mae != record.mae_pips {
            record.mfe_pips = mfe;
            record.mae_pips = mae;
            self.store.upsert(&record)?;
            debug!("{}: MFE {:.1} pips, MAE {:.1} pips", trade_id, mfe, mae);
        }
        Ok(())
    }

    pub fn get(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        self.store.get(trade_id)
    }

    /// Trades without a recorded exit
    pub fn open_trades(&self) -> Result<Vec<TradeRecord>> {
        Ok(self.store.all()?.into_iter().filter(|t| !t.is_closed()).collect())
    }

    /// Closed trades entered within the last `days_back` days, in the order
    /// they were closed
    pub fn load_trades(
        &self,
        now: DateTime<Utc>,
        days_back: i64,
        magic_number: Option<u64>,
    ) -> Result<Vec<TradeRecord>> {
        let cutoff = now - Duration::days(days_back);
        Ok(self
            .store
            .all()?
            .into_iter()
            .filter(|t| t.timestamp >= cutoff)
            .filter(|t| magic_number.map_or(true, |m| t.magic_number == m))
            .filter(TradeRecord::is_closed)
            .sorted_by_key(|t| t.exit_time.unwrap_or(t.timestamp))
            .collect())
    }

    /// Seven-day performance report, also written under `reports/`
    pub fn weekly_report(&self, now: DateTime<Utc>, magic_number: Option<u64>) -> Result<String> {
        let trades = self.load_trades(now, 7, magic_number)?;
        let stats = stats(&trades);
        let report = render_report(&trades, &stats, now, magic_number);

        let reports_dir = self.data_dir.join("reports");
        fs::create_dir_all(&reports_dir)?;
        let path = reports_dir.join(format!("weekly_report_{}.txt", now.format("%Y%m%d")));
        fs::write(&path, &report)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Weekly report generated: {}", path.display());
        Ok(report)
    }

    /// Write trades to a CSV file
    pub fn export_csv(path: impl AsRef<Path>, trades: &[TradeRecord]) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for trade in trades {
            writer.serialize(trade)?;
        }
        writer.flush()?;
        info!("Exported {} trades to {}", trades.len(), path.display());
        Ok(())
    }
}

fn render_report(
    trades: &[TradeRecord],
    stats: &PerformanceStats,
    now: DateTime<Utc>,
    magic_number: Option<u64>,
) -> String {
    let magic = magic_number.map_or_else(|| "All".to_string(), |m| m.to_string());
    let mut lines = vec![
        "WEEKLY TRADING PERFORMANCE REPORT".to_string(),
        "=".repeat(50),
        format!("Report Period: {} (Last 7 days)", now.format("%Y-%m-%d")),
        format!("Magic Number: {}", magic),
        String::new(),
        "OVERALL PERFORMANCE".to_string(),
        format!("Total Trades: {}", stats.total_trades),
        format!(
            "Win Rate: {:.1}% ({}W / {}L)",
            stats.win_rate, stats.winning_trades, stats.losing_trades
        ),
        format!(
            "Expectancy: {:+.3}R ({:+.1} pips)",
            stats.expectancy_r, stats.expectancy_pips
        ),
        format!("Profit Factor: {:.2}", stats.profit_factor),
        format!("R Std Dev: {:.2} (Sharpe {:.2})", stats.r_std_dev, stats.sharpe_ratio),
        String::new(),
        "TRADE QUALITY".to_string(),
        format!("Average Win: {:.2}R ({:.1} pips)", stats.avg_win_r, stats.avg_win_pips),
        format!("Average Loss: -{:.2}R ({:.1} pips)", stats.avg_loss_r, stats.avg_loss_pips),
        format!("Best Trade: {:+.2}R", stats.best_trade_r),
        format!("Worst Trade: {:+.2}R", stats.worst_trade_r),
        String::new(),
        "CONSISTENCY".to_string(),
        format!("Max Consecutive Wins: {}", stats.max_consecutive_wins),
        format!("Max Consecutive Losses: {}", stats.max_consecutive_losses),
        String::new(),
        "TOTALS".to_string(),
        format!(
            "Total Profit: {:+.2}R ({:+.1} pips)",
            stats.total_profit_r, stats.total_profit_pips
        ),
    ];

    if trades.len() <= 20 {
        lines.push(String::new());
        lines.push("RECENT TRADES".to_string());
        lines.push("-".repeat(30));
        let skip = trades.len().saturating_sub(10);
        for trade in &trades[skip..] {
            lines.push(format!(
                "{} | {:4} | {:+.2}R | {}",
                trade.timestamp.format("%m-%d %H:%M"),
                trade.action.as_str().to_uppercase(),
                trade.result_r,
                trade.exit_reason
            ));
        }
    }

    lines.join("\n")
}
