//! Daily trading guardrails
//!
//! A small persistent state machine deciding whether a new entry may be
//! opened today:
//!
//! - stop after the configured equity drawdown from the day's starting equity
//! - stop after N consecutive losses
//! - stop after N trades
//! - cool down for a while after two or more consecutive losses
//!
//! Once stopped, the day stays stopped until the UTC date rolls over.
//! Guardrails only gate new entries; open positions keep being managed.
//!
//! State is an explicit [`DailyGuardrailState`] value persisted through
//! [`GuardrailStore`] after every mutation.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::Action;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Daily drawdown limit as a fraction of starting equity
    pub max_daily_drawdown: f64,
    pub max_consecutive_losses: u32,
    pub max_daily_trades: u32,
    pub loss_cooldown_minutes: i64,
    pub state_file: PathBuf,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_daily_drawdown: 0.015,
            max_consecutive_losses: 3,
            max_daily_trades: 6,
            loss_cooldown_minutes: 60,
            state_file: PathBuf::from("data/daily_guardrails.json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeResult {
    Open,
    Win,
    Loss,
}

/// Entry in the day's trade history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailTrade {
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub volume: f64,
    pub entry_price: f64,
    pub result: TradeResult,
    #[serde(default)]
    pub pnl: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailStatus {
    Active,
    StoppedForDay,
}

/// Persisted guardrail state for one UTC trading day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyGuardrailState {
    pub date: NaiveDate,
    pub trades_today: u32,
    pub consecutive_losses: u32,
    pub last_loss_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trade_history: Vec<GuardrailTrade>,
    pub starting_equity: Option<f64>,
    pub daily_stopped: bool,
    pub stop_reason: Option<String>,
}

impl DailyGuardrailState {
    pub fn new_day(date: NaiveDate) -> Self {
        Self {
            date,
            trades_today: 0,
            consecutive_losses: 0,
            last_loss_time: None,
            trade_history: Vec::new(),
            starting_equity: None,
            daily_stopped: false,
            stop_reason: None,
        }
    }

    pub fn status(&self) -> GuardrailStatus {
        if self.daily_stopped {
            GuardrailStatus::StoppedForDay
        } else {
            GuardrailStatus::Active
        }
    }
}

/// Outcome of [`DailyGuardrails::can_trade`]
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl GuardrailVerdict {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Read-only summary of the current guardrail day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub trades_today: u32,
    pub max_trades: u32,
    pub consecutive_losses: u32,
    pub max_consecutive: u32,
    pub starting_equity: Option<f64>,
    pub current_equity: Option<f64>,
    /// Percent
    pub daily_drawdown_pct: f64,
    /// Percent
    pub max_drawdown_pct: f64,
    pub wins: usize,
    pub losses: usize,
    pub daily_stopped: bool,
    pub stop_reason: Option<String>,
}

// =============================================================================
// Persistence
// =============================================================================

/// JSON document holding the guardrail state
#[derive(Debug, Clone)]
pub struct GuardrailStore {
    path: PathBuf,
}

impl GuardrailStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state for `today`, starting a fresh day on a missing file or a date mismatch
    pub fn load(&self, today: NaiveDate) -> Result<DailyGuardrailState> {
        if !self.path.exists() {
            return Ok(DailyGuardrailState::new_day(today));
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let state: DailyGuardrailState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        if state.date != today {
            info!("New trading day {}, resetting daily state", today);
            return Ok(DailyGuardrailState::new_day(today));
        }
        Ok(state)
    }

    /// Overwrite the document and sync it to disk
    pub fn save(&self, state: &DailyGuardrailState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

// =============================================================================
// Guardrails
// =============================================================================

pub struct DailyGuardrails {
    config: GuardrailConfig,
    store: GuardrailStore,
    state: DailyGuardrailState,
}

impl DailyGuardrails {
    /// Load today's state from the configured file
    pub fn open(config: GuardrailConfig, now: DateTime<Utc>) -> Self {
        let store = GuardrailStore::new(&config.state_file);
        let state = match store.load(now.date_naive()) {
            Ok(state) => state,
            Err(e) => {
                error!("Error loading daily state: {:#}, creating new state", e);
                DailyGuardrailState::new_day(now.date_naive())
            }
        };

        info!(
            "Daily guardrails initialized: {:.1}% drawdown limit, {} consecutive losses, {} trades/day",
            config.max_daily_drawdown * 100.0,
            config.max_consecutive_losses,
            config.max_daily_trades
        );

        Self {
            config,
            store,
            state,
        }
    }

    pub fn state(&self) -> &DailyGuardrailState {
        &self.state
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.state) {
            error!("Error saving daily state: {:#}", e);
        }
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.state.date != today {
            info!("New trading day {}, resetting daily state", today);
            self.state = DailyGuardrailState::new_day(today);
            self.persist();
        }
    }

    fn stop_for_day(&mut self, reason: &str) {
        self.state.daily_stopped = true;
        self.state.stop_reason = Some(reason.to_string());
        self.persist();
        error!("TRADING STOPPED FOR DAY: {}", reason);
    }

    /// Latch the starting equity on the first observation of the day
    fn starting_equity(&mut self, equity: Option<f64>) -> Option<f64> {
        if self.state.starting_equity.is_none() {
            if let Some(equity) = equity.filter(|e| *e > 0.0) {
                self.state.starting_equity = Some(equity);
                self.persist();
                info!("Set starting equity for today: {:.2}", equity);
            }
        }
        self.state.starting_equity
    }

    fn check_drawdown(&mut self, equity: Option<f64>) -> GuardrailVerdict {
        let Some(starting) = self.starting_equity(equity) else {
            return GuardrailVerdict::deny("Cannot check drawdown - starting equity unknown");
        };
        let Some(current) = equity else {
            return GuardrailVerdict::deny("Cannot check drawdown - account info unavailable");
        };

        let drawdown = (starting - current) / starting;
        let limit = self.config.max_daily_drawdown;
        if drawdown >= limit {
            let reason = format!(
                "Daily drawdown limit exceeded: {:.2}% >= {:.1}%",
                drawdown * 100.0,
                limit * 100.0
            );
            self.stop_for_day(&reason);
            return GuardrailVerdict::deny(reason);
        }
        GuardrailVerdict::allow(format!(
            "Drawdown OK: {:.2}% / {:.1}%",
            drawdown * 100.0,
            limit * 100.0
        ))
    }

    fn check_consecutive_losses(&mut self) -> GuardrailVerdict {
        let consecutive = self.state.consecutive_losses;
        let limit = self.config.max_consecutive_losses;
        if consecutive >= limit {
            let reason = format!(
                "Consecutive losses limit reached: {} >= {}",
                consecutive, limit
            );
            self.stop_for_day(&reason);
            return GuardrailVerdict::deny(reason);
        }
        GuardrailVerdict::allow(format!("Consecutive losses OK: {}/{}", consecutive, limit))
    }

    fn check_trade_limit(&mut self) -> GuardrailVerdict {
        let trades = self.state.trades_today;
        let limit = self.config.max_daily_trades;
        if trades >= limit {
            let reason = format!("Daily trade limit reached: {} >= {}", trades, limit);
            self.stop_for_day(&reason);
            return GuardrailVerdict::deny(reason);
        }
        GuardrailVerdict::allow(format!("Daily trades OK: {}/{}", trades, limit))
    }

    fn check_cooldown(&self, now: DateTime<Utc>) -> GuardrailVerdict {
        let consecutive = self.state.consecutive_losses;
        if consecutive >= 2 {
            if let Some(last_loss) = self.state.last_loss_time {
                let cooldown = Duration::minutes(self.config.loss_cooldown_minutes);
                let elapsed = now - last_loss;
                if elapsed < cooldown {
                    let remaining = (cooldown - elapsed).num_seconds() as f64 / 60.0;
                    return GuardrailVerdict::deny(format!(
                        "In cooldown: {:.1} min remaining after {} losses",
                        remaining, consecutive
                    ));
                }
            }
        }
        GuardrailVerdict::allow("No cooldown active")
    }

    /// May a new trade be opened now?
    ///
    /// Checks run in order and stop at the first failure: stop flag, drawdown,
    /// consecutive losses, trade count, cooldown. A failure in drawdown,
    /// consecutive losses or trade count stops trading for the day.
    pub fn can_trade(&mut self, now: DateTime<Utc>, equity: Option<f64>) -> GuardrailVerdict {
        self.roll_over(now);

        if self.state.daily_stopped {
            return GuardrailVerdict::deny(format!(
                "Trading stopped for day: {}",
                self.state.stop_reason.as_deref().unwrap_or("unknown")
            ));
        }

        let drawdown = self.check_drawdown(equity);
        if !drawdown.allowed {
            return drawdown;
        }
        let losses = self.check_consecutive_losses();
        if !losses.allowed {
            return losses;
        }
        let trades = self.check_trade_limit();
        if !trades.allowed {
            return trades;
        }
        let cooldown = self.check_cooldown(now);
        if !cooldown.allowed {
            return cooldown;
        }

        GuardrailVerdict::allow("All guardrails passed - can trade")
    }

    pub fn record_trade_entry(&mut self, now: DateTime<Utc>, action: Action, volume: f64, price: f64) {
        self.roll_over(now);

        self.state.trades_today += 1;
        self.state.trade_history.push(GuardrailTrade {
            timestamp: now,
            action,
            volume,
            entry_price: price,
            result: TradeResult::Open,
            pnl: None,
        });
        self.persist();

        info!(
            "Recorded trade entry: {} {} lots at {} (trade {}/{})",
            action, volume, price, self.state.trades_today, self.config.max_daily_trades
        );
    }

    pub fn record_trade_result(&mut self, now: DateTime<Utc>, pnl: f64, was_winner: bool) {
        self.roll_over(now);

        if was_winner {
            self.state.consecutive_losses = 0;
            info!("Trade won: +{:.2}, consecutive losses reset to 0", pnl);
        } else {
            self.state.consecutive_losses += 1;
            self.state.last_loss_time = Some(now);
            warn!(
                "Trade lost: -{:.2}, consecutive losses: {}",
                pnl.abs(),
                self.state.consecutive_losses
            );
        }

        let history = &mut self.state.trade_history;
        let entry = match history.iter().rposition(|t| t.result == TradeResult::Open) {
            Some(index) => history.get_mut(index),
            None => history.last_mut(),
        };
        if let Some(entry) = entry {
            entry.result = if was_winner {
                TradeResult::Win
            } else {
                TradeResult::Loss
            };
            entry.pnl = Some(pnl);
        }

        self.persist();
    }

    pub fn daily_stats(&mut self, now: DateTime<Utc>, equity: Option<f64>) -> DailyStats {
        self.roll_over(now);
        let starting_equity = self.starting_equity(equity);

        let daily_drawdown_pct = match (starting_equity, equity) {
            (Some(start), Some(current)) if start > 0.0 => (start - current) / start * 100.0,
            _ => 0.0,
        };

        let count = |result: TradeResult| {
            self.state
                .trade_history
                .iter()
                .filter(|t| t.result == result)
                .count()
        };

        DailyStats {
            date: self.state.date,
            trades_today: self.state.trades_today,
            max_trades: self.config.max_daily_trades,
            consecutive_losses: self.state.consecutive_losses,
            max_consecutive: self.config.max_consecutive_losses,
            starting_equity,
            current_equity: equity,
            daily_drawdown_pct,
            max_drawdown_pct: self.config.max_daily_drawdown * 100.0,
            wins: count(TradeResult::Win),
            losses: count(TradeResult::Loss),
            daily_stopped: self.state.daily_stopped,
            stop_reason: self.state.stop_reason.clone(),
        }
    }

    /// Manual override from the command line
    pub fn force_reset_day(&mut self, now: DateTime<Utc>) {
        warn!("Forcing daily state reset");
        self.state = DailyGuardrailState::new_day(now.date_naive());
        self.persist();
    }
}
