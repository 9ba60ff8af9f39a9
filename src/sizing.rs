//! Risk-based position sizing
//!
//! Converts a stop distance in pips and a risk budget (fraction of balance)
//! into an order volume:
//!
//! ```text
//! volume = (balance * risk_pct) / (sl_pips * pip_value)
//! ```
//!
//! The volume is clamped to the configured lot range and rounded to the lot
//! step. The result always reports the risk realized by the final volume, so
//! divergence caused by clamping stays visible. Sizing never fails: unusable
//! inputs produce a fallback result with `valid = false` and the minimum volume.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::types::{round_dp, round_to_step};
use crate::{AccountSnapshot, InstrumentInfo, Symbol};

/// Sizing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Default risk per trade as a fraction of balance (0.0015 = 0.15%)
    pub risk_per_trade: f64,
    pub min_volume: f64,
    pub max_volume: f64,
    pub lot_step: f64,
    /// Daily drawdown budget as a fraction of balance
    pub max_daily_risk: f64,
    /// Deny entries whose full-stop loss would breach the daily budget
    pub enforce_daily_risk_budget: bool,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: 0.0015,
            min_volume: 0.01,
            max_volume: 0.05,
            lot_step: 0.01,
            max_daily_risk: 0.015,
            enforce_daily_risk_budget: false,
        }
    }
}

impl SizingConfig {
    /// Set risk per trade as a fraction (e.g., 0.0015 = 0.15%)
    pub fn with_risk_per_trade(mut self, risk: f64) -> Self {
        self.risk_per_trade = risk;
        self
    }

    /// Set the allowed volume range
    pub fn with_volume_range(mut self, min: f64, max: f64) -> Self {
        self.min_volume = min;
        self.max_volume = max;
        self
    }
}

/// Outcome of a sizing calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingResult {
    pub volume: f64,
    /// Risk realized by `volume` at the stop, in account currency
    pub risk_amount: f64,
    /// `risk_amount / balance` as a fraction
    pub risk_pct_actual: f64,
    /// Account currency per pip per lot
    pub pip_value: f64,
    pub raw_volume: f64,
    /// Final volume differs from the raw volume
    pub clamped: bool,
    pub valid: bool,
    pub reasoning: String,
}

/// Price increment per pip used for pip value.
///
/// 5-digit quotes use ten points per pip; 3, 4 and 2 digit quotes use one
/// point. Other precisions fall back to the 5-digit convention.
pub fn pip_increment(instrument: &InstrumentInfo) -> f64 {
    match instrument.digits {
        5 => 10.0 * instrument.point,
        3 | 4 | 2 => instrument.point,
        other => {
            warn!("Unusual digits ({}) for {}", other, instrument.symbol);
            10.0 * instrument.point
        }
    }
}

/// Account currency per pip per 1.0 lot
pub fn pip_value(instrument: &InstrumentInfo) -> f64 {
    instrument.contract_size * pip_increment(instrument)
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        debug!(
            "Risk sizing initialized: {:.3}% per trade, volume range [{}, {}]",
            config.risk_per_trade * 100.0,
            config.min_volume,
            config.max_volume
        );
        PositionSizer { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Size a position from an instrument description and a balance.
    ///
    /// `risk_pct` defaults to the configured risk per trade.
    pub fn size(
        &self,
        instrument: Option<&InstrumentInfo>,
        balance: Option<f64>,
        sl_pips: f64,
        risk_pct: Option<f64>,
    ) -> SizingResult {
        let risk_pct = risk_pct.unwrap_or(self.config.risk_per_trade);

        let Some(instrument) = instrument else {
            return self.fallback("Instrument data unavailable");
        };
        let balance = match balance {
            Some(b) if b.is_finite() && b > 0.0 => b,
            Some(b) => return self.fallback(&format!("Invalid account balance {}", b)),
            None => return self.fallback("Account data unavailable"),
        };
        if !(sl_pips.is_finite() && sl_pips > 0.0) {
            return self.fallback("Invalid stop loss pips");
        }
        if !(risk_pct.is_finite() && risk_pct > 0.0) {
            return self.fallback("Invalid risk percentage");
        }

        let pip_value = pip_value(instrument);
        if !(pip_value.is_finite() && pip_value > 0.0) {
            return self.fallback("Invalid pip value");
        }

        let risk_amount = balance * risk_pct;
        let raw_volume = risk_amount / (sl_pips * pip_value);

        let volume = round_to_step(
            raw_volume.clamp(self.config.min_volume, self.config.max_volume),
            self.config.lot_step,
        )
        .clamp(self.config.min_volume, self.config.max_volume);

        let actual_risk = volume * sl_pips * pip_value;
        let actual_risk_pct = actual_risk / balance;

        let reasoning = format!(
            "Risk calc: {:.3}% of {:.2} = {:.2}, SL {} pips * pip_value {:.4} = raw_vol {:.4} -> {:.2} (actual risk: {:.2} = {:.3}%)",
            risk_pct * 100.0,
            balance,
            risk_amount,
            sl_pips,
            pip_value,
            raw_volume,
            volume,
            actual_risk,
            actual_risk_pct * 100.0
        );
        debug!("{}: {}", instrument.symbol, reasoning);

        SizingResult {
            volume,
            risk_amount: round_dp(actual_risk, 2),
            risk_pct_actual: actual_risk_pct,
            pip_value,
            raw_volume,
            clamped: (raw_volume - volume).abs() > 1e-12,
            valid: true,
            reasoning,
        }
    }

    /// Size using live account and instrument data.
    ///
    /// Broker failures degrade to the fallback result.
    pub fn size_from_broker<B: Broker + ?Sized>(
        &self,
        broker: &mut B,
        symbol: &Symbol,
        sl_pips: f64,
        risk_pct: Option<f64>,
    ) -> SizingResult {
        let account = match broker.account() {
            Ok(account) => account,
            Err(e) => return self.fallback(&format!("Failed to get account info: {}", e)),
        };
        let instrument = match broker.instrument(symbol) {
            Ok(info) => info,
            Err(e) => return self.fallback(&format!("Failed to get instrument info: {}", e)),
        };
        self.size(Some(&instrument), Some(account.balance), sl_pips, risk_pct)
    }

    /// Would a new trade losing `new_trade_risk` breach the daily budget?
    pub fn check_daily_risk(&self, account: &AccountSnapshot, new_trade_risk: f64) -> (bool, String) {
        if account.balance <= 0.0 {
            return (
                false,
                "Cannot validate daily risk - invalid balance".to_string(),
            );
        }

        let limit_pct = self.config.max_daily_risk * 100.0;
        let current_pct = (account.balance - account.equity) / account.balance * 100.0;
        let potential_pct =
            (account.balance - (account.equity - new_trade_risk)) / account.balance * 100.0;

        if current_pct >= limit_pct {
            return (
                false,
                format!(
                    "Daily drawdown limit reached: {:.2}% >= {:.1}%",
                    current_pct, limit_pct
                ),
            );
        }
        if potential_pct >= limit_pct {
            return (
                false,
                format!(
                    "New trade would exceed daily limit: {:.2}% >= {:.1}%",
                    potential_pct, limit_pct
                ),
            );
        }
        (
            true,
            format!(
                "Daily risk OK: current {:.2}%, potential {:.2}%",
                current_pct, potential_pct
            ),
        )
    }

    fn fallback(&self, reason: &str) -> SizingResult {
        warn!("Using fallback sizing: {}", reason);
        SizingResult {
            volume: self.config.min_volume,
            risk_amount: 0.0,
            risk_pct_actual: 0.0,
            pip_value: 0.0,
            raw_volume: self.config.min_volume,
            clamped: true,
            valid: false,
            reasoning: format!(
                "FALLBACK: {}, using minimum volume {}",
                reason, self.config.min_volume
            ),
        }
    }
}
