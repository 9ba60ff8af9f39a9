//! Technical indicators
//!
//! Series functions return one value per input bar, `None` during warm-up.
//! [`compute`] turns a bar window into a point-in-time [`IndicatorSnapshot`]
//! and refuses to produce a partial one.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;
use thiserror::Error;

use crate::types::round_dp;
use crate::Candle;

/// Substitute for a zero average loss in RSI
const RSI_EPSILON: f64 = 1e-10;

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if period == 0 || i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate Exponential Moving Average
///
/// Recursive form with alpha = 2 / (period + 1), seeded with the first value,
/// so every bar has a value.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut prev = values[0];
    result.push(Some(prev));

    for &value in &values[1..] {
        prev = alpha * value + (1.0 - alpha) * prev;
        result.push(Some(prev));
    }

    result
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (simple rolling mean of true range)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    sma(&tr, period)
}

/// Calculate Bollinger Bands with the sample standard deviation
pub fn bollinger_bands(
    values: &[f64],
    period: usize,
    num_std: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = sma(values, period);
    let mut upper = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        match middle[i] {
            Some(mid) if period >= 2 => {
                let window = &values[i + 1 - period..=i];
                let std_dev = window.iter().std_dev();
                upper.push(Some(mid + num_std * std_dev));
                lower.push(Some(mid - num_std * std_dev));
            }
            _ => {
                upper.push(None);
                lower.push(None);
            }
        }
    }

    (upper, middle, lower)
}

/// Calculate RSI (Relative Strength Index)
///
/// Gains and losses are smoothed with [`ema`] starting from the first price change.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rsi_values = Vec::with_capacity(values.len());
    if values.is_empty() {
        return rsi_values;
    }
    rsi_values.push(None);

    let (gains, losses): (Vec<f64>, Vec<f64>) = values
        .windows(2)
        .map(|w| {
            let change = w[1] - w[0];
            (change.max(0.0), (-change).max(0.0))
        })
        .unzip();

    let avg_gains = ema(&gains, period);
    let avg_losses = ema(&losses, period);

    for (avg_gain, avg_loss) in avg_gains.into_iter().zip(avg_losses) {
        match (avg_gain, avg_loss) {
            (Some(gain), Some(loss)) => {
                let loss = if loss == 0.0 { RSI_EPSILON } else { loss };
                let rs = gain / loss;
                rsi_values.push(Some(100.0 - 100.0 / (1.0 + rs)));
            }
            _ => rsi_values.push(None),
        }
    }

    rsi_values
}

/// MACD line, signal line and histogram
pub struct Macd {
    pub line: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

/// Calculate MACD
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    let dense: Vec<f64> = line.iter().map(|v| v.unwrap_or(0.0)).collect();
    let signal_line = ema(&dense, signal);

    let histogram = line
        .iter()
        .zip(&signal_line)
        .map(|(l, s)| match (l, s) {
            (Some(l), Some(s)) => Some(l - s),
            _ => None,
        })
        .collect();

    Macd {
        line,
        signal: signal_line,
        histogram,
    }
}

/// Calculate the Stochastic oscillator (%K, %D)
///
/// A window with no range (highest high == lowest low) reads as 50.
pub fn stochastic(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    k_period: usize,
    d_period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut k_values = Vec::with_capacity(close.len());

    for i in 0..close.len() {
        if k_period == 0 || i + 1 < k_period {
            k_values.push(None);
            continue;
        }
        let start = i + 1 - k_period;
        let lowest = low[start..=i].iter().copied().fold(f64::INFINITY, f64::min);
        let highest = high[start..=i].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = highest - lowest;
        let k = if range > 0.0 {
            100.0 * (close[i] - lowest) / range
        } else {
            50.0
        };
        k_values.push(Some(k));
    }

    let mut d_values = Vec::with_capacity(close.len());
    for i in 0..k_values.len() {
        if d_period == 0 || i + 1 < d_period {
            d_values.push(None);
            continue;
        }
        let window = &k_values[i + 1 - d_period..=i];
        if window.iter().all(Option::is_some) {
            let sum: f64 = window.iter().flatten().sum();
            d_values.push(Some(sum / d_period as f64));
        } else {
            d_values.push(None);
        }
    }

    (k_values, d_values)
}

/// Latest ATR over the bar window, if enough bars are available
pub fn latest_atr(bars: &[Candle], period: usize) -> Option<f64> {
    let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    atr(&high, &low, &close, period).last().copied().flatten()
}

// =============================================================================
// Trend direction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Bullish => f.write_str("bullish"),
            Trend::Bearish => f.write_str("bearish"),
        }
    }
}

impl Trend {
    /// Bullish when the fast EMA is strictly above the slow one
    pub fn from_emas(fast: f64, slow: f64) -> Self {
        if fast > slow {
            Trend::Bullish
        } else {
            Trend::Bearish
        }
    }
}

/// Unrounded fast and slow EMA at the latest close
pub fn latest_emas(closes: &[f64], fast: usize, slow: usize) -> Option<(f64, f64)> {
    let fast_ema = ema(closes, fast).last().copied().flatten()?;
    let slow_ema = ema(closes, slow).last().copied().flatten()?;
    Some((fast_ema, slow_ema))
}

/// EMA crossover trend of the latest close
pub fn trend(closes: &[f64], fast: usize, slow: usize) -> Option<Trend> {
    latest_emas(closes, fast, slow).map(|(fast_ema, slow_ema)| Trend::from_emas(fast_ema, slow_ema))
}

// =============================================================================
// Snapshot
// =============================================================================

/// Indicator periods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bb_period: usize,
    pub bb_std_dev: f64,
    pub sma_fast: usize,
    pub sma_slow: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub stoch_k: usize,
    pub stoch_d: usize,
    pub atr_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            macd_fast: 6,
            macd_slow: 13,
            macd_signal: 5,
            bb_period: 20,
            bb_std_dev: 2.0,
            sma_fast: 20,
            sma_slow: 200,
            ema_fast: 9,
            ema_slow: 21,
            stoch_k: 14,
            stoch_d: 3,
            atr_period: 14,
        }
    }
}

impl IndicatorConfig {
    /// Number of bars needed before every indicator has a value
    pub fn required_bars(&self) -> usize {
        [
            self.rsi_period + 1,
            self.macd_slow,
            self.bb_period,
            self.sma_fast,
            self.sma_slow,
            self.stoch_k + self.stoch_d.saturating_sub(1),
            self.atr_period,
            self.ema_slow,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("rsi_period", self.rsi_period),
            ("macd_fast", self.macd_fast),
            ("macd_slow", self.macd_slow),
            ("macd_signal", self.macd_signal),
            ("sma_fast", self.sma_fast),
            ("sma_slow", self.sma_slow),
            ("ema_fast", self.ema_fast),
            ("ema_slow", self.ema_slow),
            ("stoch_k", self.stoch_k),
            ("stoch_d", self.stoch_d),
            ("atr_period", self.atr_period),
        ];
        for (name, period) in periods {
            if period == 0 {
                bail!("indicators.{} must be positive", name);
            }
        }
        if self.bb_period < 2 {
            bail!("indicators.bb_period must be at least 2");
        }
        Ok(())
    }
}

/// Why a snapshot could not be computed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("insufficient data: {available} bars available, {required} required")]
    InsufficientData { required: usize, available: usize },

    #[error("indicator {0} is not finite")]
    NonFinite(&'static str),
}

/// Point-in-time indicator values at the last bar of a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
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

impl IndicatorSnapshot {
    /// All values keyed by indicator name
    pub fn entries(&self) -> [(&'static str, f64); 14] {
        [
            ("rsi", self.rsi),
            ("macd", self.macd),
            ("macd_signal", self.macd_signal),
            ("macd_histogram", self.macd_histogram),
            ("bb_upper", self.bb_upper),
            ("bb_middle", self.bb_middle),
            ("bb_lower", self.bb_lower),
            ("sma_fast", self.sma_fast),
            ("sma_slow", self.sma_slow),
            ("ema_fast", self.ema_fast),
            ("ema_slow", self.ema_slow),
            ("stoch_k", self.stoch_k),
            ("stoch_d", self.stoch_d),
            ("atr", self.atr),
        ]
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries()
            .into_iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn ema_trend(&self) -> Trend {
        Trend::from_emas(self.ema_fast, self.ema_slow)
    }

    /// Position of `price` inside the Bollinger channel (0 = lower band, 1 = upper band)
    pub fn bb_position(&self, price: f64) -> Option<f64> {
        let range = self.bb_upper - self.bb_lower;
        (range > 0.0).then(|| (price - self.bb_lower) / range)
    }
}

/// Compute the indicator snapshot for the last bar of `bars`.
///
/// All-or-nothing: a window shorter than [`IndicatorConfig::required_bars`]
/// yields [`IndicatorError::InsufficientData`].
pub fn compute(
    bars: &[Candle],
    config: &IndicatorConfig,
) -> Result<IndicatorSnapshot, IndicatorError> {
    let required = config.required_bars();
    if bars.len() < required || bars.is_empty() {
        return Err(IndicatorError::InsufficientData {
            required,
            available: bars.len(),
        });
    }

    let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let macd_values = macd(&close, config.macd_fast, config.macd_slow, config.macd_signal);
    let (bb_upper, bb_middle, bb_lower) =
        bollinger_bands(&close, config.bb_period, config.bb_std_dev);
    let (stoch_k, stoch_d) = stochastic(&high, &low, &close, config.stoch_k, config.stoch_d);

    let last = |name: &'static str, series: &[Option<f64>]| -> Result<f64, IndicatorError> {
        match series.last().copied().flatten() {
            Some(v) if v.is_finite() => Ok(v),
            Some(_) => Err(IndicatorError::NonFinite(name)),
            None => Err(IndicatorError::InsufficientData {
                required,
                available: bars.len(),
            }),
        }
    };

    let oscillator = |v: f64| round_dp(v, 2);
    let macd_scale = |v: f64| round_dp(v, 6);
    let price_scale = |v: f64| round_dp(v, 5);

    Ok(IndicatorSnapshot {
        rsi: oscillator(last("rsi", &rsi(&close, config.rsi_period))?),
        macd: macd_scale(last("macd", &macd_values.line)?),
        macd_signal: macd_scale(last("macd_signal", &macd_values.signal)?),
        macd_histogram: macd_scale(last("macd_histogram", &macd_values.histogram)?),
        bb_upper: price_scale(last("bb_upper", &bb_upper)?),
        bb_middle: price_scale(last("bb_middle", &bb_middle)?),
        bb_lower: price_scale(last("bb_lower", &bb_lower)?),
        sma_fast: price_scale(last("sma_fast", &sma(&close, config.sma_fast))?),
        sma_slow: price_scale(last("sma_slow", &sma(&close, config.sma_slow))?),
        ema_fast: price_scale(last("ema_fast", &ema(&close, config.ema_fast))?),
        ema_slow: price_scale(last("ema_slow", &ema(&close, config.ema_slow))?),
        stoch_k: oscillator(last("stoch_k", &stoch_k)?),
        stoch_d: oscillator(last("stoch_d", &stoch_d)?),
        atr: price_scale(last("atr", &atr(&high, &low, &close, config.atr_period))?),
    })
}

/// Human-readable readings of the main indicators
pub fn interpret(snapshot: &IndicatorSnapshot, price: f64) -> Vec<(&'static str, &'static str)> {
    let rsi = if snapshot.rsi > 70.0 {
        "Overbought"
    } else if snapshot.rsi < 30.0 {
        "Oversold"
    } else {
        "Neutral"
    };

    let macd = if snapshot.macd > snapshot.macd_signal {
        "Bullish (above signal)"
    } else {
        "Bearish (below signal)"
    };

    let bollinger = if price > snapshot.bb_upper {
        "Above upper band (overbought)"
    } else if price < snapshot.bb_lower {
        "Below lower band (oversold)"
    } else {
        "Within bands (normal)"
    };

    let trend = if snapshot.sma_fast > snapshot.sma_slow {
        "Uptrend (fast MA > slow MA)"
    } else {
        "Downtrend (fast MA < slow MA)"
    };

    let stochastic = if snapshot.stoch_k > 80.0 {
        "Overbought"
    } else if snapshot.stoch_k < 20.0 {
        "Oversold"
    } else {
        "Neutral"
    };

    vec![
        ("rsi", rsi),
        ("macd", macd),
        ("bollinger", bollinger),
        ("trend", trend),
        ("stochastic", stochastic),
    ]
}
