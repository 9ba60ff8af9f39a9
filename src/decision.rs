//! Decision parsing
//!
//! The decision source returns free text that is expected to contain a JSON
//! object. It is untrusted: [`parse_decision`] validates it once and produces a
//! typed [`TradeDecision`] that nothing downstream re-checks. Anything that
//! fails validation means "no trade this cycle".

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::Action;

#[derive(Debug, Error, PartialEq)]
pub enum DecisionError {
    #[error("empty response")]
    Empty,

    #[error("no JSON object in response")]
    NoJson,

    #[error("malformed decision JSON: {0}")]
    Malformed(String),

    #[error("invalid action '{0}'")]
    InvalidAction(String),

    #[error("{field} = {value} outside ({min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("reasoning missing required elements: {}", .0.join(", "))]
    MissingReasoning(Vec<&'static str>),
}

/// Bounds applied to untrusted decision fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionLimits {
    pub max_volume: f64,
    pub max_stop_loss_pips: f64,
    pub max_take_profit_pips: f64,
    pub max_reasoning_chars: usize,
    /// Reasoning must mention trend, band position and momentum
    pub require_reasoning_elements: bool,
}

impl Default for DecisionLimits {
    fn default() -> Self {
        Self {
            max_volume: 1.0,
            max_stop_loss_pips: 500.0,
            max_take_profit_pips: 1000.0,
            max_reasoning_chars: 2000,
            require_reasoning_elements: true,
        }
    }
}

/// Validated recommendation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeDecision {
    pub action: Action,
    pub volume: Option<f64>,
    pub stop_loss_pips: Option<f64>,
    pub take_profit_pips: Option<f64>,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    stop_loss_pips: Option<f64>,
    #[serde(default)]
    take_profit_pips: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

const EMA_TERMS: &[&str] = &["ema", "moving average", "crossover"];
const BAND_TERMS: &[&str] = &["bb", "bollinger", "band", "upper", "lower", "middle"];
const MOMENTUM_TERMS: &[&str] = &["rsi", "overbought", "oversold", "momentum"];

/// Locate the JSON object in a response that may be fenced or wrapped in prose
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn check_range(field: &'static str, value: Option<f64>, max: f64) -> Result<Option<f64>, DecisionError> {
    match value {
        Some(v) if !(v.is_finite() && v > 0.0 && v <= max) => Err(DecisionError::OutOfRange {
            field,
            value: v,
            min: 0.0,
            max,
        }),
        other => Ok(other),
    }
}

fn missing_elements(reasoning: &str) -> Vec<&'static str> {
    let lower = reasoning.to_lowercase();
    let mentions = |terms: &[&str]| terms.iter().any(|t| lower.contains(t));

    let mut missing = Vec::new();
    if !mentions(EMA_TERMS) {
        missing.push("EMA/moving average");
    }
    if !mentions(BAND_TERMS) {
        missing.push("Bollinger Band");
    }
    if !mentions(MOMENTUM_TERMS) {
        missing.push("RSI/momentum");
    }
    missing
}

/// Parse and validate a raw decision-source response
pub fn parse_decision(response: &str, limits: &DecisionLimits) -> Result<TradeDecision, DecisionError> {
    let text = response.trim();
    if text.is_empty() {
        return Err(DecisionError::Empty);
    }

    let json = extract_json(text).ok_or(DecisionError::NoJson)?;
    let raw: RawDecision =
        serde_json::from_str(json).map_err(|e| DecisionError::Malformed(e.to_string()))?;

    let action = match raw.action.trim().to_lowercase().as_str() {
        "buy" => Action::Buy,
        "sell" => Action::Sell,
        "hold" => Action::Hold,
        _ => return Err(DecisionError::InvalidAction(raw.action)),
    };

    let volume = check_range("volume", raw.volume, limits.max_volume)?;
    let stop_loss_pips = check_range("stop_loss_pips", raw.stop_loss_pips, limits.max_stop_loss_pips)?;
    let take_profit_pips =
        check_range("take_profit_pips", raw.take_profit_pips, limits.max_take_profit_pips)?;

    let reasoning: String = raw
        .reasoning
        .unwrap_or_default()
        .trim()
        .chars()
        .take(limits.max_reasoning_chars)
        .collect();

    // A hold needs no justification
    if limits.require_reasoning_elements && action != Action::Hold {
        let missing = missing_elements(&reasoning);
        if !missing.is_empty() {
            warn!("Reasoning missing required elements: {:?}", missing);
            return Err(DecisionError::MissingReasoning(missing));
        }
    }

    let decision = TradeDecision {
        action,
        volume,
        stop_loss_pips,
        take_profit_pips,
        reasoning,
    };
    debug!("Parsed decision: {:?}", decision);
    Ok(decision)
}
