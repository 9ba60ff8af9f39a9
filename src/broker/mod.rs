//! Broker terminal collaborators
//!
//! The pipeline only talks to the [`Broker`] and [`MarketData`] traits.
//! [`bridge::BridgeClient`] speaks to a terminal bridge over HTTP and
//! [`paper::PaperBroker`] simulates fills locally on top of real quotes.

pub mod bridge;
pub mod paper;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AccountSnapshot, Candle, InstrumentInfo, Side, Symbol, Tick, Timeframe};

/// Terminal return code for a completed trade request
pub const RETCODE_DONE: i64 = 10009;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{operation} rejected by terminal: code {code} ({description})")]
    Rejected {
        operation: &'static str,
        code: i64,
        description: String,
    },

    #[error("no data available for {0}")]
    NoData(String),

    #[error("unknown position ticket {0}")]
    UnknownTicket(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("auth error: {0}")]
    Auth(String),
}

impl BrokerError {
    /// Terminal return code, when the terminal produced one
    pub fn code(&self) -> Option<i64> {
        match self {
            BrokerError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Read-only market data
pub trait MarketData {
    /// Chronological bars, oldest first, ending at the most recent bar
    fn bars(&self, symbol: &Symbol, timeframe: Timeframe, count: usize)
        -> BrokerResult<Vec<Candle>>;

    fn tick(&self, symbol: &Symbol) -> BrokerResult<Tick>;

    fn instrument(&self, symbol: &Symbol) -> BrokerResult<InstrumentInfo>;

    fn server_time(&self) -> BrokerResult<DateTime<Utc>>;
}

/// Account, position and order operations
pub trait Broker: MarketData {
    fn account(&mut self) -> BrokerResult<AccountSnapshot>;

    /// Open positions carrying `magic`, optionally restricted to one symbol
    fn positions(&mut self, symbol: Option<&Symbol>, magic: u64)
        -> BrokerResult<Vec<BrokerPosition>>;

    fn send_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderReceipt>;

    /// Replace stop-loss and take-profit of an open position. 0.0 means none.
    fn modify_stops(&mut self, ticket: u64, sl: f64, tp: f64) -> BrokerResult<()>;

    /// Close `volume` lots of an open position at market
    fn close_position(&mut self, ticket: u64, volume: f64) -> BrokerResult<OrderReceipt>;

    /// Final outcome of a position that is no longer open, if the terminal knows it
    fn closed_trade(&mut self, ticket: u64) -> BrokerResult<Option<ClosedTrade>>;
}

/// Market order request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub volume: f64,
    pub sl: f64,
    pub tp: f64,
    /// Max slippage in points
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub retcode: i64,
    /// Position ticket opened or affected by the order
    pub ticket: u64,
    pub volume: f64,
    pub price: f64,
    #[serde(default)]
    pub comment: String,
}

/// An open position as reported by the terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub symbol: Symbol,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    /// 0.0 when no stop is set
    pub sl: f64,
    /// 0.0 when no target is set
    pub tp: f64,
    pub open_time: DateTime<Utc>,
    /// Unrealized profit in account currency
    pub profit: f64,
    pub magic: u64,
    #[serde(default)]
    pub comment: String,
}

/// Realized outcome of a closed position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket: u64,
    pub symbol: Symbol,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub close_price: f64,
    /// Realized profit including partial closes
    pub profit: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    /// Terminal reason, e.g. "sl", "tp", "manual", "time_exit"
    pub reason: String,
}

/// Terminal bridge connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8228".to_string(),
            api_key: None,
            api_secret: None,
            timeout_secs: 30,
        }
    }
}
