//! Terminal bridge REST client
//!
//! Blocking HTTP client for a small JSON bridge running next to the broker
//! terminal. Authenticated requests carry `X-API-KEY` and `X-SIGNATURE`, the
//! hex HMAC-SHA256 of the query string (GET) or the JSON body (POST).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::{
    BridgeConfig, Broker, BrokerError, BrokerPosition, BrokerResult, ClosedTrade, MarketData,
    OrderReceipt, OrderRequest, RETCODE_DONE,
};
use crate::{AccountSnapshot, Candle, InstrumentInfo, Side, Symbol, Tick, Timeframe};

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `payload` keyed with `secret`
pub fn sign_payload(payload: &str, secret: &str) -> BrokerResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BrokerError::Auth(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone)]
pub struct BridgeClient {
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    client: Client,
}

impl BridgeClient {
    pub fn new(config: &BridgeConfig) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(BridgeClient {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            client,
        })
    }

    fn signature(&self, payload: &str) -> BrokerResult<Option<String>> {
        self.api_secret
            .as_deref()
            .map(|secret| sign_payload(payload, secret))
            .transpose()
    }

    fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        params: &[(&str, String)],
    ) -> BrokerResult<T> {
        let url = Url::parse_with_params(&format!("{}{}", self.base_url, path), params)
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let query = url.query().unwrap_or("").to_string();

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }
        if let Some(signature) = self.signature(&query)? {
            request = request.header("X-SIGNATURE", signature);
        }

        debug!("GET {} {}", path, query);
        parse_response(operation, request.send()?)
    }

    fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> BrokerResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let body = serde_json::to_string(body).map_err(|e| BrokerError::Parse(e.to_string()))?;

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }
        if let Some(signature) = self.signature(&body)? {
            request = request.header("X-SIGNATURE", signature);
        }

        debug!("POST {} {}", path, body);
        parse_response(operation, request.body(body).send()?)
    }

    fn trade<B: Serialize>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> BrokerResult<TradeResultWire> {
        let result: TradeResultWire = self.post(operation, path, body)?;
        if result.retcode != RETCODE_DONE {
            return Err(BrokerError::Rejected {
                operation,
                code: result.retcode,
                description: result.comment,
            });
        }
        Ok(result)
    }
}

fn parse_response<T: DeserializeOwned>(operation: &'static str, response: Response) -> BrokerResult<T> {
    let status = response.status();
    if !status.is_success() {
        let description = response.text().unwrap_or_default();
        return Err(BrokerError::Rejected {
            operation,
            code: i64::from(status.as_u16()),
            description,
        });
    }
    Ok(response.json()?)
}

fn timestamp(secs: i64) -> BrokerResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| BrokerError::Parse(format!("invalid timestamp {}", secs)))
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct BarWire {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    tick_volume: f64,
}

#[derive(Debug, Deserialize)]
struct TickWire {
    bid: f64,
    ask: f64,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct SymbolWire {
    digits: u32,
    point: f64,
    trade_contract_size: f64,
}

#[derive(Debug, Deserialize)]
struct TimeWire {
    time: i64,
}

#[derive(Debug, Deserialize)]
struct PositionWire {
    ticket: u64,
    symbol: String,
    side: Side,
    volume: f64,
    price_open: f64,
    #[serde(default)]
    sl: f64,
    #[serde(default)]
    tp: f64,
    time: i64,
    #[serde(default)]
    profit: f64,
    magic: u64,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Deserialize)]
struct ClosedTradeWire {
    ticket: u64,
    symbol: String,
    side: Side,
    volume: f64,
    price_open: f64,
    price_close: f64,
    profit: f64,
    time_open: i64,
    time_close: i64,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct TradeResultWire {
    retcode: i64,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    position: u64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    price: f64,
}

impl From<TradeResultWire> for OrderReceipt {
    fn from(wire: TradeResultWire) -> Self {
        OrderReceipt {
            retcode: wire.retcode,
            ticket: wire.position,
            volume: wire.volume,
            price: wire.price,
            comment: wire.comment,
        }
    }
}

#[derive(Debug, Serialize)]
struct ModifyBody {
    ticket: u64,
    sl: f64,
    tp: f64,
}

#[derive(Debug, Serialize)]
struct CloseBody {
    ticket: u64,
    volume: f64,
}

// =============================================================================
// Trait implementations
// =============================================================================

impl MarketData for BridgeClient {
    fn bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        let wire: Vec<BarWire> = self.get(
            "bars",
            "/bars",
            &[
                ("symbol", symbol.to_string()),
                ("timeframe", timeframe.to_string()),
                ("count", count.to_string()),
            ],
        )?;
        if wire.is_empty() {
            return Err(BrokerError::NoData(format!("{} {}", symbol, timeframe)));
        }

        wire.into_iter()
            .map(|bar| {
                Candle::new(
                    timestamp(bar.time)?,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.tick_volume,
                )
                .map_err(|e| BrokerError::Parse(format!("{} bar at {}: {}", symbol, bar.time, e)))
            })
            .collect()
    }

    fn tick(&self, symbol: &Symbol) -> BrokerResult<Tick> {
        let wire: TickWire = self.get("tick", "/tick", &[("symbol", symbol.to_string())])?;
        Ok(Tick {
            bid: wire.bid,
            ask: wire.ask,
            time: timestamp(wire.time)?,
        })
    }

    fn instrument(&self, symbol: &Symbol) -> BrokerResult<InstrumentInfo> {
        let wire: SymbolWire = self.get("symbol", "/symbol", &[("symbol", symbol.to_string())])?;
        Ok(InstrumentInfo {
            symbol: symbol.clone(),
            digits: wire.digits,
            point: wire.point,
            contract_size: wire.trade_contract_size,
        })
    }

    fn server_time(&self) -> BrokerResult<DateTime<Utc>> {
        let wire: TimeWire = self.get("time", "/time", &[])?;
        timestamp(wire.time)
    }
}

impl Broker for BridgeClient {
    fn account(&mut self) -> BrokerResult<AccountSnapshot> {
        self.get("account", "/account", &[])
    }

    fn positions(
        &mut self,
        symbol: Option<&Symbol>,
        magic: u64,
    ) -> BrokerResult<Vec<BrokerPosition>> {
        let mut params = vec![("magic", magic.to_string())];
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        let wire: Vec<PositionWire> = self.get("positions", "/positions", &params)?;

        wire.into_iter()
            .filter(|p| p.magic == magic)
            .map(|p| {
                Ok(BrokerPosition {
                    ticket: p.ticket,
                    symbol: Symbol::new(&p.symbol),
                    side: p.side,
                    volume: p.volume,
                    open_price: p.price_open,
                    sl: p.sl,
                    tp: p.tp,
                    open_time: timestamp(p.time)?,
                    profit: p.profit,
                    magic: p.magic,
                    comment: p.comment,
                })
            })
            .collect()
    }

    fn send_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderReceipt> {
        self.trade("order_send", "/order", request).map(Into::into)
    }

    fn modify_stops(&mut self, ticket: u64, sl: f64, tp: f64) -> BrokerResult<()> {
        self.trade("modify", "/position/modify", &ModifyBody { ticket, sl, tp })
            .map(|_| ())
    }

    fn close_position(&mut self, ticket: u64, volume: f64) -> BrokerResult<OrderReceipt> {
        self.trade("close", "/position/close", &CloseBody { ticket, volume })
            .map(Into::into)
    }

    fn closed_trade(&mut self, ticket: u64) -> BrokerResult<Option<ClosedTrade>> {
        let wire: Option<ClosedTradeWire> =
            self.get("history", "/history/position", &[("ticket", ticket.to_string())])?;

        wire.map(|t| {
            Ok(ClosedTrade {
                ticket: t.ticket,
                symbol: Symbol::new(&t.symbol),
                side: t.side,
                volume: t.volume,
                open_price: t.price_open,
                close_price: t.price_close,
                profit: t.profit,
                open_time: timestamp(t.time_open)?,
                close_time: timestamp(t.time_close)?,
                reason: t.reason,
            })
        })
        .transpose()
    }
}
