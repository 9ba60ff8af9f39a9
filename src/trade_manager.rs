//! Trade management
//!
//! ATR-based stop/target levels for new positions, and the mechanical exit
//! rules applied to every open position each cycle, in priority order:
//!
//! 1. time exit after N bars (closes everything, nothing else runs)
//! 2. partial take-profit once at +1R
//! 3. breakeven stop at +1R
//! 4. ATR trailing stop, only ever tightening
//!
//! R is always measured against the stop distance the position was opened
//! with, which the manager remembers per ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerPosition};
use crate::types::round_to_step;
use crate::{Action, InstrumentInfo, Side, Symbol, Tick};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeManagerConfig {
    /// Base stop distance in ATRs
    pub atr_sl_multiplier: f64,
    /// Target distance as a multiple of the stop distance
    pub atr_tp_ratio: f64,
    pub extreme_rsi_sl_multiplier: f64,
    pub extreme_rsi_tp_ratio: f64,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub trailing_atr_multiplier: f64,
    pub time_exit_bars: f64,
    /// Minutes per bar of the managed timeframe
    pub bar_minutes: i64,
    /// Fraction of volume closed at +1R
    pub partial_tp_fraction: f64,
    pub min_volume: f64,
    pub lot_step: f64,
    /// R distance assumed for positions without a stop or a known entry record
    pub fallback_r_distance: f64,
}

impl Default for TradeManagerConfig {
    fn default() -> Self {
        Self {
            atr_sl_multiplier: 3.5,
            atr_tp_ratio: 2.0,
            extreme_rsi_sl_multiplier: 4.5,
            extreme_rsi_tp_ratio: 1.5,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            trailing_atr_multiplier: 2.0,
            time_exit_bars: 15.0,
            bar_minutes: 5,
            partial_tp_fraction: 0.5,
            min_volume: 0.01,
            lot_step: 0.01,
            fallback_r_distance: 0.002,
        }
    }
}

/// Stop and target for a new position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLevels {
    pub sl_price: f64,
    pub tp_price: f64,
    pub sl_pips: f64,
    pub tp_pips: f64,
    pub atr_multiplier_used: f64,
    pub tp_ratio_used: f64,
    /// 1R: the stop distance in price units
    pub r_distance: f64,
    pub risk_note: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LevelsError {
    #[error("no levels for a hold action")]
    HoldAction,

    #[error("invalid ATR value {0}")]
    InvalidAtr(f64),

    #[error("invalid entry price {0}")]
    InvalidEntry(f64),
}

/// Management-time projection of a broker position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenPositionView {
    pub ticket: u64,
    pub symbol: Symbol,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    /// Bid for longs, ask for shorts
    pub current_price: f64,
    /// 0.0 when no stop is set
    pub sl: f64,
    pub tp: f64,
    pub profit: f64,
    pub open_time: DateTime<Utc>,
    pub r_distance: f64,
    pub r_multiple: f64,
    pub bars_in_trade: f64,
}

impl OpenPositionView {
    pub fn from_broker(
        position: &BrokerPosition,
        tick: &Tick,
        now: DateTime<Utc>,
        bar_minutes: i64,
        r_distance: f64,
    ) -> Self {
        let current_price = tick.exit_price(position.side);
        let price_move = (current_price - position.open_price) * position.side.sign();
        let r_multiple = if r_distance > 0.0 {
            price_move / r_distance
        } else {
            0.0
        };
        let elapsed_secs = (now - position.open_time).num_seconds() as f64;
        let bars_in_trade = elapsed_secs / (bar_minutes.max(1) as f64 * 60.0);

        Self {
            ticket: position.ticket,
            symbol: position.symbol.clone(),
            side: position.side,
            volume: position.volume,
            open_price: position.open_price,
            current_price,
            sl: position.sl,
            tp: position.tp,
            profit: position.profit,
            open_time: position.open_time,
            r_distance,
            r_multiple,
            bars_in_trade,
        }
    }

    pub fn has_stop(&self) -> bool {
        self.sl > 0.0
    }

    /// Stop sits at entry or on the profit side of it
    pub fn stop_at_or_beyond_entry(&self) -> bool {
        self.has_stop()
            && match self.side {
                Side::Buy => self.sl >= self.open_price,
                Side::Sell => self.sl <= self.open_price,
            }
    }

    /// Would `candidate` reduce the risk of the current stop?
    pub fn tightens(&self, candidate: f64) -> bool {
        if !self.has_stop() {
            return true;
        }
        match self.side {
            Side::Buy => candidate > self.sl,
            Side::Sell => candidate < self.sl,
        }
    }
}

/// What one management pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagementReport {
    pub positions_managed: usize,
    pub time_exits: usize,
    pub partial_tps: usize,
    pub breakeven_moves: usize,
    pub trailing_stops: usize,
    pub failures: usize,
    /// Tickets fully closed by the time exit
    pub closed_tickets: Vec<u64>,
    /// Positions still open after the pass, with their updated stops and volume
    pub views: Vec<OpenPositionView>,
}

impl ManagementReport {
    pub fn actions(&self) -> usize {
        self.time_exits + self.partial_tps + self.breakeven_moves + self.trailing_stops
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PositionBook {
    r_distance: f64,
    partial_taken: bool,
}

pub struct TradeManager {
    config: TradeManagerConfig,
    book: HashMap<u64, PositionBook>,
}

impl TradeManager {
    pub fn new(config: TradeManagerConfig) -> Self {
        info!(
            "Trade manager initialized: SL={}x ATR, TP={}x SL, time exit={} bars",
            config.atr_sl_multiplier, config.atr_tp_ratio, config.time_exit_bars
        );
        Self {
            config,
            book: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TradeManagerConfig {
        &self.config
    }

    /// ATR-based stop and target for a new position.
    ///
    /// Buying into an overbought RSI or selling into an oversold one uses the
    /// wider stop and the tighter target.
    pub fn compute_levels(
        &self,
        action: Action,
        entry_price: f64,
        atr: f64,
        rsi: f64,
        instrument: &InstrumentInfo,
    ) -> Result<TradeLevels, LevelsError> {
        let side = action.side().ok_or(LevelsError::HoldAction)?;
        if !(atr.is_finite() && atr > 0.0) {
            return Err(LevelsError::InvalidAtr(atr));
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(LevelsError::InvalidEntry(entry_price));
        }

        let extreme = match side {
            Side::Buy => rsi > self.config.rsi_overbought,
            Side::Sell => rsi < self.config.rsi_oversold,
        };
        let (sl_multiplier, tp_ratio, risk_note) = if extreme {
            (
                self.config.extreme_rsi_sl_multiplier,
                self.config.extreme_rsi_tp_ratio,
                format!("RSI extreme ({:.1}) - wider SL, tighter TP", rsi),
            )
        } else {
            (
                self.config.atr_sl_multiplier,
                self.config.atr_tp_ratio,
                format!("Normal RSI ({:.1}) - standard SL/TP", rsi),
            )
        };

        let sl_distance = atr * sl_multiplier;
        let tp_distance = sl_distance * tp_ratio;
        let pip_size = instrument.pip_size();

        Ok(TradeLevels {
            sl_price: instrument.round_price(entry_price - side.sign() * sl_distance),
            tp_price: instrument.round_price(entry_price + side.sign() * tp_distance),
            sl_pips: sl_distance / pip_size,
            tp_pips: tp_distance / pip_size,
            atr_multiplier_used: sl_multiplier,
            tp_ratio_used: tp_ratio,
            r_distance: sl_distance,
            risk_note,
        })
    }

    /// Remember the original stop distance of a freshly opened position
    pub fn register(&mut self, ticket: u64, r_distance: f64) {
        self.book.insert(
            ticket,
            PositionBook {
                r_distance,
                partial_taken: false,
            },
        );
    }

    /// Drop a position that is no longer open
    pub fn forget(&mut self, ticket: u64) {
        self.book.remove(&ticket);
    }

    pub fn is_tracked(&self, ticket: u64) -> bool {
        self.book.contains_key(&ticket)
    }

    /// Adopt a position opened before this process started
    fn adopt(&mut self, position: &BrokerPosition) -> PositionBook {
        let r_distance = if position.sl > 0.0 {
            (position.sl - position.open_price).abs()
        } else {
            0.0
        };
        let r_distance = if r_distance > 0.0 {
            r_distance
        } else {
            self.config.fallback_r_distance
        };
        let partial_taken = position.sl > 0.0
            && match position.side {
                Side::Buy => position.sl >= position.open_price,
                Side::Sell => position.sl <= position.open_price,
            };

        let entry = PositionBook {
            r_distance,
            partial_taken,
        };
        self.book.insert(position.ticket, entry);
        entry
    }

    pub fn view(&mut self, position: &BrokerPosition, tick: &Tick, now: DateTime<Utc>) -> OpenPositionView {
        let book = match self.book.get(&position.ticket) {
            Some(entry) => *entry,
            None => self.adopt(position),
        };
        OpenPositionView::from_broker(position, tick, now, self.config.bar_minutes, book.r_distance)
    }

    /// Apply the exit rules to every position, in order.
    ///
    /// Each successful modification updates the local view, so later steps
    /// in the same pass see the new stop and volume.
    pub fn manage<B: Broker + ?Sized>(
        &mut self,
        positions: &[BrokerPosition],
        current_atr: f64,
        broker: &mut B,
        now: DateTime<Utc>,
    ) -> ManagementReport {
        let mut report = ManagementReport::default();
        let mut instruments: HashMap<Symbol, Option<InstrumentInfo>> = HashMap::new();

        for position in positions {
            let tick = match broker.tick(&position.symbol) {
                Ok(tick) => tick,
                Err(e) => {
                    error!("Cannot price position {}: {}", position.ticket, e);
                    report.failures += 1;
                    continue;
                }
            };
            let instrument = instruments
                .entry(position.symbol.clone())
                .or_insert_with(|| match broker.instrument(&position.symbol) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!("No instrument info for {}: {}", position.symbol, e);
                        None
                    }
                })
                .clone();

            let mut view = self.view(position, &tick, now);
            report.positions_managed += 1;

            if view.bars_in_trade >= self.config.time_exit_bars {
                match broker.close_position(view.ticket, view.volume) {
                    Ok(_) => {
                        info!(
                            "Time exit: Closed {} after {:.1} bars at {:+.2}R",
                            view.symbol, view.bars_in_trade, view.r_multiple
                        );
                        report.time_exits += 1;
                        report.closed_tickets.push(view.ticket);
                        continue;
                    }
                    Err(e) => {
                        error!("Failed time exit for {}: {}", view.ticket, e);
                        report.failures += 1;
                    }
                }
            }

            if view.r_multiple >= 1.0 {
                self.partial_take_profit(&mut view, broker, &mut report);
                self.move_to_breakeven(&mut view, broker, &mut report);
            }

            if current_atr.is_finite() && current_atr > 0.0 {
                self.apply_trailing_stop(&mut view, current_atr, instrument.as_ref(), broker, &mut report);
            }

            report.views.push(view);
        }

        if report.positions_managed > 0 {
            info!(
                "Position management complete: {} managed, {} time exits, {} partial TPs, {} breakeven, {} trailing, {} failures",
                report.positions_managed,
                report.time_exits,
                report.partial_tps,
                report.breakeven_moves,
                report.trailing_stops,
                report.failures
            );
        }
        report
    }

    fn partial_take_profit<B: Broker + ?Sized>(
        &mut self,
        view: &mut OpenPositionView,
        broker: &mut B,
        report: &mut ManagementReport,
    ) {
        let Some(entry) = self.book.get_mut(&view.ticket) else {
            return;
        };
        if entry.partial_taken {
            return;
        }

        let partial = round_to_step(view.volume * self.config.partial_tp_fraction, self.config.lot_step);
        if partial < self.config.min_volume || partial >= view.volume {
            return;
        }

        match broker.close_position(view.ticket, partial) {
            Ok(_) => {
                entry.partial_taken = true;
                view.volume = round_to_step(view.volume - partial, self.config.lot_step);
                report.partial_tps += 1;
                info!(
                    "Partial TP: Closed {} lots of {} at {:+.2}R",
                    partial, view.symbol, view.r_multiple
                );
            }
            Err(e) => {
                error!("Failed partial TP for {}: {}", view.ticket, e);
                report.failures += 1;
            }
        }
    }

    fn move_to_breakeven<B: Broker + ?Sized>(
        &mut self,
        view: &mut OpenPositionView,
        broker: &mut B,
        report: &mut ManagementReport,
    ) {
        if view.stop_at_or_beyond_entry() {
            return;
        }

        match broker.modify_stops(view.ticket, view.open_price, view.tp) {
            Ok(()) => {
                view.sl = view.open_price;
                report.breakeven_moves += 1;
                info!(
                    "Moved to breakeven: {} ticket {} at {:+.2}R",
                    view.symbol, view.ticket, view.r_multiple
                );
            }
            Err(e) => {
                error!("Failed to move to breakeven for {}: {}", view.ticket, e);
                report.failures += 1;
            }
        }
    }

    fn apply_trailing_stop<B: Broker + ?Sized>(
        &mut self,
        view: &mut OpenPositionView,
        atr: f64,
        instrument: Option<&InstrumentInfo>,
        broker: &mut B,
        report: &mut ManagementReport,
    ) {
        let trail = atr * self.config.trailing_atr_multiplier;
        let raw = view.current_price - view.side.sign() * trail;
        let candidate = instrument.map_or(raw, |info| info.round_price(raw));

        if !view.tightens(candidate) {
            return;
        }

        match broker.modify_stops(view.ticket, candidate, view.tp) {
            Ok(()) => {
                view.sl = candidate;
                report.trailing_stops += 1;
                info!(
                    "Trail stop: {} SL moved to {:.5} ({}x ATR trail)",
                    view.symbol, candidate, self.config.trailing_atr_multiplier
                );
            }
            Err(e) => {
                error!("Failed trailing stop for {}: {}", view.ticket, e);
                report.failures += 1;
            }
        }
    }
}
