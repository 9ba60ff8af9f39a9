//! Per-cycle trading pipeline
//!
//! Symbols are processed strictly one after another. For each symbol:
//!
//! 1. reconcile positions the broker has closed (telemetry exit, guardrail result)
//! 2. manage the remaining open positions
//! 3. check guardrails, which only gate new entries
//! 4. fetch bars and compute indicators
//! 5. ask the decision source and validate its answer, archiving both
//! 6. run the entry gates
//! 7. compute levels and size the order
//! 8. send the order, archive the attempt and record the entry
//!
//! An error in one symbol is logged and the cycle moves on to the next.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::archive::DataArchive;
use crate::broker::{Broker, BrokerPosition, OrderRequest};
use crate::decision::parse_decision;
use crate::gates::{EntryGates, MarketContext};
use crate::guardrails::DailyGuardrails;
use crate::indicators::{self, IndicatorError, IndicatorSnapshot};
use crate::llm::{market_summary, DecisionSource};
use crate::sizing::{self, PositionSizer};
use crate::telemetry::{EntryRequest, TradeTelemetry};
use crate::trade_manager::{ManagementReport, TradeManager};
use crate::{Candle, Config, Symbol};

/// What happened to one symbol in one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    /// Guardrail stop, open-position limit or daily risk budget
    Blocked(String),
    InsufficientData { required: usize, available: usize },
    InvalidDecision(String),
    Hold,
    /// Failed gate reasons
    Rejected(Vec<String>),
    /// Admitted but not executed (sizing, levels or order failure)
    Skipped(String),
    Opened {
        ticket: u64,
        trade_id: Option<String>,
        volume: f64,
    },
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcomes: Vec<(Symbol, SymbolOutcome)>,
    pub errors: Vec<(Symbol, String)>,
    pub positions_managed: usize,
    pub exits_recorded: usize,
}

impl CycleReport {
    pub fn outcome(&self, symbol: &Symbol) -> Option<&SymbolOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, o)| o)
    }
}

/// A position this process opened (or recovered from telemetry)
#[derive(Debug, Clone)]
struct TrackedTrade {
    symbol: Symbol,
    trade_id: Option<String>,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send>;

pub struct TradingPipeline<B: Broker, D: DecisionSource> {
    config: Config,
    broker: B,
    decider: D,
    gates: EntryGates,
    sizer: PositionSizer,
    manager: TradeManager,
    guardrails: DailyGuardrails,
    telemetry: TradeTelemetry,
    archive: DataArchive,
    tracked: HashMap<u64, TrackedTrade>,
    clock: Clock,
    cycle_count: u64,
}

impl<B: Broker, D: DecisionSource> TradingPipeline<B, D> {
    /// Build the pipeline, opening the telemetry store and today's guardrail state
    pub fn new(config: Config, broker: B, decider: D) -> Result<Self> {
        let telemetry = TradeTelemetry::open(&config.telemetry)?.with_config_hash(config.fingerprint()?);
        Ok(Self::with_telemetry(config, broker, decider, telemetry))
    }

    pub fn with_telemetry(config: Config, broker: B, decider: D, telemetry: TradeTelemetry) -> Self {
        let now = Utc::now();
        let mut management = config.management.clone();
        management.bar_minutes = config.trading.timeframe.minutes();
        let mut pipeline = Self {
            gates: EntryGates::new(config.gates.clone()),
            sizer: PositionSizer::new(config.sizing.clone()),
            manager: TradeManager::new(management),
            guardrails: DailyGuardrails::open(config.guardrails.clone(), now),
            telemetry,
            archive: DataArchive::new(config.archive.clone()),
            tracked: HashMap::new(),
            clock: Box::new(Utc::now),
            cycle_count: 0,
            config,
            broker,
            decider,
        };
        pipeline.recover_open_trades();
        pipeline
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn decider(&self) -> &D {
        &self.decider
    }

    pub fn guardrails(&self) -> &DailyGuardrails {
        &self.guardrails
    }

    pub fn guardrails_mut(&mut self) -> &mut DailyGuardrails {
        &mut self.guardrails
    }

    pub fn telemetry(&self) -> &TradeTelemetry {
        &self.telemetry
    }

    pub fn manager(&self) -> &TradeManager {
        &self.manager
    }

    pub fn archive(&self) -> &DataArchive {
        &self.archive
    }

    /// Trade id recorded for an open ticket
    pub fn trade_id_for(&self, ticket: u64) -> Option<&str> {
        self.tracked.get(&ticket).and_then(|t| t.trade_id.as_deref())
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Rebuild ticket -> trade_id from open telemetry records
    fn recover_open_trades(&mut self) {
        let magic = self.config.trading.magic_number;
        let open = match self.telemetry.open_trades() {
            Ok(open) => open,
            Err(e) => {
                error!("Failed to read open trades from telemetry: {:#}", e);
                return;
            }
        };

        for record in open.into_iter().filter(|r| r.magic_number == magic) {
            let Some(ticket) = record.ticket else { continue };
            let r_distance = (record.entry_price - record.sl_price).abs();
            if record.sl_price > 0.0 && r_distance > 0.0 {
                self.manager.register(ticket, r_distance);
            }
            self.tracked.insert(
                ticket,
                TrackedTrade {
                    symbol: record.symbol.clone(),
                    trade_id: Some(record.trade_id),
                },
            );
        }
        if !self.tracked.is_empty() {
            info!("Recovered {} open trades from telemetry", self.tracked.len());
        }
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycle_count += 1;
        let mut report = CycleReport {
            cycle: self.cycle_count,
            ..CycleReport::default()
        };
        info!("Starting trading cycle {}", self.cycle_count);

        let symbols = self.config.symbols();
        let delay = Duration::from_secs(self.config.trading.inter_symbol_delay_secs);

        for (i, symbol) in symbols.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                debug!("Waiting {:?} before {}", delay, symbol);
                std::thread::sleep(delay);
            }

            match self.process_symbol(symbol, &mut report) {
                Ok(outcome) => {
                    debug!("{}: {:?}", symbol, outcome);
                    report.outcomes.push((symbol.clone(), outcome));
                }
                Err(e) => {
                    error!("Error processing {}: {:#}", symbol, e);
                    report.errors.push((symbol.clone(), format!("{:#}", e)));
                }
            }
        }

        info!(
            "Cycle {} complete: {} symbols, {} errors, {} positions managed, {} exits recorded",
            report.cycle,
            report.outcomes.len(),
            report.errors.len(),
            report.positions_managed,
            report.exits_recorded
        );
        report
    }

    fn process_symbol(&mut self, symbol: &Symbol, report: &mut CycleReport) -> Result<SymbolOutcome> {
        let now = self.now();
        let trading = self.config.trading.clone();

        // 1-2. reconcile and manage what is already open
        let positions = self.broker.positions(Some(symbol), trading.magic_number)?;
        report.exits_recorded += self.reconcile(symbol, &positions, now);

        let bars = self.broker.bars(symbol, trading.timeframe, trading.bars_count);
        if !positions.is_empty() {
            let atr = bars
                .as_ref()
                .ok()
                .and_then(|b| indicators::latest_atr(b, self.config.indicators.atr_period))
                .unwrap_or(f64::NAN);
            let managed = self.manage(&positions, atr, now);
            report.positions_managed += managed.positions_managed;
            report.exits_recorded += managed.exits;
        }

        // 3. guardrails
        let equity = match self.broker.account() {
            Ok(account) => Some(account.equity),
            Err(e) => {
                warn!("Account query failed: {}", e);
                None
            }
        };
        let verdict = self.guardrails.can_trade(now, equity);
        if !verdict.allowed {
            warn!("Guardrails prevent trading {}: {}", symbol, verdict.reason);
            return Ok(SymbolOutcome::Blocked(verdict.reason));
        }
        debug!("Guardrails passed: {}", verdict.reason);

        let open_count = self.broker.positions(None, trading.magic_number)?.len();
        if open_count >= trading.max_open_positions {
            let reason = format!(
                "Maximum open positions reached ({}/{})",
                open_count, trading.max_open_positions
            );
            warn!("{}", reason);
            return Ok(SymbolOutcome::Blocked(reason));
        }

        // 4. market data and indicators
        let bars = bars?;
        let higher_bars = match self.broker.bars(
            symbol,
            trading.confirmation_timeframe,
            trading.confirmation_bars,
        ) {
            Ok(b) => Some(b),
            Err(e) => {
                warn!("No {} bars for {}: {}", trading.confirmation_timeframe, symbol, e);
                None
            }
        };

        let snapshot = match indicators::compute(&bars, &self.config.indicators) {
            Ok(snapshot) => snapshot,
            Err(IndicatorError::InsufficientData { required, available }) => {
                warn!(
                    "Insufficient data for {}: {} bars, {} required",
                    symbol, available, required
                );
                return Ok(SymbolOutcome::InsufficientData { required, available });
            }
            Err(e) => return Err(e.into()),
        };
        let price = bars
            .last()
            .map(|b| b.close)
            .ok_or_else(|| anyhow!("no bars for {}", symbol))?;
        let instrument = self.broker.instrument(symbol)?;
        let pip_size = instrument.pip_size();
        let tick = match self.broker.tick(symbol) {
            Ok(tick) => Some(tick),
            Err(e) => {
                warn!("No tick for {}: {}", symbol, e);
                None
            }
        };

        // 5. decision
        let higher_trend = higher_bars.as_deref().and_then(|b| {
            let closes: Vec<f64> = b.iter().map(|c| c.close).collect();
            indicators::trend(&closes, self.config.gates.mtf_ema_fast, self.config.gates.mtf_ema_slow)
        });
        let summary = market_summary(
            symbol,
            price,
            &snapshot,
            &self.config.indicators,
            higher_trend,
            pip_size,
        );
        let raw = self.decider.decide(&summary)?;
        debug!("Decision source response for {}: {}", symbol, raw);

        let parsed = parse_decision(&raw, &self.config.decision);
        self.archive_cycle(symbol, now, &bars, price, &snapshot);
        if let Err(e) = self
            .archive
            .save_decision(symbol, now, &summary, &raw, parsed.as_ref())
        {
            warn!("Failed to archive decision for {}: {:#}", symbol, e);
        }

        let decision = match parsed {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Invalid decision for {}: {}", symbol, e);
                return Ok(SymbolOutcome::InvalidDecision(e.to_string()));
            }
        };
        info!(
            "Decision for {}: {} - {}",
            symbol, decision.action, decision.reasoning
        );
        let Some(side) = decision.action.side() else {
            info!("HOLD recommended for {} - no trade", symbol);
            return Ok(SymbolOutcome::Hold);
        };

        // 6. gates
        let market = MarketContext {
            symbol,
            bars: &bars,
            higher_tf_bars: higher_bars.as_deref(),
            indicators: &snapshot,
            current_price: price,
            tick,
            pip_size,
        };
        let evaluation = self.gates.evaluate(decision.action, &market, now);
        if !evaluation.admitted() {
            return Ok(SymbolOutcome::Rejected(
                evaluation.failed().map(|o| o.reason.clone()).collect(),
            ));
        }
        let Some(tick) = tick else {
            return Ok(SymbolOutcome::Skipped("no tick".to_string()));
        };

        // 7. levels and size
        let entry_price = tick.entry_price(side);
        let levels = match self.manager.compute_levels(
            decision.action,
            entry_price,
            snapshot.atr,
            snapshot.rsi,
            &instrument,
        ) {
            Ok(levels) => levels,
            Err(e) => {
                error!("Failed to calculate trade levels for {}: {}", symbol, e);
                return Ok(SymbolOutcome::Skipped(e.to_string()));
            }
        };
        let stop_wrong_side = (levels.sl_price - entry_price) * side.sign() >= 0.0;
        let target_wrong_side = (levels.tp_price - entry_price) * side.sign() <= 0.0;
        if stop_wrong_side || target_wrong_side {
            let reason = format!(
                "Invalid SL/TP for {}: entry {}, SL {}, TP {}",
                side, entry_price, levels.sl_price, levels.tp_price
            );
            error!("{}", reason);
            return Ok(SymbolOutcome::Skipped(reason));
        }

        // Sizing counts pips in its own increment
        let sizing_pips = levels.r_distance / sizing::pip_increment(&instrument);
        let sizing = self
            .sizer
            .size_from_broker(&mut self.broker, symbol, sizing_pips, None);
        if !sizing.valid {
            error!("Invalid position sizing: {}", sizing.reasoning);
            return Ok(SymbolOutcome::Skipped(sizing.reasoning));
        }
        if self.config.sizing.enforce_daily_risk_budget {
            let account = self.broker.account()?;
            let (ok, reason) = self.sizer.check_daily_risk(&account, sizing.risk_amount);
            if !ok {
                warn!("{}", reason);
                return Ok(SymbolOutcome::Blocked(reason));
            }
        }

        // 8. execute and record
        let request = OrderRequest {
            symbol: symbol.clone(),
            side,
            volume: sizing.volume,
            sl: levels.sl_price,
            tp: levels.tp_price,
            deviation: trading.max_slippage,
            magic: trading.magic_number,
            comment: format!("fx-pilot {}", decision.action),
        };
        let sent = self.broker.send_order(&request);
        if let Err(e) = self
            .archive
            .save_execution(now, &request, sent.as_ref().map_err(|e| e.to_string()))
        {
            warn!("Failed to archive order for {}: {:#}", symbol, e);
        }
        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(e) => {
                error!("Trade execution failed for {}: {}", symbol, e);
                return Ok(SymbolOutcome::Skipped(format!("order failed: {}", e)));
            }
        };
        info!(
            "TRADE EXECUTED: {} {} {:.2} lots at {:.5} (SL={:.5}, TP={:.5}), risk {:.2} ({:.3}%), {}",
            decision.action.as_str().to_uppercase(),
            symbol,
            receipt.volume,
            receipt.price,
            levels.sl_price,
            levels.tp_price,
            sizing.risk_amount,
            sizing.risk_pct_actual * 100.0,
            levels.risk_note
        );

        self.manager.register(receipt.ticket, levels.r_distance);
        let trade_id = match self.telemetry.log_entry(EntryRequest {
            symbol,
            ticket: Some(receipt.ticket),
            action: decision.action,
            volume: receipt.volume,
            entry_price: receipt.price,
            sl_price: levels.sl_price,
            tp_price: levels.tp_price,
            indicators: &snapshot,
            spread_pips: tick.spread() / pip_size,
            risk_amount: sizing.risk_amount,
            risk_pct: sizing.risk_pct_actual,
            pip_size,
            magic_number: trading.magic_number,
            now,
        }) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to log trade entry for {}: {:#}", symbol, e);
                None
            }
        };
        self.tracked.insert(
            receipt.ticket,
            TrackedTrade {
                symbol: symbol.clone(),
                trade_id: trade_id.clone(),
            },
        );
        self.guardrails
            .record_trade_entry(now, decision.action, receipt.volume, receipt.price);

        Ok(SymbolOutcome::Opened {
            ticket: receipt.ticket,
            trade_id,
            volume: receipt.volume,
        })
    }

    /// Bars and indicators behind this cycle's decision
    fn archive_cycle(
        &self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        bars: &[Candle],
        price: f64,
        snapshot: &IndicatorSnapshot,
    ) {
        if let Err(e) = self
            .archive
            .save_market_data(symbol, self.config.trading.timeframe, bars, now)
        {
            warn!("Failed to archive market data for {}: {:#}", symbol, e);
        }
        if let Err(e) = self.archive.save_indicators(symbol, now, price, snapshot) {
            warn!("Failed to archive indicators for {}: {:#}", symbol, e);
        }
    }

    // =========================================================================
    // Position lifecycle
    // =========================================================================

    /// Record exits for tracked tickets of `symbol` that are no longer open
    fn reconcile(&mut self, symbol: &Symbol, open: &[BrokerPosition], now: DateTime<Utc>) -> usize {
        let gone: Vec<u64> = self
            .tracked
            .iter()
            .filter(|(ticket, t)| &t.symbol == symbol && !open.iter().any(|p| p.ticket == **ticket))
            .map(|(ticket, _)| *ticket)
            .collect();

        gone.into_iter()
            .filter(|ticket| self.record_exit(*ticket, now, None))
            .count()
    }

    /// Fetch the outcome of a closed ticket and feed telemetry and guardrails
    fn record_exit(&mut self, ticket: u64, now: DateTime<Utc>, reason_override: Option<&str>) -> bool {
        let closed = match self.broker.closed_trade(ticket) {
            Ok(Some(closed)) => closed,
            Ok(None) => {
                debug!("No history yet for closed ticket {}", ticket);
                return false;
            }
            Err(e) => {
                error!("Failed to fetch history for ticket {}: {}", ticket, e);
                return false;
            }
        };

        self.manager.forget(ticket);
        let tracked = self.tracked.remove(&ticket);
        let reason = reason_override.unwrap_or(closed.reason.as_str());
        let bar_minutes = self.config.trading.timeframe.minutes().max(1);
        let bars = ((closed.close_time - closed.open_time).num_minutes() / bar_minutes).max(0) as u32;

        if let Some(trade_id) = tracked.and_then(|t| t.trade_id) {
            let logged = self.telemetry.log_exit(
                &trade_id,
                closed.close_price,
                closed.profit,
                reason,
                bars,
                closed.close_time,
            );
            if let Err(e) = logged {
                error!("Failed to log exit for {}: {:#}", trade_id, e);
            }
        }
        self.guardrails
            .record_trade_result(now, closed.profit, closed.profit > 0.0);
        true
    }

    fn manage(&mut self, positions: &[BrokerPosition], atr: f64, now: DateTime<Utc>) -> ManagedSummary {
        let report: ManagementReport = self.manager.manage(positions, atr, &mut self.broker, now);

        for view in &report.views {
            let Some(trade_id) = self.trade_id_for(view.ticket).map(str::to_string) else {
                continue;
            };
            if let Err(e) = self.telemetry.record_excursion(&trade_id, view.current_price) {
                error!("Failed to update excursion for {}: {:#}", trade_id, e);
            }
        }

        let mut exits = 0;
        for ticket in &report.closed_tickets {
            if self.record_exit(*ticket, now, Some("time_exit")) {
                exits += 1;
            }
        }

        ManagedSummary {
            positions_managed: report.positions_managed,
            exits,
        }
    }

    /// One management pass over every configured symbol (used at shutdown)
    pub fn manage_all(&mut self) -> usize {
        let now = self.now();
        let magic = self.config.trading.magic_number;
        let mut managed = 0;

        for symbol in self.config.symbols() {
            let positions = match self.broker.positions(Some(&symbol), magic) {
                Ok(positions) => positions,
                Err(e) => {
                    error!("Failed to list positions for {}: {}", symbol, e);
                    continue;
                }
            };
            self.reconcile(&symbol, &positions, now);
            if positions.is_empty() {
                continue;
            }
            let atr = self
                .broker
                .bars(&symbol, self.config.trading.timeframe, self.config.trading.bars_count)
                .ok()
                .and_then(|b| indicators::latest_atr(&b, self.config.indicators.atr_period))
                .unwrap_or(f64::NAN);
            managed += self.manage(&positions, atr, now).positions_managed;
        }
        managed
    }

    /// Seven-day report for this bot's magic number
    pub fn weekly_report(&self) -> Result<String> {
        self.telemetry
            .weekly_report(self.now(), Some(self.config.trading.magic_number))
    }
}

struct ManagedSummary {
    positions_managed: usize,
    exits: usize,
}
