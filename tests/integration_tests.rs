//! Integration tests for fx-pilot
//!
//! These tests run the components together on generated candle data: the
//! indicator engine feeding the gates, sizing against the paper broker, the
//! guardrail day cycle and full pipeline cycles with a scripted decision source.

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::VecDeque;
use tempfile::TempDir;

use fx_pilot::broker::paper::PaperBroker;
use fx_pilot::broker::{Broker, BrokerError, BrokerResult, MarketData, OrderRequest};
use fx_pilot::gates::{EntryGates, Gate, GateConfig, MarketContext};
use fx_pilot::guardrails::{DailyGuardrails, GuardrailConfig};
use fx_pilot::indicators::{self, IndicatorConfig, IndicatorError};
use fx_pilot::llm::DecisionSource;
use fx_pilot::pipeline::{SymbolOutcome, TradingPipeline};
use fx_pilot::sizing::{PositionSizer, SizingConfig};
use fx_pilot::telemetry::{EntryRequest, JsonlTradeStore, StoreBackend, TradeTelemetry};
use fx_pilot::trade_manager::{TradeManager, TradeManagerConfig};
use fx_pilot::{Action, Candle, Config, InstrumentInfo, Side, Symbol, Tick, Timeframe};

// =============================================================================
// Test Utilities
// =============================================================================

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
}

/// Two steps up, one step down: a steady uptrend that keeps price inside the bands
const ZIGZAG: [f64; 3] = [0.0001, 0.0001, -0.00016];

/// Bars from per-bar price changes, the last one opening at `end`
fn candles_from_moves(moves: &[f64], start: f64, end: DateTime<Utc>, minutes: i64) -> Vec<Candle> {
    let n = moves.len() as i64;
    let mut prev = start;
    moves
        .iter()
        .enumerate()
        .map(|(i, change)| {
            let open = prev;
            let close = prev + change;
            prev = close;
            Candle {
                datetime: end - Duration::minutes(minutes * (n - 1 - i as i64)),
                open,
                high: open.max(close) + 0.00003,
                low: open.min(close) - 0.00003,
                close,
                volume: 100.0,
            }
        })
        .collect()
}

/// 300 M5 bars of the zigzag uptrend ending at noon
fn scenario_a_bars() -> Vec<Candle> {
    let moves: Vec<f64> = (0..300).map(|i| ZIGZAG[i % 3]).collect();
    candles_from_moves(&moves, 1.08, noon(), 5)
}

/// 50 steadily rising M15 bars ending at noon
fn bullish_m15_bars() -> Vec<Candle> {
    candles_from_moves(&[0.0001; 50], 1.0790, noon(), 15)
}

fn bearish_m15_bars() -> Vec<Candle> {
    candles_from_moves(&[-0.0001; 50], 1.0890, noon(), 15)
}

fn tick(bid: f64, spread_pips: f64, time: DateTime<Utc>) -> Tick {
    Tick {
        bid,
        ask: bid + spread_pips * 0.0001,
        time,
    }
}

/// Quotes served to the paper broker
struct FakeMarket {
    base: Vec<Candle>,
    higher: Vec<Candle>,
    bid: f64,
    spread_pips: f64,
    time: DateTime<Utc>,
    /// Symbol for which every bar request fails
    broken: Option<Symbol>,
}

impl FakeMarket {
    fn scenario_a() -> Self {
        let base = scenario_a_bars();
        let bid = base.last().map(|c| c.close).unwrap();
        FakeMarket {
            base,
            higher: bullish_m15_bars(),
            bid,
            spread_pips: 0.3,
            time: noon() + Duration::minutes(2),
            broken: None,
        }
    }
}

impl MarketData for FakeMarket {
    fn bars(&self, symbol: &Symbol, timeframe: Timeframe, count: usize) -> BrokerResult<Vec<Candle>> {
        if self.broken.as_ref() == Some(symbol) {
            return Err(BrokerError::NoData(symbol.to_string()));
        }
        let bars = if timeframe == Timeframe::M15 {
            &self.higher
        } else {
            &self.base
        };
        Ok(bars[bars.len().saturating_sub(count)..].to_vec())
    }

    fn tick(&self, _: &Symbol) -> BrokerResult<Tick> {
        Ok(tick(self.bid, self.spread_pips, self.time))
    }

    fn instrument(&self, symbol: &Symbol) -> BrokerResult<InstrumentInfo> {
        Ok(InstrumentInfo::major(symbol.as_str()))
    }

    fn server_time(&self) -> BrokerResult<DateTime<Utc>> {
        Ok(self.time)
    }
}

const BUY: &str = r#"{"action": "buy", "reasoning": "EMA 9 above EMA 21 on both timeframes, price in the middle band, RSI neutral"}"#;
const HOLD: &str = r#"{"action": "hold", "reasoning": "waiting"}"#;

/// Replays canned responses, then holds
struct Scripted {
    responses: VecDeque<String>,
    summaries: Vec<String>,
}

impl Scripted {
    fn new(responses: &[&str]) -> Self {
        Scripted {
            responses: responses.iter().map(|r| r.to_string()).collect(),
            summaries: Vec::new(),
        }
    }
}

impl DecisionSource for Scripted {
    fn decide(&mut self, summary: &str) -> anyhow::Result<String> {
        self.summaries.push(summary.to_string());
        Ok(self.responses.pop_front().unwrap_or_else(|| HOLD.to_string()))
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.trading.inter_symbol_delay_secs = 0;
    config.sizing.max_volume = 0.04;
    config.telemetry.data_dir = dir.path().join("telemetry");
    config.archive.data_dir = dir.path().join("archive");
    config.guardrails.state_file = dir.path().join("daily_guardrails.json");
    config
}

type Pipeline = TradingPipeline<PaperBroker<FakeMarket>, Scripted>;

fn pipeline(config: Config, market: FakeMarket, responses: &[&str], now: DateTime<Utc>) -> Pipeline {
    let broker = PaperBroker::new(market, 10_000.0);
    TradingPipeline::new(config, broker, Scripted::new(responses))
        .unwrap()
        .with_clock(move || now)
}

fn eurusd() -> Symbol {
    Symbol::new("EURUSD")
}

// =============================================================================
// P1: indicator completeness
// =============================================================================

#[test]
fn test_indicator_window_boundary() {
    let config = IndicatorConfig::default();
    let bars = scenario_a_bars();
    let required = config.required_bars();

    for len in (required - 5)..required {
        let result = indicators::compute(&bars[bars.len() - len..], &config);
        assert_eq!(
            result,
            Err(IndicatorError::InsufficientData {
                required,
                available: len
            })
        );
    }

    for len in required..=(required + 5) {
        let snapshot = indicators::compute(&bars[bars.len() - len..], &config).unwrap();
        for (name, value) in snapshot.entries() {
            assert!(value.is_finite(), "{} missing at window {}", name, len);
        }
    }
}

// =============================================================================
// Scenarios A and B, P4: gates on computed indicators
// =============================================================================

struct GateFixture {
    symbol: Symbol,
    bars: Vec<Candle>,
    higher: Vec<Candle>,
    snapshot: indicators::IndicatorSnapshot,
    price: f64,
    tick: Tick,
}

impl GateFixture {
    fn scenario_a() -> Self {
        let bars = scenario_a_bars();
        let snapshot = indicators::compute(&bars, &IndicatorConfig::default()).unwrap();
        let price = bars.last().unwrap().close;
        GateFixture {
            symbol: eurusd(),
            bars,
            higher: bullish_m15_bars(),
            snapshot,
            price,
            tick: tick(price, 0.3, noon()),
        }
    }

    fn context(&self) -> MarketContext<'_> {
        MarketContext {
            symbol: &self.symbol,
            bars: &self.bars,
            higher_tf_bars: Some(&self.higher),
            indicators: &self.snapshot,
            current_price: self.price,
            tick: Some(self.tick),
            pip_size: 0.0001,
        }
    }
}

#[test]
fn test_scenario_a_indicators_describe_a_healthy_uptrend() {
    let fixture = GateFixture::scenario_a();
    let s = &fixture.snapshot;

    assert!(s.rsi > 45.0 && s.rsi < 60.0, "rsi {}", s.rsi);
    assert!(s.ema_fast > s.ema_slow);
    assert!(s.ema_fast - s.ema_slow >= 0.15 * s.atr);
    let position = s.bb_position(fixture.price).unwrap();
    assert!(position > 0.4 && position < 0.7, "bb position {}", position);
}

#[test]
fn test_scenario_a_admits_buy() {
    let fixture = GateFixture::scenario_a();
    let gates = EntryGates::new(GateConfig::default());
    let evaluation = gates.evaluate(Action::Buy, &fixture.context(), noon() + Duration::minutes(2));

    assert!(evaluation.admitted(), "{:?}", evaluation.reasons());
    assert_eq!(evaluation.failed().count(), 0);
    assert_eq!(evaluation.passed().count(), 6);
}

#[test]
fn test_scenario_b_wide_spread_rejects_with_one_reason() {
    let mut fixture = GateFixture::scenario_a();
    fixture.tick = tick(fixture.price, 1.2, noon());
    let gates = EntryGates::new(GateConfig::default());
    let evaluation = gates.evaluate(Action::Buy, &fixture.context(), noon() + Duration::minutes(2));

    assert!(!evaluation.admitted());
    let failed: Vec<_> = evaluation.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].gate, Gate::Spread);
    assert!(failed[0].reason.contains("Spread"));
}

#[test]
fn test_gate_conjunction_on_real_data() {
    let gates = EntryGates::new(GateConfig::default());
    let now = noon() + Duration::minutes(2);

    // conflicting higher timeframe
    let mut fixture = GateFixture::scenario_a();
    fixture.higher = bearish_m15_bars();
    let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now);
    let failed: Vec<Gate> = evaluation.failed().map(|o| o.gate).collect();
    assert_eq!(failed, vec![Gate::MtfAlignment]);

    // stale data
    let fixture = GateFixture::scenario_a();
    let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now + Duration::minutes(30));
    let failed: Vec<Gate> = evaluation.failed().map(|o| o.gate).collect();
    assert_eq!(failed, vec![Gate::Freshness]);

    // two failures are both reported
    let mut fixture = GateFixture::scenario_a();
    fixture.tick = tick(fixture.price, 2.0, noon());
    fixture.higher = bearish_m15_bars();
    let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now);
    assert!(!evaluation.admitted());
    assert_eq!(evaluation.failed().count(), 2);
    assert_eq!(evaluation.outcomes.len(), 6);
}

// =============================================================================
// Scenario C, P2: sizing
// =============================================================================

#[test]
fn test_scenario_c_sizing_clamps_to_max_volume() {
    let sizer = PositionSizer::new(SizingConfig::default());
    let eurusd = InstrumentInfo::major("EURUSD");
    let result = sizer.size(Some(&eurusd), Some(10_000.0), 20.0, Some(0.0015));

    assert!(result.valid);
    assert_relative_eq!(result.pip_value, 10.0, epsilon = 1e-9);
    assert_relative_eq!(result.raw_volume, 0.075, epsilon = 1e-9);
    assert_eq!(result.volume, 0.05);
    assert!(result.clamped);
    assert_relative_eq!(result.risk_amount, 10.0, epsilon = 1e-9);
    assert_relative_eq!(result.risk_pct_actual, 0.001, epsilon = 1e-9);
}

#[test]
fn test_sizing_from_paper_account() {
    let sizer = PositionSizer::new(SizingConfig::default());
    let mut broker = PaperBroker::new(FakeMarket::scenario_a(), 10_000.0);
    let result = sizer.size_from_broker(&mut broker, &eurusd(), 20.0, None);
    assert!(result.valid);
    assert_eq!(result.volume, 0.05);
}

proptest! {
    #[test]
    fn prop_sizing_volume_within_bounds(
        balance in 100.0f64..1_000_000.0,
        sl_pips in 0.5f64..500.0,
        risk_pct in 0.0001f64..0.05,
    ) {
        let config = SizingConfig::default();
        let sizer = PositionSizer::new(config.clone());
        let eurusd = InstrumentInfo::major("EURUSD");
        let result = sizer.size(Some(&eurusd), Some(balance), sl_pips, Some(risk_pct));

        prop_assert!(result.valid);
        prop_assert!(result.volume >= config.min_volume - 1e-12);
        prop_assert!(result.volume <= config.max_volume + 1e-12);

        let expected_pct = result.volume * sl_pips * result.pip_value / balance;
        prop_assert!((result.risk_pct_actual - expected_pct).abs() < 1e-12);
        if (result.raw_volume - result.volume).abs() > 1e-6 {
            prop_assert!(result.clamped);
            prop_assert!(result.risk_pct_actual != risk_pct);
        }
    }
}

// =============================================================================
// Scenario D, P3: guardrails
// =============================================================================

fn guardrails(dir: &TempDir) -> DailyGuardrails {
    let config = GuardrailConfig {
        state_file: dir.path().join("daily_guardrails.json"),
        ..GuardrailConfig::default()
    };
    DailyGuardrails::open(config, noon())
}

#[test]
fn test_scenario_d_consecutive_losses_stop_until_next_day() {
    let dir = TempDir::new().unwrap();
    let mut rails = guardrails(&dir);
    let equity = Some(10_000.0);
    assert!(rails.can_trade(noon(), equity).allowed);

    for i in 0..3 {
        let at = noon() + Duration::minutes(10 * i);
        rails.record_trade_entry(at, Action::Buy, 0.02, 1.085);
        rails.record_trade_result(at + Duration::minutes(5), -3.0, false);
    }

    let verdict = rails.can_trade(noon() + Duration::hours(2), equity);
    assert!(!verdict.allowed);
    assert!(verdict.reason.contains("Consecutive losses"), "{}", verdict.reason);

    let tomorrow = noon() + Duration::days(1);
    let verdict = rails.can_trade(tomorrow, equity);
    assert!(verdict.allowed, "{}", verdict.reason);
    assert_eq!(rails.state().consecutive_losses, 0);
    assert_eq!(rails.state().trades_today, 0);
}

#[test]
fn test_stop_is_sticky_for_the_rest_of_the_day() {
    let dir = TempDir::new().unwrap();
    let mut rails = guardrails(&dir);
    assert!(rails.can_trade(noon(), Some(10_000.0)).allowed);

    // 2% drawdown against a 1.5% limit
    assert!(!rails.can_trade(noon(), Some(9_800.0)).allowed);

    // later wins and recovered equity do not lift the stop
    for i in 1..=3 {
        let at = noon() + Duration::minutes(15 * i);
        rails.record_trade_result(at, 50.0, true);
        assert!(!rails.can_trade(at, Some(10_200.0)).allowed);
    }

    // the stop survives a restart on the same date
    let mut reopened = guardrails(&dir);
    assert!(!reopened.can_trade(noon() + Duration::hours(3), Some(10_200.0)).allowed);

    let tomorrow = noon() + Duration::days(1);
    assert!(reopened.can_trade(tomorrow, Some(10_200.0)).allowed);
    assert!(!reopened.state().daily_stopped);
}

// =============================================================================
// Scenario E, P5: position management
// =============================================================================

struct Quote {
    bid: f64,
}

impl MarketData for Quote {
    fn bars(&self, symbol: &Symbol, _: Timeframe, _: usize) -> BrokerResult<Vec<Candle>> {
        Err(BrokerError::NoData(symbol.to_string()))
    }

    fn tick(&self, _: &Symbol) -> BrokerResult<Tick> {
        Ok(Tick {
            bid: self.bid,
            ask: self.bid,
            time: noon(),
        })
    }

    fn instrument(&self, symbol: &Symbol) -> BrokerResult<InstrumentInfo> {
        Ok(InstrumentInfo::major(symbol.as_str()))
    }

    fn server_time(&self) -> BrokerResult<DateTime<Utc>> {
        Ok(noon())
    }
}

fn open_position(broker: &mut PaperBroker<Quote>, side: Side, volume: f64, sl: f64) -> u64 {
    broker
        .send_order(&OrderRequest {
            symbol: eurusd(),
            side,
            volume,
            sl,
            tp: 0.0,
            deviation: 10,
            magic: 7,
            comment: String::new(),
        })
        .unwrap()
        .ticket
}

/// Manage once at `price`; returns the stop afterwards
fn manage_at(manager: &mut TradeManager, broker: &mut PaperBroker<Quote>, price: f64, atr: f64) -> f64 {
    broker.market_mut().bid = price;
    let positions = broker.positions(None, 7).unwrap();
    manager.manage(&positions, atr, broker, noon() + Duration::minutes(10));
    broker.positions(None, 7).unwrap()[0].sl
}

#[test]
fn test_scenario_e_one_r_then_two_atr_rise() {
    let mut manager = TradeManager::new(TradeManagerConfig::default());
    let eurusd = InstrumentInfo::major("EURUSD");
    let atr = 0.0002;
    let levels = manager
        .compute_levels(Action::Buy, 1.08000, atr, 55.0, &eurusd)
        .unwrap();

    let mut broker = PaperBroker::new(Quote { bid: 1.08000 }, 10_000.0);
    let ticket = open_position(&mut broker, Side::Buy, 0.04, levels.sl_price);
    manager.register(ticket, levels.r_distance);

    // just past +1R: partial close and breakeven in the same pass
    let one_r = 1.08000 + levels.r_distance + 0.00001;
    broker.market_mut().bid = one_r;
    let positions = broker.positions(None, 7).unwrap();
    let report = manager.manage(&positions, atr, &mut broker, noon() + Duration::minutes(10));
    assert_eq!(report.partial_tps, 1);
    assert_eq!(report.breakeven_moves, 1);

    let position = broker.positions(None, 7).unwrap()[0].clone();
    assert_eq!(position.volume, 0.02);
    assert!(position.sl >= 1.08000);
    let protected = position.sl;

    // a further 2x ATR rise trails the stop up, never below breakeven
    let sl = manage_at(&mut manager, &mut broker, one_r + 2.0 * atr, atr);
    assert!(sl > protected);
    assert!(sl >= 1.08000);
    assert_eq!(broker.positions(None, 7).unwrap()[0].volume, 0.02);
}

proptest! {
    #[test]
    fn prop_long_trailing_stop_never_decreases(
        steps in prop::collection::vec(0.00001f64..0.0005, 1..40),
        atr in 0.00005f64..0.001,
    ) {
        let mut manager = TradeManager::new(TradeManagerConfig::default());
        let mut broker = PaperBroker::new(Quote { bid: 1.08000 }, 10_000.0);
        let ticket = open_position(&mut broker, Side::Buy, 0.04, 1.07900);
        manager.register(ticket, 0.0010);

        let mut price = 1.08000;
        let mut last_sl = 1.07900;
        for step in steps {
            price += step;
            let sl = manage_at(&mut manager, &mut broker, price, atr);
            prop_assert!(sl >= last_sl, "stop fell from {} to {}", last_sl, sl);
            last_sl = sl;
        }
    }

    #[test]
    fn prop_short_trailing_stop_never_increases(
        steps in prop::collection::vec(0.00001f64..0.0005, 1..40),
        atr in 0.00005f64..0.001,
    ) {
        let mut manager = TradeManager::new(TradeManagerConfig::default());
        let mut broker = PaperBroker::new(Quote { bid: 1.08000 }, 10_000.0);
        let ticket = open_position(&mut broker, Side::Sell, 0.04, 1.08100);
        manager.register(ticket, 0.0010);

        let mut price = 1.08000;
        let mut last_sl = 1.08100;
        for step in steps {
            price -= step;
            let sl = manage_at(&mut manager, &mut broker, price, atr);
            prop_assert!(sl <= last_sl, "stop rose from {} to {}", last_sl, sl);
            last_sl = sl;
        }
    }
}

// =============================================================================
// P6: telemetry R consistency
// =============================================================================

#[test]
fn test_result_r_survives_intermediate_reads() {
    let dir = TempDir::new().unwrap();
    let store = JsonlTradeStore::open(dir.path().join("trades.jsonl")).unwrap();
    let mut telemetry = TradeTelemetry::with_store(dir.path(), Box::new(store));
    let bars = scenario_a_bars();
    let snapshot = indicators::compute(&bars, &IndicatorConfig::default()).unwrap();

    for (i, pnl) in [12.5, -7.5, 0.0].into_iter().enumerate() {
        let now = noon() + Duration::seconds(i as i64);
        let trade_id = telemetry
            .log_entry(EntryRequest {
                symbol: &eurusd(),
                ticket: Some(i as u64 + 1),
                action: Action::Buy,
                volume: 0.02,
                entry_price: 1.08400,
                sl_price: 1.08340,
                tp_price: 1.08520,
                indicators: &snapshot,
                spread_pips: 0.3,
                risk_amount: 5.0,
                risk_pct: 0.0005,
                pip_size: 0.0001,
                magic_number: 123_457,
                now,
            })
            .unwrap();

        for _ in 0..3 {
            let open = telemetry.get(&trade_id).unwrap().unwrap();
            assert!(!open.is_closed());
            telemetry.record_excursion(&trade_id, 1.08420).unwrap();
        }

        let closed = telemetry
            .log_exit(&trade_id, 1.08450, pnl, "tp", 4, now + Duration::minutes(20))
            .unwrap();
        assert_relative_eq!(closed.result_r, pnl / 5.0);

        let stored = telemetry.get(&trade_id).unwrap().unwrap();
        assert_relative_eq!(stored.result_r, stored.profit_loss / stored.risk_amount);
        assert_eq!(stored.mfe_pips, 2.0);
    }

    assert_eq!(telemetry.open_trades().unwrap().len(), 0);
}

// =============================================================================
// Pipeline cycles
// =============================================================================

#[test]
fn test_pipeline_opens_manages_and_records_exit() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let now = noon() + Duration::minutes(2);
    let mut pipeline = pipeline(config, FakeMarket::scenario_a(), &[BUY], now);

    // cycle 1: scenario A entry
    let report = pipeline.run_cycle();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    let (ticket, trade_id) = match report.outcome(&eurusd()) {
        Some(SymbolOutcome::Opened {
            ticket,
            trade_id: Some(trade_id),
            volume,
        }) => {
            assert_eq!(*volume, 0.04);
            (*ticket, trade_id.clone())
        }
        other => panic!("expected an opened trade, got {:?}", other),
    };
    assert!(pipeline.decider().summaries[0].contains("Trading analysis: EURUSD"));
    assert_eq!(pipeline.guardrails().state().trades_today, 1);
    assert_eq!(pipeline.trade_id_for(ticket), Some(trade_id.as_str()));

    let entry = pipeline.telemetry().get(&trade_id).unwrap().unwrap();
    let position = pipeline.broker_mut().positions(None, 123_457).unwrap()[0].clone();
    assert_eq!(entry.ticket, Some(ticket));
    assert_eq!(entry.entry_price, position.open_price);
    assert!(position.sl < position.open_price && position.tp > position.open_price);
    assert_relative_eq!(entry.spread_pips, 0.3);
    assert!(entry.risk_amount > 0.0);
    assert_eq!(entry.session, "london_ny_overlap");

    // cycle 2: price reaches +1R, the source holds
    let r_distance = position.open_price - position.sl;
    pipeline.broker_mut().market_mut().bid = position.open_price + r_distance + 0.00004;
    let report = pipeline.run_cycle();
    assert_eq!(report.outcome(&eurusd()), Some(&SymbolOutcome::Hold));
    assert_eq!(report.positions_managed, 1);

    let managed = pipeline.broker_mut().positions(None, 123_457).unwrap()[0].clone();
    assert_eq!(managed.volume, 0.02);
    assert!(managed.sl >= position.open_price);
    let record = pipeline.telemetry().get(&trade_id).unwrap().unwrap();
    assert!(record.mfe_pips > 0.0);

    // cycle 3: price falls through the protected stop
    pipeline.broker_mut().market_mut().bid = managed.sl - 0.0001;
    let report = pipeline.run_cycle();
    assert_eq!(report.exits_recorded, 1);
    assert!(pipeline.broker_mut().positions(None, 123_457).unwrap().is_empty());
    assert_eq!(pipeline.trade_id_for(ticket), None);

    let closed = pipeline.telemetry().get(&trade_id).unwrap().unwrap();
    assert!(closed.is_closed());
    assert_eq!(closed.exit_reason, "sl");
    assert!(closed.profit_loss > 0.0);
    assert_relative_eq!(closed.result_r, closed.profit_loss / closed.risk_amount);
    assert_eq!(pipeline.guardrails().state().consecutive_losses, 0);
}

#[test]
fn test_pipeline_rejects_wide_spread() {
    let dir = TempDir::new().unwrap();
    let mut market = FakeMarket::scenario_a();
    market.spread_pips = 1.2;
    let mut pipeline = pipeline(test_config(&dir), market, &[BUY], noon() + Duration::minutes(2));

    let report = pipeline.run_cycle();
    match report.outcome(&eurusd()) {
        Some(SymbolOutcome::Rejected(reasons)) => {
            assert_eq!(reasons.len(), 1);
            assert!(reasons[0].contains("Spread"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(pipeline.broker_mut().positions(None, 123_457).unwrap().is_empty());
    assert_eq!(pipeline.guardrails().state().trades_today, 0);
}

#[test]
fn test_pipeline_invalid_decision_means_no_trade() {
    let dir = TempDir::new().unwrap();
    let responses = ["I think you should buy", r#"{"action": "buy", "reasoning": "EMA up"}"#];
    let mut pipeline = pipeline(
        test_config(&dir),
        FakeMarket::scenario_a(),
        &responses,
        noon() + Duration::minutes(2),
    );

    for _ in 0..2 {
        let report = pipeline.run_cycle();
        assert!(matches!(
            report.outcome(&eurusd()),
            Some(SymbolOutcome::InvalidDecision(_))
        ));
    }
    assert!(pipeline.broker_mut().positions(None, 123_457).unwrap().is_empty());

    // refused replies are still archived with the reason
    let now = noon() + Duration::minutes(2);
    let decisions = pipeline.archive().recent_decisions(None, now, 1, 10).unwrap();
    assert_eq!(decisions.len(), 2);
    assert!(decisions.iter().all(|d| !d.is_valid() && d.action.is_none()));
    assert!(decisions.iter().any(|d| d.response == responses[0]));
    assert!(pipeline.archive().recent_executions(None, now, 1, 10).unwrap().is_empty());
}

#[test]
fn test_pipeline_archives_cycle_data() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.archive.save_market_data = true;
    let now = noon() + Duration::minutes(2);
    let mut pipeline = pipeline(config, FakeMarket::scenario_a(), &[BUY], now);

    let report = pipeline.run_cycle();
    let Some(SymbolOutcome::Opened { ticket, .. }) = report.outcome(&eurusd()).cloned() else {
        panic!("expected an opened trade, got {:?}", report.outcome(&eurusd()));
    };

    let archive = pipeline.archive();
    let decisions = archive.recent_decisions(Some(&eurusd()), now, 1, 10).unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].prompt, pipeline.decider().summaries[0]);
    assert_eq!(decisions[0].response, BUY);
    assert_eq!(decisions[0].action.as_deref(), Some("buy"));

    let indicators = archive.load_historical_indicators(&eurusd(), now, 1).unwrap();
    assert_eq!(indicators.len(), 1);
    assert!(indicators[0].ema_fast > indicators[0].ema_slow);

    let executions = archive.recent_executions(None, now, 1, 10).unwrap();
    assert_eq!(executions.len(), 1);
    assert!(executions[0].success);
    assert_eq!(executions[0].ticket, Some(ticket));
    assert_eq!(executions[0].action, "buy");

    let stats = archive.storage_stats().unwrap();
    let files: Vec<(&str, usize)> = stats.directories.iter().map(|(n, d)| (*n, d.files)).collect();
    assert_eq!(
        files,
        vec![("market_data", 1), ("indicators", 1), ("decisions", 1), ("trades", 1)]
    );
}

#[test]
fn test_pipeline_insufficient_data_skips_symbol() {
    let dir = TempDir::new().unwrap();
    let mut market = FakeMarket::scenario_a();
    market.base.drain(..150);
    let mut pipeline = pipeline(test_config(&dir), market, &[BUY], noon() + Duration::minutes(2));

    let report = pipeline.run_cycle();
    assert_eq!(
        report.outcome(&eurusd()),
        Some(&SymbolOutcome::InsufficientData {
            required: 200,
            available: 150
        })
    );
    assert!(pipeline.decider().summaries.is_empty());
}

#[test]
fn test_pipeline_guardrail_stop_blocks_entries() {
    let dir = TempDir::new().unwrap();
    let now = noon() + Duration::minutes(2);
    let mut pipeline = pipeline(test_config(&dir), FakeMarket::scenario_a(), &[BUY], now);

    for _ in 0..3 {
        pipeline.guardrails_mut().record_trade_result(now, -5.0, false);
    }
    let report = pipeline.run_cycle();
    match report.outcome(&eurusd()) {
        Some(SymbolOutcome::Blocked(reason)) => assert!(reason.contains("Consecutive losses")),
        other => panic!("expected block, got {:?}", other),
    }
    assert!(pipeline.decider().summaries.is_empty());
}

#[test]
fn test_pipeline_open_position_limit() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.trading.max_open_positions = 1;
    let mut pipeline = pipeline(config, FakeMarket::scenario_a(), &[BUY, BUY], noon() + Duration::minutes(2));

    assert!(matches!(
        pipeline.run_cycle().outcome(&eurusd()),
        Some(SymbolOutcome::Opened { .. })
    ));
    match pipeline.run_cycle().outcome(&eurusd()) {
        Some(SymbolOutcome::Blocked(reason)) => assert!(reason.contains("Maximum open positions")),
        other => panic!("expected block, got {:?}", other),
    }
}

#[test]
fn test_pipeline_error_in_one_symbol_does_not_stop_the_cycle() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.trading.symbols = vec!["GBPUSD".to_string(), "EURUSD".to_string()];
    let mut market = FakeMarket::scenario_a();
    market.broken = Some(Symbol::new("GBPUSD"));
    let mut pipeline = pipeline(config, market, &[HOLD], noon() + Duration::minutes(2));

    let report = pipeline.run_cycle();
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, Symbol::new("GBPUSD"));
    assert_eq!(report.outcome(&eurusd()), Some(&SymbolOutcome::Hold));
}

#[test]
fn test_pipeline_recovers_open_trades_after_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.telemetry.backend = StoreBackend::Sqlite;
    let now = noon() + Duration::minutes(2);

    let mut first = pipeline(config.clone(), FakeMarket::scenario_a(), &[BUY], now);
    let (ticket, trade_id) = match first.run_cycle().outcome(&eurusd()) {
        Some(SymbolOutcome::Opened {
            ticket,
            trade_id: Some(trade_id),
            ..
        }) => (*ticket, trade_id.clone()),
        other => panic!("expected an opened trade, got {:?}", other),
    };
    drop(first);

    let second = pipeline(config, FakeMarket::scenario_a(), &[], now);
    assert_eq!(second.trade_id_for(ticket), Some(trade_id.as_str()));
    assert!(second.manager().is_tracked(ticket));
}

#[test]
fn test_pipeline_weekly_report_covers_closed_trades() {
    let dir = TempDir::new().unwrap();
    let now = noon() + Duration::minutes(2);
    let mut pipeline = pipeline(test_config(&dir), FakeMarket::scenario_a(), &[BUY], now);
    pipeline.run_cycle();

    let position = pipeline.broker_mut().positions(None, 123_457).unwrap()[0].clone();
    pipeline.broker_mut().market_mut().bid = position.sl - 0.0001;
    let report = pipeline.run_cycle();
    assert_eq!(report.exits_recorded, 1);
    assert_eq!(pipeline.guardrails().state().consecutive_losses, 1);

    let text = pipeline.weekly_report().unwrap();
    assert!(text.contains("Total Trades: 1"));
    assert!(text.contains("0W / 1L"));
}
