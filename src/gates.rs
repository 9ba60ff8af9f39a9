//! Entry quality gates
//!
//! Six independent admission checks run against a candidate buy or sell:
//! bar freshness, EMA separation, higher-timeframe trend alignment,
//! Bollinger mean-reversion conflict, session window and spread ceiling.
//!
//! Every check is always evaluated and its reason kept, so a rejection shows
//! the full picture. Entry requires zero failures.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::indicators::{latest_emas, trend, IndicatorSnapshot, Trend};
use crate::{Action, Candle, Symbol, Tick};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Required |EMA fast - EMA slow| as a multiple of ATR
    pub ema_separation_factor: f64,
    /// Fraction of the Bollinger channel treated as "near a band"
    pub bb_conflict_threshold: f64,
    pub max_spread_pips: f64,
    /// Inclusive start hour, UTC
    pub session_start_hour: u32,
    /// Exclusive end hour, UTC
    pub session_end_hour: u32,
    pub max_bar_age_minutes: f64,
    /// EMA periods compared on the base timeframe closes
    pub ema_fast: usize,
    pub ema_slow: usize,
    /// EMA periods for the higher-timeframe trend
    pub mtf_ema_fast: usize,
    pub mtf_ema_slow: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ema_separation_factor: 0.15,
            bb_conflict_threshold: 0.25,
            max_spread_pips: 0.8,
            session_start_hour: 10,
            session_end_hour: 17,
            max_bar_age_minutes: 6.0,
            ema_fast: 9,
            ema_slow: 21,
            mtf_ema_fast: 9,
            mtf_ema_slow: 21,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Freshness,
    EmaSeparation,
    MtfAlignment,
    MeanReversion,
    Session,
    Spread,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gate::Freshness => "freshness",
            Gate::EmaSeparation => "ema_separation",
            Gate::MtfAlignment => "mtf_alignment",
            Gate::MeanReversion => "mean_reversion",
            Gate::Session => "session",
            Gate::Spread => "spread",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub gate: Gate,
    pub passed: bool,
    pub reason: String,
}

impl GateOutcome {
    fn pass(gate: Gate, reason: String) -> Self {
        Self {
            gate,
            passed: true,
            reason,
        }
    }

    fn fail(gate: Gate, reason: String) -> Self {
        Self {
            gate,
            passed: false,
            reason,
        }
    }
}

/// Everything the gates look at for one symbol
#[derive(Debug, Clone)]
pub struct MarketContext<'a> {
    pub symbol: &'a Symbol,
    /// Base timeframe bars, oldest first
    pub bars: &'a [Candle],
    pub higher_tf_bars: Option<&'a [Candle]>,
    pub indicators: &'a IndicatorSnapshot,
    pub current_price: f64,
    pub tick: Option<Tick>,
    pub pip_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateEvaluation {
    pub action: Action,
    pub outcomes: Vec<GateOutcome>,
}

impl GateEvaluation {
    pub fn admitted(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &GateOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    pub fn passed(&self) -> impl Iterator<Item = &GateOutcome> {
        self.outcomes.iter().filter(|o| o.passed)
    }

    /// Passed reasons first, then failed ones
    pub fn reasons(&self) -> Vec<String> {
        if self.action == Action::Hold {
            return vec!["Hold recommended - no entry quality check needed".to_string()];
        }
        self.passed()
            .chain(self.failed())
            .map(|o| o.reason.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct EntryGates {
    config: GateConfig,
}

impl EntryGates {
    pub fn new(config: GateConfig) -> Self {
        info!(
            "Entry gates initialized: EMA sep >= {}x ATR, BB conflict at {:.0}% extremes",
            config.ema_separation_factor,
            config.bb_conflict_threshold * 100.0
        );
        EntryGates { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Run every gate for `action`. Hold is admitted without checks.
    pub fn evaluate(
        &self,
        action: Action,
        market: &MarketContext<'_>,
        now: DateTime<Utc>,
    ) -> GateEvaluation {
        if action == Action::Hold {
            return GateEvaluation {
                action,
                outcomes: Vec::new(),
            };
        }

        let base_emas = self.base_emas(market.bars);
        let outcomes = vec![
            self.check_freshness(market.bars, now),
            self.check_ema_separation(base_emas, market.indicators.atr),
            self.check_mtf_alignment(base_emas, market),
            self.check_mean_reversion(action, market.indicators, market.current_price),
            self.check_session(now),
            self.check_spread(market.tick.as_ref(), market.pip_size),
        ];
        let evaluation = GateEvaluation { action, outcomes };

        if evaluation.admitted() {
            info!("Entry quality APPROVED for {} {}", action, market.symbol);
            for outcome in evaluation.passed() {
                info!("   PASS: {}", outcome.reason);
            }
        } else {
            warn!("Entry quality REJECTED for {} {}", action, market.symbol);
            for outcome in evaluation.failed() {
                warn!("   FAIL: {}", outcome.reason);
            }
        }

        evaluation
    }

    fn check_freshness(&self, bars: &[Candle], now: DateTime<Utc>) -> GateOutcome {
        let Some(last) = bars.last() else {
            return GateOutcome::fail(Gate::Freshness, "No bars for freshness check".to_string());
        };

        let age_minutes = (now - last.datetime).num_seconds() as f64 / 60.0;
        if age_minutes > self.config.max_bar_age_minutes {
            GateOutcome::fail(
                Gate::Freshness,
                format!("Latest bar too old: {:.1} min ago", age_minutes),
            )
        } else {
            GateOutcome::pass(
                Gate::Freshness,
                format!("Latest bar fresh: {:.1} min ago", age_minutes),
            )
        }
    }

    /// Fast and slow EMA of the base closes, unrounded
    fn base_emas(&self, bars: &[Candle]) -> Option<(f64, f64)> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        latest_emas(&closes, self.config.ema_fast, self.config.ema_slow)
    }

    fn check_ema_separation(&self, emas: Option<(f64, f64)>, atr: f64) -> GateOutcome {
        let Some((fast, slow)) = emas else {
            return GateOutcome::fail(
                Gate::EmaSeparation,
                "Cannot calculate EMAs for separation check".to_string(),
            );
        };
        let separation = (fast - slow).abs();
        let required = self.config.ema_separation_factor * atr;

        if separation < required {
            GateOutcome::fail(
                Gate::EmaSeparation,
                format!(
                    "EMA separation too small: {:.5} < {:.5} ({}x ATR)",
                    separation, required, self.config.ema_separation_factor
                ),
            )
        } else {
            GateOutcome::pass(
                Gate::EmaSeparation,
                format!(
                    "EMA separation OK: {:.5} >= {:.5} ({} trend)",
                    separation,
                    required,
                    Trend::from_emas(fast, slow)
                ),
            )
        }
    }

    fn check_mtf_alignment(
        &self,
        base_emas: Option<(f64, f64)>,
        market: &MarketContext<'_>,
    ) -> GateOutcome {
        let Some((fast, slow)) = base_emas else {
            return GateOutcome::fail(
                Gate::MtfAlignment,
                "Cannot calculate base timeframe EMAs".to_string(),
            );
        };
        let base = Trend::from_emas(fast, slow);

        let Some(higher) = market.higher_tf_bars else {
            return GateOutcome::fail(
                Gate::MtfAlignment,
                "Cannot get higher timeframe data for MTF alignment".to_string(),
            );
        };
        if higher.len() < self.config.mtf_ema_slow {
            return GateOutcome::fail(
                Gate::MtfAlignment,
                format!(
                    "Not enough higher timeframe bars: {} < {}",
                    higher.len(),
                    self.config.mtf_ema_slow
                ),
            );
        }

        let closes: Vec<f64> = higher.iter().map(|b| b.close).collect();
        let Some(higher_trend) = trend(&closes, self.config.mtf_ema_fast, self.config.mtf_ema_slow)
        else {
            return GateOutcome::fail(
                Gate::MtfAlignment,
                "Cannot calculate higher timeframe EMAs".to_string(),
            );
        };

        if higher_trend != base {
            GateOutcome::fail(
                Gate::MtfAlignment,
                format!("MTF conflict: base {} vs higher {}", base, higher_trend),
            )
        } else {
            GateOutcome::pass(
                Gate::MtfAlignment,
                format!("MTF alignment OK: both timeframes are {}", base),
            )
        }
    }

    fn check_mean_reversion(
        &self,
        action: Action,
        indicators: &IndicatorSnapshot,
        price: f64,
    ) -> GateOutcome {
        let Some(position) = indicators.bb_position(price) else {
            return GateOutcome::fail(
                Gate::MeanReversion,
                "Bollinger channel has zero width".to_string(),
            );
        };

        let upper = 1.0 - self.config.bb_conflict_threshold;
        let lower = self.config.bb_conflict_threshold;

        match action {
            Action::Buy if position >= upper => GateOutcome::fail(
                Gate::MeanReversion,
                format!(
                    "Conflict: BUY but price at upper {:.1}% of BB (expect rejection)",
                    position * 100.0
                ),
            ),
            Action::Sell if position <= lower => GateOutcome::fail(
                Gate::MeanReversion,
                format!(
                    "Conflict: SELL but price at lower {:.1}% of BB (expect bounce)",
                    position * 100.0
                ),
            ),
            _ => GateOutcome::pass(
                Gate::MeanReversion,
                format!("BB conflict OK: {} at {:.1}% of BB range", action, position * 100.0),
            ),
        }
    }

    fn check_session(&self, now: DateTime<Utc>) -> GateOutcome {
        let hour = now.hour();
        let (start, end) = (self.config.session_start_hour, self.config.session_end_hour);

        if (start..end).contains(&hour) {
            GateOutcome::pass(Gate::Session, format!("Session OK: {:02}:XX UTC", hour))
        } else {
            GateOutcome::fail(
                Gate::Session,
                format!(
                    "Outside trading hours: {:02}:XX UTC (trade {:02}-{:02} UTC)",
                    hour, start, end
                ),
            )
        }
    }

    fn check_spread(&self, tick: Option<&Tick>, pip_size: f64) -> GateOutcome {
        let Some(tick) = tick else {
            return GateOutcome::fail(
                Gate::Spread,
                "Cannot get current tick for spread check".to_string(),
            );
        };
        if pip_size <= 0.0 {
            return GateOutcome::fail(Gate::Spread, format!("Invalid pip size {}", pip_size));
        }

        let spread_pips = tick.spread() / pip_size;
        if spread_pips > self.config.max_spread_pips {
            GateOutcome::fail(
                Gate::Spread,
                format!(
                    "Spread too wide: {:.1} pips > {:.1} pip limit",
                    spread_pips, self.config.max_spread_pips
                ),
            )
        } else {
            GateOutcome::pass(
                Gate::Spread,
                format!(
                    "Spread OK: {:.1} pips <= {:.1} pip limit",
                    spread_pips, self.config.max_spread_pips
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::round_dp;
    use chrono::{Duration, TimeZone};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    fn series(closes: impl Iterator<Item = f64>, end: DateTime<Utc>, minutes: i64) -> Vec<Candle> {
        let closes: Vec<f64> = closes.collect();
        let n = closes.len() as i64;
        closes
            .into_iter()
            .enumerate()
            .map(|(i, c)| Candle {
                datetime: end - Duration::minutes(minutes * (n - 1 - i as i64)),
                open: c,
                high: c + 0.0001,
                low: c - 0.0001,
                close: c,
                volume: 100.0,
            })
            .collect()
    }

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: 55.0,
            macd: 0.00012,
            macd_signal: 0.0001,
            macd_histogram: 0.00002,
            bb_upper: 1.0870,
            bb_middle: 1.0860,
            bb_lower: 1.0850,
            sma_fast: 1.0859,
            sma_slow: 1.0840,
            ema_fast: 1.0860,
            ema_slow: 1.0855,
            stoch_k: 60.0,
            stoch_d: 58.0,
            atr: 0.0002,
        }
    }

    struct Fixture {
        symbol: Symbol,
        bars: Vec<Candle>,
        higher: Vec<Candle>,
        indicators: IndicatorSnapshot,
        price: f64,
        tick: Tick,
    }

    impl Fixture {
        fn scenario_a() -> Self {
            Fixture {
                symbol: Symbol::new("EURUSD"),
                bars: series((0..300).map(|i| 1.0800 + i as f64 * 0.00002), noon(), 5),
                higher: series((0..50).map(|i| 1.0800 + i as f64 * 0.0001), noon(), 15),
                indicators: snapshot(),
                price: 1.0861,
                tick: Tick {
                    bid: 1.0861,
                    ask: 1.08613,
                    time: noon(),
                },
            }
        }

        fn context(&self) -> MarketContext<'_> {
            MarketContext {
                symbol: &self.symbol,
                bars: &self.bars,
                higher_tf_bars: Some(&self.higher),
                indicators: &self.indicators,
                current_price: self.price,
                tick: Some(self.tick),
                pip_size: 0.0001,
            }
        }
    }

    fn now() -> DateTime<Utc> {
        noon() + Duration::minutes(2)
    }

    #[test]
    fn test_scenario_a_admits_buy() {
        let gates = EntryGates::new(GateConfig::default());
        let fixture = Fixture::scenario_a();
        let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now());

        assert!(evaluation.admitted(), "{:?}", evaluation.reasons());
        assert_eq!(evaluation.outcomes.len(), 6);
        assert_eq!(evaluation.failed().count(), 0);
    }

    #[test]
    fn test_scenario_b_wide_spread_fails_once() {
        let gates = EntryGates::new(GateConfig::default());
        let mut fixture = Fixture::scenario_a();
        fixture.tick.ask = fixture.tick.bid + 0.00012;

        let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now());
        assert!(!evaluation.admitted());
        let failed: Vec<_> = evaluation.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].gate, Gate::Spread);
        assert!(failed[0].reason.contains("Spread too wide: 1.2 pips"));
    }

    #[test]
    fn test_hold_is_admitted_without_checks() {
        let gates = EntryGates::new(GateConfig::default());
        let fixture = Fixture::scenario_a();
        let evaluation = gates.evaluate(Action::Hold, &fixture.context(), now());
        assert!(evaluation.admitted());
        assert_eq!(evaluation.reasons().len(), 1);
    }

    #[test]
    fn test_each_gate_can_flip_admission() {
        let gates = EntryGates::new(GateConfig::default());

        let all = [
            Gate::Freshness,
            Gate::EmaSeparation,
            Gate::MtfAlignment,
            Gate::MeanReversion,
            Gate::Session,
            Gate::Spread,
        ];

        for gate in all {
            let mut fixture = Fixture::scenario_a();
            let mut when = now();
            match gate {
                Gate::Freshness => when += Duration::minutes(10),
                Gate::EmaSeparation => {
                    fixture.bars = series((0..300).map(|i| 1.0800 + i as f64 * 0.000004), noon(), 5)
                }
                Gate::MtfAlignment => {
                    fixture.higher =
                        series((0..50).map(|i| 1.0900 - i as f64 * 0.0001), noon(), 15)
                }
                Gate::MeanReversion => fixture.price = 1.0867,
                Gate::Session => {
                    when -= Duration::hours(4);
                    fixture.bars = series((0..300).map(|i| 1.0800 + i as f64 * 0.00002), when, 5);
                }
                Gate::Spread => fixture.tick.ask = fixture.tick.bid + 0.0002,
            }

            let evaluation = gates.evaluate(Action::Buy, &fixture.context(), when);
            assert!(!evaluation.admitted(), "{} should reject", gate);
            let failed: Vec<Gate> = evaluation.failed().map(|o| o.gate).collect();
            assert_eq!(failed, vec![gate]);
            assert_eq!(evaluation.reasons().len(), 6);
        }
    }

    #[test]
    fn test_sell_near_lower_band_conflicts() {
        let gates = EntryGates::new(GateConfig::default());
        let fixture = Fixture::scenario_a();
        let outcome = gates.check_mean_reversion(Action::Sell, &fixture.indicators, 1.0852);
        assert!(!outcome.passed);

        let outcome = gates.check_mean_reversion(Action::Buy, &fixture.indicators, 1.0852);
        assert!(outcome.passed);
    }

    #[test]
    fn test_zero_width_channel_fails() {
        let gates = EntryGates::new(GateConfig::default());
        let mut indicators = snapshot();
        indicators.bb_upper = indicators.bb_lower;
        assert!(!gates.check_mean_reversion(Action::Buy, &indicators, 1.085).passed);
    }

    #[test]
    fn test_missing_inputs_fail() {
        let gates = EntryGates::new(GateConfig::default());
        assert!(!gates.check_spread(None, 0.0001).passed);
        assert!(!gates.check_freshness(&[], now()).passed);

        let fixture = Fixture::scenario_a();
        let base = gates.base_emas(&fixture.bars);
        let mut context = fixture.context();
        context.higher_tf_bars = None;
        assert!(!gates.check_mtf_alignment(base, &context).passed);

        let short = &fixture.higher[..10];
        context.higher_tf_bars = Some(short);
        assert!(!gates.check_mtf_alignment(base, &context).passed);

        assert!(gates.base_emas(&[]).is_none());
        assert!(!gates.check_ema_separation(None, 0.0002).passed);
    }

    #[test]
    fn test_ema_separation_resolves_below_snapshot_precision() {
        let gates = EntryGates::new(GateConfig::default());
        let mut fixture = Fixture::scenario_a();
        fixture.bars = series((0..300).map(|i| 1.0800 + i as f64 * 0.0000137), noon(), 5);

        let (fast, slow) = gates.base_emas(&fixture.bars).unwrap();
        let separation = fast - slow;
        let rounded = round_dp(fast, 5) - round_dp(slow, 5);
        fixture.indicators.ema_fast = round_dp(fast, 5);
        fixture.indicators.ema_slow = round_dp(slow, 5);

        // Threshold just under the true separation but above the 5 dp one
        let factor = gates.config().ema_separation_factor;
        fixture.indicators.atr = (separation - 1e-8) / factor;
        assert!(rounded < factor * fixture.indicators.atr);
        let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now());
        assert!(evaluation.admitted(), "{:?}", evaluation.reasons());

        fixture.indicators.atr = (separation + 1e-8) / factor;
        let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now());
        let failed: Vec<Gate> = evaluation.failed().map(|o| o.gate).collect();
        assert_eq!(failed, vec![Gate::EmaSeparation]);
    }

    #[test]
    fn test_reasons_list_passed_before_failed() {
        let gates = EntryGates::new(GateConfig::default());
        let mut fixture = Fixture::scenario_a();
        fixture.tick.ask = fixture.tick.bid + 0.0002;
        let evaluation = gates.evaluate(Action::Buy, &fixture.context(), now());
        let reasons = evaluation.reasons();
        assert!(reasons.last().unwrap().starts_with("Spread too wide"));
    }
}
