//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Every section has defaults, so a
//! config file only needs the keys it wants to change.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::archive::ArchiveConfig;
use crate::broker::BridgeConfig;
use crate::decision::DecisionLimits;
use crate::gates::GateConfig;
use crate::guardrails::GuardrailConfig;
use crate::indicators::IndicatorConfig;
use crate::llm::LlmConfig;
use crate::sizing::SizingConfig;
use crate::telemetry::TelemetryConfig;
use crate::trade_manager::TradeManagerConfig;
use crate::{Symbol, Timeframe};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub indicators: IndicatorConfig,
    pub sizing: SizingConfig,
    pub guardrails: GuardrailConfig,
    pub gates: GateConfig,
    pub management: TradeManagerConfig,
    pub telemetry: TelemetryConfig,
    pub archive: ArchiveConfig,
    pub decision: DecisionLimits,
    pub llm: LlmConfig,
    pub broker: BridgeConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load credentials from environment if set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(api_key);
        }
        if let Ok(url) = std::env::var("FX_BRIDGE_URL") {
            self.broker.base_url = url;
        }
        if let Ok(key) = std::env::var("FX_BRIDGE_KEY") {
            self.broker.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("FX_BRIDGE_SECRET") {
            self.broker.api_secret = Some(secret);
        }
    }

    /// Reject limits that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.trading.symbols.is_empty() {
            bail!("trading.symbols must list at least one instrument");
        }
        if self.sizing.min_volume <= 0.0 || self.sizing.min_volume > self.sizing.max_volume {
            bail!(
                "sizing volume range is invalid: min={} max={}",
                self.sizing.min_volume,
                self.sizing.max_volume
            );
        }
        if !(self.sizing.risk_per_trade > 0.0 && self.sizing.risk_per_trade < 0.05) {
            bail!(
                "sizing.risk_per_trade must be a fraction in (0, 0.05), got {}",
                self.sizing.risk_per_trade
            );
        }
        if self.gates.session_start_hour >= self.gates.session_end_hour
            || self.gates.session_end_hour > 24
        {
            bail!(
                "gates session window {}..{} is invalid",
                self.gates.session_start_hour,
                self.gates.session_end_hour
            );
        }
        if !(self.management.partial_tp_fraction > 0.0 && self.management.partial_tp_fraction <= 1.0)
        {
            bail!("management.partial_tp_fraction must be in (0, 1]");
        }
        if self.trading.max_open_positions == 0 {
            bail!("trading.max_open_positions must be at least 1");
        }
        if self.guardrails.max_consecutive_losses == 0 || self.guardrails.max_daily_trades == 0 {
            bail!("guardrail limits must be at least 1");
        }
        self.indicators.validate()?;
        Ok(())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.trading.symbols.iter().map(Symbol::new).collect()
    }

    /// Short fingerprint of the effective configuration.
    ///
    /// Credentials are excluded so the hash is stable across environments.
    pub fn fingerprint(&self) -> Result<String> {
        let serialized = serde_json::to_string(&self.redacted())
            .context("Failed to serialize config for fingerprint")?;
        let digest = Sha256::digest(serialized.as_bytes());
        Ok(hex::encode(digest)[..16].to_string())
    }

    fn redacted(&self) -> Config {
        let mut redacted = self.clone();
        redacted.llm.api_key = None;
        redacted.broker.api_key = None;
        redacted.broker.api_secret = None;
        redacted
    }
}

/// Trading loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    /// Base timeframe for indicators and decisions
    pub timeframe: Timeframe,
    /// Higher timeframe used for trend confirmation
    pub confirmation_timeframe: Timeframe,
    pub bars_count: usize,
    pub confirmation_bars: usize,
    pub cycle_interval_secs: u64,
    pub inter_symbol_delay_secs: u64,
    /// Tag identifying positions opened by this bot
    pub magic_number: u64,
    /// Max slippage in points
    pub max_slippage: u32,
    /// UTC hour at which the weekly report is produced once per day
    pub report_hour_utc: u32,
    /// Entries stop while this many positions with our magic are open
    pub max_open_positions: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["EURUSD".to_string()],
            timeframe: Timeframe::M5,
            confirmation_timeframe: Timeframe::M15,
            bars_count: 300,
            confirmation_bars: 50,
            cycle_interval_secs: 300,
            inter_symbol_delay_secs: 2,
            magic_number: 123_457,
            max_slippage: 10,
            report_hour_utc: 17,
            max_open_positions: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.symbols, vec!["EURUSD".to_string()]);
        assert_eq!(config.sizing.max_volume, 0.05);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"trading": {{"symbols": ["EURUSD", "GBPUSD"]}}, "sizing": {{"max_volume": 0.1}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.trading.symbols.len(), 2);
        assert_eq!(config.trading.timeframe, Timeframe::M5);
        assert_eq!(config.sizing.max_volume, 0.1);
        assert_eq!(config.sizing.min_volume, 0.01);
        assert_eq!(config.guardrails.max_daily_trades, 6);
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/fx_pilot.json");
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.trading.confirmation_timeframe, Timeframe::M15);
        assert_eq!(config.gates.mtf_ema_slow, 21);
        assert_eq!(config.management.rsi_overbought, 70.0);
        assert_eq!(config.gates.ema_slow, 21);
        assert!(config.archive.enabled);
        assert!(!config.archive.save_market_data);
    }

    #[test]
    fn test_invalid_volume_range_rejected() {
        let mut config = Config::default();
        config.sizing.min_volume = 0.1;
        config.sizing.max_volume = 0.05;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_credentials() {
        let mut a = Config::default();
        let b = Config::default();
        a.llm.api_key = Some("sk-test".to_string());
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 16);

        a.sizing.max_volume = 0.2;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_fingerprint_hashes_serialized_config() {
        let config = Config::default();
        let empty = hex::encode(Sha256::digest(b""))[..16].to_string();
        let fingerprint = config.fingerprint().unwrap();
        assert_ne!(fingerprint, empty);

        let expected = hex::encode(Sha256::digest(
            serde_json::to_string(&config).unwrap().as_bytes(),
        ))[..16]
            .to_string();
        assert_eq!(fingerprint, expected);
    }
}
