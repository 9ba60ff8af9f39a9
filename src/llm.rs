//! LLM decision source
//!
//! Builds the textual market summary and asks an OpenAI-compatible
//! chat-completions endpoint for a recommendation. The reply is returned
//! verbatim; validation happens in [`crate::decision`].

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

use crate::indicators::{interpret, IndicatorConfig, IndicatorSnapshot, Trend};
use crate::Symbol;

const ENDPOINT_CHAT: &str = "/chat/completions";

const SYSTEM_PROMPT: &str = "You are a forex analyst giving trade direction advice.
Use EMA crossover for trend, the higher timeframe for confirmation, Bollinger Bands for
mean-reversion risk and RSI/Stochastic for momentum. Buy only when both timeframes are
bullish and price is not at the upper band extreme; sell only when both are bearish and
price is not at the lower band extreme; otherwise hold.
Reply with JSON only: {\"action\": \"buy|sell|hold\", \"reasoning\": \"...\"}.
The reasoning must cover EMA alignment, Bollinger Band zone and RSI state.
Position size, stop loss and take profit are handled elsewhere.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Read from OPENAI_API_KEY when unset
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4".to_string(),
            temperature: 0.0,
            max_tokens: 200,
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Anything that can turn a market summary into a (raw, untrusted) recommendation
pub trait DecisionSource {
    fn decide(&mut self, summary: &str) -> Result<String>;
}

// =============================================================================
// Market summary
// =============================================================================

fn bb_zone(position: Option<f64>) -> &'static str {
    match position {
        None => "Collapsed channel",
        Some(p) if p > 1.0 => "Above upper band (extreme overbought)",
        Some(p) if p < 0.0 => "Below lower band (extreme oversold)",
        Some(p) if p < 0.25 => "Lower quarter (mean reversion zone)",
        Some(p) if p < 0.4 => "Lower third",
        Some(p) if p < 0.6 => "Middle band (neutral zone)",
        Some(p) if p < 0.75 => "Upper third",
        Some(_) => "Upper quarter (mean reversion zone)",
    }
}

/// Prompt body describing the current market state of one symbol
pub fn market_summary(
    symbol: &Symbol,
    price: f64,
    snapshot: &IndicatorSnapshot,
    periods: &IndicatorConfig,
    higher_tf_trend: Option<Trend>,
    pip_size: f64,
) -> String {
    let base_trend = snapshot.ema_trend();
    let alignment = match higher_tf_trend {
        Some(t) if t == base_trend => "Aligned",
        Some(_) => "Conflicted",
        None => "Unknown",
    };
    let atr_pips = if pip_size > 0.0 { snapshot.atr / pip_size } else { 0.0 };

    let mut out = String::new();
    let _ = writeln!(out, "Trading analysis: {}", symbol);
    let _ = writeln!(out, "\nCurrent price: {:.5}\n", price);
    let _ = writeln!(out, "TECHNICAL INDICATORS:");
    let _ = writeln!(out, "- RSI({}): {:.1}", periods.rsi_period, snapshot.rsi);
    let _ = writeln!(
        out,
        "- MACD({},{},{}): line={:.6}, signal={:.6}",
        periods.macd_fast, periods.macd_slow, periods.macd_signal, snapshot.macd, snapshot.macd_signal
    );
    let _ = writeln!(
        out,
        "- Bollinger({},{}): {} (upper {:.5}, middle {:.5}, lower {:.5})",
        periods.bb_period,
        periods.bb_std_dev,
        bb_zone(snapshot.bb_position(price)),
        snapshot.bb_upper,
        snapshot.bb_middle,
        snapshot.bb_lower
    );
    let _ = writeln!(
        out,
        "- EMA({},{}): fast={:.5}, slow={:.5} -> {}, separation {:.5}",
        periods.ema_fast,
        periods.ema_slow,
        snapshot.ema_fast,
        snapshot.ema_slow,
        base_trend,
        (snapshot.ema_fast - snapshot.ema_slow).abs()
    );
    let _ = writeln!(out, "- SMA({}): {:.5}", periods.sma_slow, snapshot.sma_slow);
    let _ = writeln!(
        out,
        "- Stochastic({},{}): %K={:.1}, %D={:.1}",
        periods.stoch_k, periods.stoch_d, snapshot.stoch_k, snapshot.stoch_d
    );
    let _ = writeln!(out, "- ATR({}): {:.5} ({:.1} pips)", periods.atr_period, snapshot.atr, atr_pips);

    let _ = writeln!(out, "\nREADINGS:");
    for (name, reading) in interpret(snapshot, price) {
        let _ = writeln!(out, "- {}: {}", name, reading);
    }

    let _ = writeln!(out, "\nMULTI-TIMEFRAME:");
    let _ = writeln!(out, "- Base EMA trend: {}", base_trend);
    match higher_tf_trend {
        Some(t) => {
            let _ = writeln!(out, "- Higher timeframe EMA trend: {}", t);
        }
        None => {
            let _ = writeln!(out, "- Higher timeframe EMA trend: N/A");
        }
    }
    let _ = writeln!(out, "- Alignment: {}", alignment);
    let _ = write!(out, "\nRespond ONLY in JSON: {{\"action\": \"buy/sell/hold\", \"reasoning\": \"...\"}}");
    out
}

// =============================================================================
// OpenAI-compatible client
// =============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        info!("LLM decision source initialized: model {}", config.model);
        Ok(Self {
            client,
            api_key,
            url: format!("{}{}", config.base_url.trim_end_matches('/'), ENDPOINT_CHAT),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl DecisionSource for OpenAiClient {
    fn decide(&mut self, summary: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: summary,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!("Calling chat completions: model={}", self.model);
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .context("Chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Chat completion returned {}: {}", status, body);
        }

        let parsed: ChatResponse = response.json().context("Invalid chat completion body")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("Chat completion had no content"))?;

        Ok(content.trim().to_string())
    }
}
