//! Manual guardrail reset

use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use fx_pilot::guardrails::DailyGuardrails;

pub fn run(config_path: String) -> Result<()> {
    let config = super::load_config(&config_path)?;
    let now = Utc::now();
    let mut guardrails = DailyGuardrails::open(config.guardrails.clone(), now);

    if let Some(reason) = guardrails.state().stop_reason.clone() {
        warn!("Clearing daily stop: {}", reason);
    }
    guardrails.force_reset_day(now);
    println!(
        "Daily guardrail state reset for {} ({})",
        now.date_naive(),
        config.guardrails.state_file.display()
    );
    Ok(())
}
