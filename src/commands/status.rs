//! Guardrail status command

use anyhow::Result;
use chrono::Utc;

use fx_pilot::guardrails::DailyGuardrails;

pub fn run(config_path: String) -> Result<()> {
    let config = super::load_config(&config_path)?;
    let now = Utc::now();
    let mut guardrails = DailyGuardrails::open(config.guardrails.clone(), now);
    let stats = guardrails.daily_stats(now, None);

    let fmt_equity = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |e| format!("{:.2}", e));

    println!("\n{}", "=".repeat(60));
    println!("DAILY GUARDRAILS - {}", stats.date);
    println!("{}", "=".repeat(60));
    println!("  Trades today:       {}/{}", stats.trades_today, stats.max_trades);
    println!(
        "  Consecutive losses: {}/{}",
        stats.consecutive_losses, stats.max_consecutive
    );
    println!("  Wins / losses:      {} / {}", stats.wins, stats.losses);
    println!("  Starting equity:    {}", fmt_equity(stats.starting_equity));
    println!("  Drawdown limit:     {:.1}%", stats.max_drawdown_pct);
    if stats.daily_stopped {
        println!(
            "  STATUS:             STOPPED ({})",
            stats.stop_reason.as_deref().unwrap_or("unknown")
        );
    } else {
        println!("  STATUS:             ACTIVE");
    }
    println!("  State file:         {}", config.guardrails.state_file.display());
    println!("{}", "=".repeat(60));
    Ok(())
}
