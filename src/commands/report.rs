//! Performance report command

use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tracing::info;

use fx_pilot::telemetry::{self, TradeTelemetry};

pub fn run(config_path: String, days: i64, export: Option<PathBuf>, all_magic: bool) -> Result<()> {
    let config = super::load_config(&config_path)?;
    let telemetry = TradeTelemetry::open(&config.telemetry)?;
    let magic = (!all_magic).then_some(config.trading.magic_number);
    let now = Utc::now();

    if days == 7 {
        println!("{}", telemetry.weekly_report(now, magic)?);
    } else {
        let trades = telemetry.load_trades(now, days, magic)?;
        let stats = telemetry::stats(&trades);

        println!("\n{}", "=".repeat(60));
        println!("PERFORMANCE - LAST {} DAYS", days);
        println!("{}", "=".repeat(60));
        println!("  Trades:            {}", stats.total_trades);
        println!(
            "  Win rate:          {:.1}% ({}W / {}L)",
            stats.win_rate, stats.winning_trades, stats.losing_trades
        );
        println!("  Expectancy:        {:+.3}R ({:+.1} pips)", stats.expectancy_r, stats.expectancy_pips);
        println!("  Total:             {:+.2}R ({:+.1} pips)", stats.total_profit_r, stats.total_profit_pips);
        println!("  Profit factor:     {:.2}", stats.profit_factor);
        println!("  Sharpe (per trade): {:.2}", stats.sharpe_ratio);
        println!("  Best / worst:      {:+.2}R / {:+.2}R", stats.best_trade_r, stats.worst_trade_r);
        println!(
            "  Max streaks:       {} wins, {} losses",
            stats.max_consecutive_wins, stats.max_consecutive_losses
        );
        println!("{}", "=".repeat(60));
    }

    if let Some(path) = export {
        let trades = telemetry.load_trades(now, days, magic)?;
        TradeTelemetry::export_csv(&path, &trades)?;
        info!("Exported {} trades to {}", trades.len(), path.display());
    }

    Ok(())
}
