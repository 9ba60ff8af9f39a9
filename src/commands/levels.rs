//! Stop and target calculator

use anyhow::{bail, Result};

use fx_pilot::trade_manager::TradeManager;
use fx_pilot::Action;

pub fn run(
    config_path: String,
    symbol: String,
    action: String,
    entry: f64,
    atr: f64,
    rsi: f64,
) -> Result<()> {
    let action = match action.trim().to_lowercase().as_str() {
        "buy" => Action::Buy,
        "sell" => Action::Sell,
        other => bail!("--action must be buy or sell, got '{}'", other),
    };

    let config = super::load_config(&config_path)?;
    let instrument = super::offline_instrument(&symbol);
    let manager = TradeManager::new(config.management.clone());
    let levels = manager.compute_levels(action, entry, atr, rsi, &instrument)?;

    println!("\n{}", "=".repeat(60));
    println!("TRADE LEVELS - {} {}", action.as_str().to_uppercase(), instrument.symbol);
    println!("{}", "=".repeat(60));
    println!("  Entry:        {:.5}", entry);
    println!(
        "  Stop loss:    {:.5} ({:.1} pips, {}x ATR)",
        levels.sl_price, levels.sl_pips, levels.atr_multiplier_used
    );
    println!(
        "  Take profit:  {:.5} ({:.1} pips, {}x SL)",
        levels.tp_price, levels.tp_pips, levels.tp_ratio_used
    );
    println!("  1R:           {:.5}", levels.r_distance);
    println!("  {}", levels.risk_note);
    println!("{}", "=".repeat(60));
    Ok(())
}
