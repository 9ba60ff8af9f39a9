//! Position size calculator

use anyhow::{bail, Result};

use fx_pilot::sizing::{self, PositionSizer};

pub fn run(
    config_path: String,
    symbol: String,
    sl_pips: f64,
    balance: f64,
    risk_override: Option<f64>,
) -> Result<()> {
    if !(sl_pips.is_finite() && sl_pips > 0.0) {
        bail!("--sl-pips must be positive, got {}", sl_pips);
    }
    let config = super::load_config(&config_path)?;
    let instrument = super::offline_instrument(&symbol);
    let sizer = PositionSizer::new(config.sizing.clone());
    let result = sizer.size(Some(&instrument), Some(balance), sl_pips, risk_override);

    println!("\n{}", "=".repeat(60));
    println!("POSITION SIZE - {}", instrument.symbol);
    println!("{}", "=".repeat(60));
    println!("  Balance:        {:.2}", balance);
    println!("  Stop distance:  {:.1} pips", sl_pips);
    println!("  Pip value:      {:.2} per lot", sizing::pip_value(&instrument));
    println!("  Raw volume:     {:.4}", result.raw_volume);
    println!(
        "  Volume:         {:.2}{}",
        result.volume,
        if result.clamped { " (clamped)" } else { "" }
    );
    println!(
        "  Risk:           {:.2} ({:.3}%)",
        result.risk_amount,
        result.risk_pct_actual * 100.0
    );
    println!("  Valid:          {}", result.valid);
    println!("  {}", result.reasoning);
    println!("{}", "=".repeat(60));
    Ok(())
}
