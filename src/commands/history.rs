//! Archive history command: storage usage and the latest archived cycles

use anyhow::Result;
use chrono::Utc;

use fx_pilot::archive::DataArchive;
use fx_pilot::Symbol;

const REASONING_PREVIEW_CHARS: usize = 100;

pub fn run(config_path: String, symbol: Option<String>, days: i64, limit: usize) -> Result<()> {
    let config = super::load_config(&config_path)?;
    let archive = DataArchive::new(config.archive.clone());
    let symbol = symbol.map(Symbol::new);
    let now = Utc::now();

    let stats = archive.storage_stats()?;
    println!("\n{}", "=".repeat(60));
    println!("DATA ARCHIVE - {}", stats.data_dir.display());
    println!("{}", "=".repeat(60));
    if !stats.enabled {
        println!("  Archive is disabled (archive.enabled = false)");
        println!("{}", "=".repeat(60));
        return Ok(());
    }
    for (name, dir) in &stats.directories {
        println!("  {:<12} {:>5} files ({:.2} MB)", name, dir.files, dir.size_mb());
    }
    let total = stats.total();
    println!("  {:<12} {:>5} files ({:.2} MB)", "total", total.files, total.size_mb());

    println!("\nRECENT DECISIONS");
    println!("{}", "-".repeat(60));
    let decisions = archive.recent_decisions(symbol.as_ref(), now, days, limit)?;
    if decisions.is_empty() {
        println!("  none in the last {} day(s)", days);
    }
    for row in &decisions {
        let time = row.timestamp.format("%Y-%m-%d %H:%M:%S");
        match (&row.action, &row.error) {
            (Some(action), _) => {
                let reasoning: String = row
                    .reasoning
                    .as_deref()
                    .unwrap_or_default()
                    .chars()
                    .take(REASONING_PREVIEW_CHARS)
                    .collect();
                println!("  {} {} {:<4} | {}", time, row.symbol, action.to_uppercase(), reasoning);
            }
            (None, error) => println!(
                "  {} {} INVALID | {}",
                time,
                row.symbol,
                error.as_deref().unwrap_or("unknown")
            ),
        }
    }

    if let Some(symbol) = &symbol {
        println!("\nRECENT INDICATORS - {}", symbol);
        println!("{}", "-".repeat(60));
        let indicators = archive.load_historical_indicators(symbol, now, days)?;
        if indicators.is_empty() {
            println!("  none in the last {} day(s)", days);
        }
        for row in indicators.iter().rev().take(limit) {
            println!(
                "  {} price {:.5} RSI {:.1} MACD {:.6} StochK {:.1} ATR {:.5}",
                row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                row.price,
                row.rsi,
                row.macd,
                row.stoch_k,
                row.atr
            );
        }
    }

    println!("\nRECENT ORDERS");
    println!("{}", "-".repeat(60));
    let executions = archive.recent_executions(symbol.as_ref(), now, days, limit)?;
    if executions.is_empty() {
        println!("  none in the last {} day(s)", days);
    }
    for row in &executions {
        let time = row.timestamp.format("%Y-%m-%d %H:%M:%S");
        if row.success {
            println!(
                "  {} {} {} {:.2} lots at {:.5} (ticket {})",
                time,
                row.symbol,
                row.action.to_uppercase(),
                row.filled_volume.unwrap_or(row.requested_volume),
                row.price.unwrap_or_default(),
                row.ticket.map_or_else(|| "?".to_string(), |t| t.to_string())
            );
        } else {
            println!(
                "  {} {} {} FAILED | {}",
                time,
                row.symbol,
                row.action.to_uppercase(),
                row.message
            );
        }
    }
    println!("{}", "=".repeat(60));
    Ok(())
}
