//! FX Pilot - main entry point
//!
//! Subcommands:
//! - run: Run the trading loop (paper or live)
//! - report: Performance report from trade telemetry
//! - status: Daily guardrail status
//! - history: Archive storage and recent decisions
//! - reset-day: Force a reset of the daily guardrail state
//! - size: Position size calculator
//! - levels: Stop/target calculator

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "fx-pilot")]
#[command(about = "Risk-governed forex trading loop with LLM-assisted entries", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/fx_pilot.json")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loop
    Run {
        /// Paper trading mode (simulated fills on live quotes)
        #[arg(long)]
        paper: bool,

        /// Live trading mode (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,

        /// Cycle interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,

        /// Starting balance for paper mode
        #[arg(long, default_value = "10000")]
        balance: f64,
    },

    /// Performance report from trade telemetry
    Report {
        /// Days of history to include
        #[arg(short, long, default_value = "7")]
        days: i64,

        /// Export the selected trades to CSV
        #[arg(long)]
        export: Option<PathBuf>,

        /// Include trades from every magic number
        #[arg(long)]
        all: bool,
    },

    /// Show today's guardrail state
    Status,

    /// Archive storage usage and the latest archived decisions and orders
    History {
        /// Only this symbol (also shows its recent indicators)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Days of archive to scan
        #[arg(short, long, default_value = "1")]
        days: i64,

        /// Rows per section
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Force a reset of today's guardrail state
    ResetDay,

    /// Position size for a stop distance
    Size {
        #[arg(short, long, default_value = "EURUSD")]
        symbol: String,

        /// Stop distance in pips
        #[arg(long)]
        sl_pips: f64,

        /// Account balance
        #[arg(long, default_value = "10000")]
        balance: f64,

        /// Risk per trade as a fraction (overrides config)
        #[arg(long)]
        risk: Option<f64>,
    },

    /// Stop and target for an entry
    Levels {
        #[arg(short, long, default_value = "EURUSD")]
        symbol: String,

        /// buy or sell
        #[arg(long)]
        action: String,

        #[arg(long)]
        entry: f64,

        #[arg(long)]
        atr: f64,

        #[arg(long, default_value = "50")]
        rsi: f64,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Quiet the HTTP stack
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Report { .. } => "report",
        Commands::Status => "status",
        Commands::History { .. } => "history",
        Commands::ResetDay => "reset_day",
        Commands::Size { .. } => "size",
        Commands::Levels { .. } => "levels",
    };

    setup_logging(cli.verbose, command_name)?;

    let config = cli.config;
    match cli.command {
        Commands::Run {
            paper,
            live,
            interval,
            balance,
        } => commands::run::run(config, paper, live, interval, balance),

        Commands::Report { days, export, all } => commands::report::run(config, days, export, all),

        Commands::Status => commands::status::run(config),

        Commands::History {
            symbol,
            days,
            limit,
        } => commands::history::run(config, symbol, days, limit),

        Commands::ResetDay => commands::reset::run(config),

        Commands::Size {
            symbol,
            sl_pips,
            balance,
            risk,
        } => commands::size::run(config, symbol, sl_pips, balance, risk),

        Commands::Levels {
            symbol,
            action,
            entry,
            atr,
            rsi,
        } => commands::levels::run(config, symbol, action, entry, atr, rsi),
    }
}
