//! Trading loop command
//!
//! Cycles run to completion on a blocking worker. Ctrl+C is observed between
//! cycles, after which a final management pass runs and the weekly report is
//! logged.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use fx_pilot::broker::bridge::BridgeClient;
use fx_pilot::broker::paper::PaperBroker;
use fx_pilot::broker::Broker;
use fx_pilot::llm::{DecisionSource, OpenAiClient};
use fx_pilot::pipeline::{SymbolOutcome, TradingPipeline};

pub fn run(
    config_path: String,
    paper: bool,
    live: bool,
    interval: Option<u64>,
    paper_balance: f64,
) -> Result<()> {
    if !paper && !live {
        bail!("Must specify either --paper or --live mode");
    }
    if live && paper {
        bail!("Cannot specify both --paper and --live modes");
    }

    let mut config = super::load_config(&config_path)?;
    if let Some(secs) = interval {
        config.trading.cycle_interval_secs = secs;
    }

    let mode_str = if paper { "PAPER" } else { "LIVE" };
    info!("==============================================================");
    info!("  FX PILOT - {} MODE", mode_str);
    info!("  Symbols: {}", config.trading.symbols.join(", "));
    info!(
        "  Timeframe: {} (confirmation {})",
        config.trading.timeframe, config.trading.confirmation_timeframe
    );
    info!(
        "  Risk per trade: {:.3}%  Volume: [{}, {}]",
        config.sizing.risk_per_trade * 100.0,
        config.sizing.min_volume,
        config.sizing.max_volume
    );
    info!("  Cycle interval: {} seconds", config.trading.cycle_interval_secs);
    info!("  Config hash: {}", config.fingerprint()?);
    info!("==============================================================");

    if !paper {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 10 seconds to abort...");
        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    // Blocking HTTP clients are built and dropped outside the runtime
    let bridge = BridgeClient::new(&config.broker).context("Failed to create bridge client")?;
    let decider = OpenAiClient::new(&config.llm)?;

    if paper {
        let broker = PaperBroker::new(bridge, paper_balance);
        drive(TradingPipeline::new(config, broker, decider)?)
    } else {
        drive(TradingPipeline::new(config, bridge, decider)?)
    }
}

fn drive<B, D>(pipeline: TradingPipeline<B, D>) -> Result<()>
where
    B: Broker + Send + 'static,
    D: DecisionSource + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let pipeline = runtime.block_on(trade_loop(pipeline))?;
    drop(runtime);
    drop(pipeline);
    info!("Trading session ended.");
    Ok(())
}

async fn trade_loop<B, D>(mut pipeline: TradingPipeline<B, D>) -> Result<TradingPipeline<B, D>>
where
    B: Broker + Send + 'static,
    D: DecisionSource + Send + 'static,
{
    let interval = Duration::from_secs(pipeline.config().trading.cycle_interval_secs);
    let report_hour = pipeline.config().trading.report_hour_utc;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping after the current cycle...");
                shutdown_flag_clone.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut last_report: Option<NaiveDate> = None;
    info!("Starting trading loop...");

    loop {
        let now = Utc::now();
        let report_due = now.hour() == report_hour && last_report != Some(now.date_naive());
        if report_due {
            last_report = Some(now.date_naive());
        }

        pipeline = tokio::task::spawn_blocking(move || {
            let report = pipeline.run_cycle();
            let opened = report
                .outcomes
                .iter()
                .filter(|(_, o)| matches!(o, SymbolOutcome::Opened { .. }))
                .count();
            info!(
                "Cycle {} summary: {} opened, {} errors",
                report.cycle,
                opened,
                report.errors.len()
            );

            if report_due {
                match pipeline.weekly_report() {
                    Ok(text) => info!("Weekly report:\n{}", text),
                    Err(e) => error!("Failed to generate weekly report: {:#}", e),
                }
            }
            pipeline
        })
        .await
        .context("Trading cycle task failed")?;

        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down: final position management pass");
    let pipeline = tokio::task::spawn_blocking(move || {
        let managed = pipeline.manage_all();
        info!("Final management pass covered {} positions", managed);
        match pipeline.weekly_report() {
            Ok(text) => info!("Weekly report:\n{}", text),
            Err(e) => error!("Failed to generate weekly report: {:#}", e),
        }
        pipeline
    })
    .await
    .context("Shutdown task failed")?;

    Ok(pipeline)
}
