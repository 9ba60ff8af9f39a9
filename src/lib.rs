//! FX Pilot
//!
//! An automated forex decision loop: indicators over rolling price windows,
//! an external recommendation source, entry-quality gates, risk-based sizing,
//! mechanical position management, daily guardrails and trade telemetry.

pub mod archive;
pub mod broker;
pub mod config;
pub mod decision;
pub mod gates;
pub mod guardrails;
pub mod indicators;
pub mod llm;
pub mod pipeline;
pub mod sizing;
pub mod telemetry;
pub mod trade_manager;
pub mod types;

pub use config::Config;
pub use types::*;
