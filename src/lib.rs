//! # Fleet Agent
//!
//! Worker-side agent for a serverless GPU compute fleet. It sits beside a
//! model-serving backend, admits and forwards jobs assigned by the central
//! autoscaler, and reports load and throughput telemetry back.
//!
//! ## Architecture
//!
//! ```text
//! Inbound request → Envelope parse → Signature check → Admission (wait-time)
//!   → Concurrency gate → Forward (racing client disconnect) → Passthrough
//! ```
//!
//! Background loops: startup calibration (measure or restore max
//! throughput), backend health polling, periodic autoscaler reports and
//! delete notifications.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet_agent::{WorkerAgent, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> fleet_agent::Result<()> {
//!     let config = WorkerConfig::from_env();
//!     WorkerAgent::new(config)?.run().await
//! }
//! ```

pub mod admission;
pub mod auth;
pub(crate) mod benchmark;
pub mod calibrate;
pub mod config;
pub mod envelope;
pub mod error;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod report;
pub mod server;

// Re-export main types
pub use config::WorkerConfig;
pub use error::{AgentError, Result};
pub use server::WorkerAgent;

/// Agent version reported to the autoscaler.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
