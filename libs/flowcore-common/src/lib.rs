//! Common utilities for the flow engine.
//!
//! Provides shared configuration and telemetry initialization used by
//! `apps/cli`, `apps/webhook`, and `apps/worker`.

pub mod config;
pub mod telemetry;

pub use config::{AppConfig, ConfigError};
pub use telemetry::init_tracing;
