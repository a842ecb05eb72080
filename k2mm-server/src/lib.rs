//! # k2mm-server
//!
//! UDP node for k2mm.
//!
//! This crate provides:
//! - Layered configuration (defaults, YAML, environment)
//! - A UDP loop driving the k2mm engine
//! - Scheduled probes and latency tests
//! - Prometheus metrics over HTTP

pub mod config;
pub mod error;
pub mod metrics;
pub mod server;

pub use config::{
    Config, ConfigError, LinkConfig, MemoryConfig, MetricsConfig, NetworkConfig, ProbeConfig,
    TesterConfig,
};
pub use error::ServerError;
pub use metrics::{run_metrics_server, Metrics};
pub use server::{ProbeSchedule, Server, ServerConfig, ServerStats, TestSchedule};
