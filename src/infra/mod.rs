//! Infrastructure - configuration, errors, metrics, and broker
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, validation)
//! - `error` - Typed error taxonomy for the core
//! - `metrics` - Lock-free metrics collection
//! - `broker` - Embedded MQTT broker (rumqttd)

pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{AccessMode, CamerasMode, Config, LaneMode, PaymentLocation, PaymentRequirement};
pub use metrics::Metrics;
