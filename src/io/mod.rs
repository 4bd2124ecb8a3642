//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving camera detection data
//! - `mqtt_egress` - MQTT publisher for egress events
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `egress` - Session output to file (JSONL format)
//! - `payment_listener` - TCP listener for payment terminal notifications
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod egress_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod payment_listener;
pub mod prometheus;

// Re-export commonly used types
pub use egress::SessionLog;
pub use egress_channel::{
    create_egress_channel, AccessEventPayload, AlertPayload, BarrierPayload, EgressSender,
    SessionEventPayload,
};
pub use mqtt_egress::MqttPublisher;
pub use payment_listener::{start_payment_listener, PaymentListenerConfig};
