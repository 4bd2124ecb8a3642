//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `pipeline` - Central detection orchestrator and per-plate locking
//! - `engine` - Access decision engine (grant/deny, direction, payment)
//! - `sessions` - Parking session lifecycle and repository
//! - `fees` - Fee policy and calculation
//! - `debounce` - Duplicate detection suppression
//! - `authorization` - Plate authorization store
//! - `payment` - Payment processor abstraction
//! - `barrier` - Barrier state machine and controller

pub mod authorization;
pub mod barrier;
pub mod debounce;
pub mod engine;
pub mod fees;
pub mod payment;
pub mod pipeline;
pub mod sessions;

// Re-export commonly used types
pub use barrier::{create_barrier, BarrierController, BarrierHandle};
pub use engine::AccessDecisionEngine;
pub use pipeline::Pipeline;
pub use sessions::{MemorySessionRepository, SessionManager};
