//! Domain models - core business types and session model
//!
//! This module contains the canonical data types used throughout the system:
//! - `ParkingSession` - the primary business entity representing one stay
//! - `SessionEvent` - events that occur during a session
//! - `PlateDetectionEvent` - normalized camera detections
//! - `PlateNumber` / `CameraId` - validated identifiers
//! - `Decision` - access decision outcomes with stable reason codes

pub mod session;
pub mod types;
