//! Detection debounce/dedup filter
//!
//! A plate sitting in front of a camera produces a burst of near-identical
//! reads. The filter admits the first read and suppresses the rest of the
//! burst, with one exception: a strictly higher-confidence read inside the
//! window replaces the weak one so a marginal OCR result can be upgraded
//! without re-triggering the barrier.
//!
//! Backward timestamps (camera clock skew) admit - failing open here beats
//! starving a legitimate re-entry.

use crate::domain::session::epoch_ms;
use crate::domain::types::{CameraId, PlateDetectionEvent, PlateNumber};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Entries untouched for this many windows are swept
const SWEEP_AFTER_WINDOWS: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DebounceKey {
    plate: PlateNumber,
    /// Populated only in per-camera scope
    camera: Option<CameraId>,
}

#[derive(Debug, Clone, Copy)]
struct Admitted {
    ts_ms: u64,
    confidence: f64,
}

/// What the filter did with a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First read, expired window, or backward clock: run the decision
    Fresh,
    /// Higher-confidence re-read of the same presentation inside the
    /// window: the record is upgraded but the decision already ran -
    /// re-running it would re-trigger the barrier or flip the session
    Override,
    /// Duplicate read: dropped silently
    Suppressed,
}

impl Admission {
    /// True for anything that updated the admission record
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Suppressed)
    }
}

/// Plate-keyed cool-down filter.
///
/// Interior mutability so concurrent per-plate pipeline tasks can share one
/// filter; the critical section is a single map probe.
pub struct DebounceFilter {
    window_ms: u64,
    per_camera: bool,
    last_admitted: Mutex<FxHashMap<DebounceKey, Admitted>>,
}

impl DebounceFilter {
    pub fn new(window_ms: u64, per_camera: bool) -> Self {
        Self { window_ms, per_camera, last_admitted: Mutex::new(FxHashMap::default()) }
    }

    /// Admit or suppress a detection. Admission records the read; rejected
    /// events are dropped silently (counted by the caller, never retried).
    pub fn admit(&self, event: &PlateDetectionEvent) -> Admission {
        let ts = if event.event_time > 0 { event.event_time } else { epoch_ms() };
        let key = DebounceKey {
            plate: event.plate.clone(),
            camera: self.per_camera.then(|| event.camera.clone()),
        };

        let mut map = self.last_admitted.lock();
        let admission = match map.get(&key) {
            None => Admission::Fresh,
            Some(prev) => {
                if ts < prev.ts_ms {
                    // clock went backwards: fail open
                    Admission::Fresh
                } else if ts - prev.ts_ms >= self.window_ms {
                    Admission::Fresh
                } else if event.confidence > prev.confidence {
                    Admission::Override
                } else {
                    Admission::Suppressed
                }
            }
        };

        match admission {
            Admission::Fresh | Admission::Override => {
                map.insert(key, Admitted { ts_ms: ts, confidence: event.confidence });
            }
            Admission::Suppressed => {
                debug!(
                    plate = %event.plate,
                    camera = %event.camera,
                    confidence = %event.confidence,
                    "detection_suppressed"
                );
            }
        }
        admission
    }

    /// Drop entries that have not been touched for several windows.
    /// Called from the pipeline maintenance tick.
    pub fn sweep(&self) {
        let now = epoch_ms();
        let horizon = self.window_ms.saturating_mul(SWEEP_AFTER_WINDOWS);
        let mut map = self.last_admitted.lock();
        map.retain(|_, entry| now.saturating_sub(entry.ts_ms) <= horizon);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.last_admitted.lock().len()
    }
}
