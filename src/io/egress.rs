//! Session egress - writes settled sessions to file
//!
//! Sessions are written in JSONL format (one JSON object per line)
//! to the file specified in config. Terminal states only; the live session
//! store is the source of truth until then.

use crate::domain::session::ParkingSession;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Egress writer for settled sessions
pub struct SessionLog {
    file_path: String,
}

impl SessionLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "session_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write a session to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_session(&self, session: &ParkingSession) -> bool {
        let json = session.to_json();

        match self.append_line(&json) {
            Ok(()) => {
                info!(
                    sid = %session.sid,
                    plate = %session.plate,
                    status = %session.status.as_str(),
                    "session_egressed"
                );
                true
            }
            Err(e) => {
                error!(sid = %session.sid, error = %e, "session_egress_failed");
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}
