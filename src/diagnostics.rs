//! Diagnostic events (§3): the shape every protocol/worker-level failure is
//! classified into before it reaches a human or the configuration store.
//!
//! The core itself has no database; it logs through [`log`] and hands
//! [`DiagnosticEvent`] values to whatever sink the embedding application
//! wires up (the admin layer's diagnostic table, out of scope here).

use std::fmt;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Hdlc,
    Connection,
    Parse,
    Polling,
    Watchdog,
    CircuitBreaker,
    Startup,
    Process,
    Other,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Hdlc => "hdlc",
            Category::Connection => "connection",
            Category::Parse => "parse",
            Category::Polling => "polling",
            Category::Watchdog => "watchdog",
            Category::CircuitBreaker => "circuit_breaker",
            Category::Startup => "startup",
            Category::Process => "process",
            Category::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// One diagnostic occurrence, ready to be persisted or logged (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub meter_id: i64,
    pub meter_name: String,
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    /// Raw frame bytes, present only for HDLC-level failures worth keeping
    /// for offline analysis.
    pub raw_frame: Option<Vec<u8>>,
    pub timestamp_ms: i64,
}

impl DiagnosticEvent {
    pub fn new(meter_id: i64, meter_name: &str, severity: Severity, category: Category, message: impl Into<String>) -> Self {
        Self {
            meter_id,
            meter_name: meter_name.to_string(),
            severity,
            category,
            message: message.into(),
            raw_frame: None,
            timestamp_ms: now_millis(),
        }
    }

    pub fn with_raw_frame(mut self, frame: Vec<u8>) -> Self {
        self.raw_frame = Some(frame);
        self
    }

    /// Logs this event through the `log` facade at the level matching its
    /// severity, naming the meter so a single `grep` on its name reconstructs
    /// the whole lifecycle (§10.1).
    pub fn log(&self) {
        let target = &self.meter_name;
        match self.severity {
            Severity::Info => info!("[{target}] {}: {}", self.category, self.message),
            Severity::Warning => warn!("[{target}] {}: {}", self.category, self.message),
            Severity::Error => error!("[{target}] {}: {}", self.category, self.message),
            Severity::Critical => error!("[{target}] CRITICAL {}: {}", self.category, self.message),
        }
    }

    /// Same as [`DiagnosticEvent::log`] but logged at `debug` level regardless
    /// of severity, used for alarms the orchestrator's throttling suppressed
    /// (§4.7, §9).
    pub fn log_suppressed(&self) {
        debug!(
            "[{}] (throttled) {} {}: {}",
            self.meter_name, self.severity, self.category, self.message
        );
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_category_taxonomy() {
        assert_eq!(Category::CircuitBreaker.to_string(), "circuit_breaker");
        assert_eq!(Category::Hdlc.to_string(), "hdlc");
    }

    #[test]
    fn test_with_raw_frame_attaches_bytes() {
        let event = DiagnosticEvent::new(1, "meter-1", Severity::Warning, Category::Hdlc, "bad fcs")
            .with_raw_frame(vec![0x7E, 0x00, 0x7E]);
        assert_eq!(event.raw_frame, Some(vec![0x7E, 0x00, 0x7E]));
    }

    #[test]
    fn test_new_stamps_a_nonzero_timestamp() {
        let event = DiagnosticEvent::new(1, "meter-1", Severity::Info, Category::Startup, "ok");
        assert!(event.timestamp_ms > 0);
    }
}
