use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Oplog position as reported by the mirror process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct OplogTimestamp {
    #[serde(rename = "T")]
    pub time: u32,
    #[serde(rename = "I")]
    pub increment: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    pub copied_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub current_timestamp: Option<OplogTimestamp>,
    pub latest_timestamp: Option<OplogTimestamp>,
}

/// Body of the HTTP status endpoint of a mirror process.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorStatus {
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub details: Option<StatusDetails>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Classified status of one mirror process.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorProgress {
    Error(String),
    CopyingIndexes,
    CopyingDocuments { percent: f64 },
    OplogSync { lag: Duration },
    /// Starting up, or a stage this tool does not know about.
    Unknown { stage: String, phase: String },
}

impl MirrorStatus {
    pub fn is_initial_sync(&self) -> bool {
        self.stage.eq_ignore_ascii_case("initial sync")
    }

    pub fn is_oplog_sync(&self) -> bool {
        self.stage.eq_ignore_ascii_case("oplog sync")
    }

    pub fn is_copying_indexes(&self) -> bool {
        self.phase.to_ascii_lowercase().contains("index")
    }

    /// Percentage of bytes copied so far during the initial sync.
    pub fn completion_percent(&self) -> f64 {
        let Some(details) = &self.details else {
            return 0.0;
        };
        match (details.copied_bytes, details.total_bytes) {
            (Some(copied), Some(total)) if total > 0 => copied as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    /// How far the applied oplog position trails the latest source position.
    pub fn lag(&self) -> Duration {
        let Some(details) = &self.details else {
            return Duration::ZERO;
        };
        match (details.current_timestamp, details.latest_timestamp) {
            (Some(current), Some(latest)) => {
                Duration::from_secs(u64::from(latest.time.saturating_sub(current.time)))
            }
            _ => Duration::ZERO,
        }
    }

    pub fn progress(&self) -> MirrorProgress {
        if let Some(message) = self.error_message.as_ref().filter(|msg| !msg.is_empty()) {
            return MirrorProgress::Error(message.clone());
        }
        if self.is_initial_sync() {
            if self.is_copying_indexes() {
                MirrorProgress::CopyingIndexes
            } else {
                MirrorProgress::CopyingDocuments {
                    percent: self.completion_percent(),
                }
            }
        } else if self.is_oplog_sync() {
            MirrorProgress::OplogSync { lag: self.lag() }
        } else {
            MirrorProgress::Unknown {
                stage: self.stage.clone(),
                phase: self.phase.clone(),
            }
        }
    }
}

/// Human readable lag, e.g. `1h 02m 05s`.
pub struct PrettyLag(pub Duration);

impl fmt::Display for PrettyLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
        if hours > 0 {
            write!(f, "{hours}h {minutes:02}m {seconds:02}s")
        } else if minutes > 0 {
            write!(f, "{minutes}m {seconds:02}s")
        } else {
            write!(f, "{seconds}s")
        }
    }
}
