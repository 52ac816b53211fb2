//! Execution status taxonomy and time helpers shared by the tracker and the
//! benchmark orchestrator.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked execution.
///
/// `Running` is the only non-terminal state. Every terminal state is
/// absorbing: once reached, the tracker never writes another status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        self == ExecutionStatus::Running && next.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Canceled => "Canceled",
            ExecutionStatus::TimedOut => "TimedOut",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(ExecutionStatus::Running),
            "Completed" => Ok(ExecutionStatus::Completed),
            "Failed" => Ok(ExecutionStatus::Failed),
            "Canceled" => Ok(ExecutionStatus::Canceled),
            "TimedOut" => Ok(ExecutionStatus::TimedOut),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render an epoch-millisecond timestamp as RFC 3339, or `-` if out of range.
pub fn format_timestamp(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339(),
        None => "-".to_string(),
    }
}

/// Human-readable duration, e.g. `42.0s` or `3m 05s`.
pub fn format_duration_secs(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let whole = secs.round() as u64;
        format!("{}m {:02}s", whole / 60, whole % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_is_non_terminal() {
        assert!(!ExecutionStatus::Running.is_terminal());
        for s in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Canceled,
            ExecutionStatus::TimedOut,
        ] {
            assert!(s.is_terminal());
            assert!(ExecutionStatus::Running.can_transition_to(s));
            // absorbing
            assert!(!s.can_transition_to(ExecutionStatus::Running));
            assert!(!s.can_transition_to(ExecutionStatus::Canceled));
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        let parsed: ExecutionStatus = "TimedOut".parse().unwrap();
        assert_eq!(parsed, ExecutionStatus::TimedOut);
        assert_eq!(parsed.to_string(), "TimedOut");
        assert!("Error".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration_secs(15.0), "15.0s");
        assert_eq!(format_duration_secs(185.0), "3m 05s");
    }
}
