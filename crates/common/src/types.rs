// Common types for tunnelkeep

use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;

/// Lifecycle state of the tunnel session. Exactly one is active at a time,
/// owned exclusively by the supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Stopped,
    Connecting,
    Running,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Connecting => "connecting",
            SessionState::Running => "running",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse classification of a connection failure message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Auth,
    HostKey,
    Dns,
    Refused,
    Timeout,
    Network,
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Auth => "auth",
            ErrorClass::HostKey => "hostkey",
            ErrorClass::Dns => "dns",
            ErrorClass::Refused => "refused",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Network => "network",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(ErrorClass::Auth),
            "hostkey" => Ok(ErrorClass::HostKey),
            "dns" => Ok(ErrorClass::Dns),
            "refused" => Ok(ErrorClass::Refused),
            "timeout" => Ok(ErrorClass::Timeout),
            "network" => Ok(ErrorClass::Network),
            "unknown" => Ok(ErrorClass::Unknown),
            other => Err(format!("unrecognized error class {other:?}")),
        }
    }
}

/// Why the supervisor was asked to act. Producers post these into the
/// debouncer; the connection callbacks are raised inside the control loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    ManualStart,
    ManualStop,
    NetworkAvailable,
    NetworkChanged,
    NetworkDegraded,
    SleepWake,
    PeriodicRefresh,
    ConnectionFailed(ErrorClass),
    ConnectionSucceeded,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::ManualStart => f.write_str("manual start"),
            TriggerReason::ManualStop => f.write_str("manual stop"),
            TriggerReason::NetworkAvailable => f.write_str("network available"),
            TriggerReason::NetworkChanged => f.write_str("network changed"),
            TriggerReason::NetworkDegraded => f.write_str("network degraded"),
            TriggerReason::SleepWake => f.write_str("wake"),
            TriggerReason::PeriodicRefresh => f.write_str("periodic refresh"),
            TriggerReason::ConnectionFailed(class) => write!(f, "connection failed ({class})"),
            TriggerReason::ConnectionSucceeded => f.write_str("connection succeeded"),
        }
    }
}

/// Outcome of a single doctor check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DoctorStatus {
    Ok,
    Warn,
    Error,
}

impl std::fmt::Display for DoctorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DoctorStatus::Ok => "OK",
            DoctorStatus::Warn => "WARN",
            DoctorStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorItem {
    pub title: String,
    pub status: DoctorStatus,
    pub detail: String,
}

impl DoctorItem {
    pub fn new(title: &str, status: DoctorStatus, detail: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

/// One log line in the `<timestamp>|<level>|<message>` collaborator format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

impl LogLine {
    pub fn now(level: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            level: level.to_string(),
            message: message.into(),
        }
    }

    pub fn format(&self) -> String {
        format!("{}|{}|{}", self.timestamp, self.level, self.message)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '|');
        Some(Self {
            timestamp: parts.next()?.to_string(),
            level: parts.next()?.to_string(),
            message: parts.next()?.to_string(),
        })
    }
}

/// Immutable snapshot published by the supervisor. Consumers receive the
/// latest value plus a change notification, never a live reference.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub detail: String,
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_round_trip() {
        let line = LogLine {
            timestamp: "2025-01-01 12:00:00".to_string(),
            level: "INFO".to_string(),
            message: "connected to example.com:22".to_string(),
        };
        let parsed = LogLine::parse(&line.format()).unwrap();
        assert_eq!(parsed, line);
    }

    #[test]
    fn test_log_line_message_may_contain_separator() {
        let parsed = LogLine::parse("ts|WARN|a|b|c").unwrap();
        assert_eq!(parsed.message, "a|b|c");
    }

    #[test]
    fn test_log_line_rejects_short_records() {
        assert!(LogLine::parse("only|two").is_none());
    }

    #[test]
    fn test_trigger_labels() {
        assert_eq!(TriggerReason::SleepWake.to_string(), "wake");
        assert_eq!(
            TriggerReason::ConnectionFailed(ErrorClass::Timeout).to_string(),
            "connection failed (timeout)"
        );
    }

    #[test]
    fn test_error_class_label_round_trip() {
        for class in [
            ErrorClass::Auth,
            ErrorClass::HostKey,
            ErrorClass::Dns,
            ErrorClass::Refused,
            ErrorClass::Timeout,
            ErrorClass::Network,
            ErrorClass::Unknown,
        ] {
            assert_eq!(class.to_string().parse::<ErrorClass>(), Ok(class));
        }
        assert!("mystery".parse::<ErrorClass>().is_err());
    }
}
