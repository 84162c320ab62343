// Session metrics for tunnelkeep
//
// Counters only ever increase; scalars hold the last observed value. The
// supervisor owns the snapshot and updates it atomically per event, handing
// read-only copies to consumers.

use serde::{Deserialize, Serialize};

use crate::types::SessionState;

/// One exported metric, stable key plus rendered value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricItem {
    pub key: String,
    pub value: String,
}

impl MetricItem {
    fn new(key: &str, value: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub state: SessionState,
    pub restart_total: u64,
    pub start_attempt_total: u64,
    pub start_success_total: u64,
    pub start_failure_total: u64,
    pub exit_success_total: u64,
    pub exit_failure_total: u64,
    /// Last reason the session exited, free text ("-" until first exit).
    #[serde(default = "dash")]
    pub last_exit: String,
    /// Last classified error ("-" until first failure).
    #[serde(default = "dash")]
    pub last_error_class: String,
    /// Last trigger the supervisor acted on ("-" until first trigger).
    #[serde(default = "dash")]
    pub last_trigger: String,
    /// Currently scheduled backoff delay, if a retry is pending.
    pub backoff_ms: Option<u64>,
    /// Unix timestamp of the moment the session last entered Running.
    pub uptime_start: Option<i64>,
}

fn dash() -> String {
    "-".to_string()
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self {
            last_exit: dash(),
            last_error_class: dash(),
            last_trigger: dash(),
            ..Default::default()
        }
    }

    pub fn uptime_seconds(&self, now: i64) -> Option<i64> {
        self.uptime_start.map(|start| now - start)
    }

    /// Export as `{key, value}` pairs with stable key names.
    pub fn to_items(&self) -> Vec<MetricItem> {
        let mut items = vec![
            MetricItem::new("session_state", self.state),
            MetricItem::new("restart_total", self.restart_total),
            MetricItem::new("start_attempt_total", self.start_attempt_total),
            MetricItem::new("start_success_total", self.start_success_total),
            MetricItem::new("start_failure_total", self.start_failure_total),
            MetricItem::new("exit_success_total", self.exit_success_total),
            MetricItem::new("exit_failure_total", self.exit_failure_total),
            MetricItem::new("last_exit", &self.last_exit),
            MetricItem::new("last_error_class", &self.last_error_class),
            MetricItem::new("last_trigger", &self.last_trigger),
        ];
        if let Some(ms) = self.backoff_ms {
            items.push(MetricItem::new("backoff_ms", ms));
        }
        if let Some(uptime) = self.uptime_seconds(chrono::Utc::now().timestamp()) {
            items.push(MetricItem::new("uptime_sec", uptime));
        }
        items
    }
}
