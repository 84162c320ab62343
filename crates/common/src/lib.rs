// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tunnelkeep contributors

// tunnelkeep - Common Library
// Shared types, configuration model, metrics, and log-sink abstraction

pub mod config;
pub mod error;
pub mod logsink;
pub mod metrics;
pub mod types;

pub use config::{Config, ForwardSpec, RemoteConfig, RestartConfig};
pub use error::{ConfigError, Error, FieldError, Result};
pub use logsink::{LogSink, MemoryLogSink};
pub use metrics::{MetricItem, MetricsSnapshot};
pub use types::{
    DoctorItem, DoctorStatus, ErrorClass, LogLine, SessionState, StatusSnapshot, TriggerReason,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
