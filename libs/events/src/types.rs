//! Event payloads and emitted-log records published by the node.

use serde::{Deserialize, Serialize};

// =============================================================================
// Subjects
// =============================================================================

/// Subject prefix for lifecycle cloud events.
pub const EVENT_SUBJECT_PREFIX: &str = "$NEX.events";

/// Subject prefix for workload log streams.
pub const LOG_SUBJECT_PREFIX: &str = "$NEX.logs";

/// Subject a lifecycle event for a namespace is published on.
pub fn events_subject(namespace: &str) -> String {
    format!("{}.{}", EVENT_SUBJECT_PREFIX, namespace)
}

/// Subject a workload log line is published on.
pub fn logs_subject(namespace: &str, node_id: &str, workload_name: &str, vmid: &str) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        LOG_SUBJECT_PREFIX, namespace, node_id, workload_name, vmid
    )
}

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const WORKLOAD_STOPPED: &str = "workload-stopped";
    pub const FUNCTION_EXECUTION_SUCCEEDED: &str = "function-execution-succeeded";
    pub const FUNCTION_EXECUTION_FAILED: &str = "function-execution-failed";
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Payload for `workload-stopped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadStopped {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub vmid: String,
}

/// Payload for `function-execution-succeeded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionExecutionSucceeded {
    #[serde(rename = "workload_name")]
    pub name: String,
    #[serde(rename = "trigger_subject")]
    pub subject: String,
    #[serde(rename = "elapsed_nanos")]
    pub elapsed: i64,
    pub namespace: String,
}

/// Payload for `function-execution-failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionExecutionFailed {
    #[serde(rename = "workload_name")]
    pub name: String,
    #[serde(rename = "trigger_subject")]
    pub subject: String,
    pub namespace: String,
    pub error: String,
}

// =============================================================================
// Emitted Logs
// =============================================================================

/// Severity of an emitted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line published on the workload log subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmittedLog {
    #[serde(rename = "Text")]
    pub text: String,
    #[serde(rename = "Level")]
    pub level: LogLevel,
    #[serde(rename = "MachineId")]
    pub machine_id: String,
}
