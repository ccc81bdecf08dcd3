//! Cloud event envelope - the common wrapper for all emitted events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cloud events spec version emitted by the node.
const SPEC_VERSION: &str = "1.0";

/// JSON content type for event payloads.
const CONTENT_TYPE_JSON: &str = "application/json";

/// The cloud event envelope - common metadata for all emitted events.
///
/// The source is always the public key of the emitting node so consumers can
/// attribute events without a reverse lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent<P> {
    /// Cloud events spec version.
    pub specversion: String,

    /// Unique event identifier.
    pub id: String,

    /// Public key of the emitting node.
    pub source: String,

    /// The event type (e.g., "workload-stopped").
    #[serde(rename = "type")]
    pub event_type: String,

    /// Content type of the data field.
    pub datacontenttype: String,

    /// When the event was emitted.
    pub time: DateTime<Utc>,

    /// Event-specific payload.
    pub data: P,
}

impl<P> CloudEvent<P> {
    /// Create a new event with a fresh id, stamped now.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: P) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            time: Utc::now(),
            data,
        }
    }
}
