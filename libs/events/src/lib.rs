//! # nex-events
//!
//! Event type definitions and serialization for the nex node.
//!
//! ## Design Principles
//!
//! - Events are immutable records of lifecycle transitions
//! - Events never contain workload payload bytes (only names and metadata)
//! - Delivery is best-effort; consumers must tolerate gaps
//!
//! ## Event Envelope
//!
//! All events are published as cloud events with:
//! - A unique event id
//! - The emitting node's public key as the source
//! - A UTC emission timestamp
//! - An event-specific JSON payload
//!
//! ## Event Types
//!
//! - Workload lifecycle (`workload-stopped`)
//! - Function execution (`function-execution-succeeded`, `function-execution-failed`)

mod envelope;
mod error;
mod types;

pub use envelope::CloudEvent;
pub use error::EventError;
pub use types::*;
