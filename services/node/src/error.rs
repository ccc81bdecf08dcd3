//! Error taxonomy for the node supervisor.
//!
//! Every operator-facing failure is converted to a reply envelope at the
//! control listener boundary; the variants here carry the wording those
//! envelopes expose. `NamespaceMismatch` deliberately renders with the same
//! text as `NotFound` so a caller cannot probe for workload existence across
//! namespaces.

use thiserror::Error;

/// Errors produced by the machine manager and its collaborators.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The request subject did not carry a namespace token.
    #[error("invalid subject - could not detect a namespace")]
    InvalidSubject,

    /// A wire body failed to deserialize.
    #[error("unable to deserialize request: {0}")]
    Decode(String),

    /// The requested workload type is not in the accepted set.
    #[error("unsupported workload type on this node: {0}")]
    UnsupportedWorkloadType(String),

    /// Trigger subjects were supplied for a type outside the trigger-capable set.
    #[error("unsupported workload type for trigger subject registration: {0}")]
    TriggerNotSupported(String),

    /// The signed claims failed verification or cross-checking.
    #[error("invalid claims: {0}")]
    ClaimValidation(String),

    /// The claim issuer is not in the configured valid-issuer list.
    #[error("invalid workload issuer: {0}")]
    IssuerRejected(String),

    /// No workload/VM with the requested id.
    #[error("No such workload")]
    NotFound,

    /// Namespace on the subject does not match the target VM.
    /// Rendered identically to `NotFound`.
    #[error("No such workload")]
    NamespaceMismatch,

    /// The workload artifact could not be fetched from the remote store.
    #[error("failed to fetch workload from object store: {0}")]
    CachePull(String),

    /// The artifact hash does not match the claim.
    #[error("workload hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    /// An agent request–reply deadline elapsed.
    #[error("timed out waiting for agent: {0}")]
    AgentTimeout(String),

    /// The agent refused the deployment.
    #[error("workload rejected by agent: {0}")]
    AgentReject(String),

    /// A trigger subject subscription could not be created.
    #[error("failed to subscribe to trigger subject {subject}: {reason}")]
    SubscribeFailed { subject: String, reason: String },

    /// The VM launcher could not produce or destroy a machine.
    #[error("virtual machine launcher failed: {0}")]
    LauncherFailed(String),

    /// Staging or internal-cache I/O failed. Fails the single deploy only.
    #[error("storage error: {0}")]
    Storage(String),

    /// Internal invariant failure (e.g. warm pool closed during shutdown).
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Message exposed in a failure reply envelope.
    pub fn envelope_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_mismatch_indistinguishable_from_not_found() {
        assert_eq!(
            NodeError::NotFound.to_string(),
            NodeError::NamespaceMismatch.to_string()
        );
    }

    #[test]
    fn test_issuer_rejection_wording() {
        let err = NodeError::IssuerRejected("Y".to_string());
        assert_eq!(err.to_string(), "invalid workload issuer: Y");
    }
}
