//! Private channel between the node and the agents inside its VMs.
//!
//! Subjects on the internal bus:
//!
//! - `agentint.handshake` — agent → node, announces a freshly booted VM
//! - `agentint.<vmid>.deploy` — node → agent, workload hand-off
//! - `agentint.<vmid>.undeploy` — node → agent, graceful shutdown request
//! - `agentint.<vmid>.trigger` — node → agent, forwarded trigger message
//! - `agentint.<vmid>.events.<kind>` / `agentint.<vmid>.logs` — agent → node
//!
//! Agent events and logs are fanned back out to the public
//! `$NEX.events` / `$NEX.logs` subjects, best-effort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusError, Headers, Message};
use crate::claims::WorkloadClaims;
use crate::error::NodeError;
use nex_events::{events_subject, logs_subject};

/// Subject agents announce themselves on after boot.
pub const HANDSHAKE_SUBJECT: &str = "agentint.handshake";

/// Header carrying the original trigger subject into the agent.
pub const TRIGGER_SUBJECT_HEADER: &str = "x-nex-trigger-subject";

/// Header on trigger replies carrying the reported runtime in nanoseconds.
pub const RUNTIME_NS_HEADER: &str = "x-nex-runtime-ns";

const AGENT_EVENTS_PATTERN: &str = "agentint.*.events.*";
const AGENT_LOGS_PATTERN: &str = "agentint.*.logs";

/// Poll interval while waiting for a handshake table entry.
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn deploy_subject(vmid: &str) -> String {
    format!("agentint.{vmid}.deploy")
}

pub fn undeploy_subject(vmid: &str) -> String {
    format!("agentint.{vmid}.undeploy")
}

pub fn trigger_subject(vmid: &str) -> String {
    format!("agentint.{vmid}.trigger")
}

// =============================================================================
// Wire types
// =============================================================================

/// Announcement an agent publishes once its runtime is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHandshake {
    pub machine_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Workload hand-off sent to an agent on deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeployRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,
    pub decoded_claims: WorkloadClaims,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub environment: HashMap<String, String>,
    pub hash: String,
    pub namespace: String,
    pub total_bytes: i64,
    pub trigger_subjects: Vec<String>,
    pub workload_name: String,
    pub workload_type: String,
}

/// Agent's answer to a deploy hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeployResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// =============================================================================
// Workload resolution
// =============================================================================

/// Resolves a VM id to the namespace and workload name bound to it, for
/// fanning agent events and logs back out. Implemented by the machine
/// manager; the channel deliberately holds only this narrow view of it.
#[async_trait]
pub trait WorkloadResolver: Send + Sync {
    async fn workload_info(&self, vmid: &str) -> Option<(String, String)>;
}

// =============================================================================
// Agent channel
// =============================================================================

pub struct AgentChannel {
    internal: Arc<dyn Bus>,
    external: Arc<dyn Bus>,
    node_public_key: String,
    handshakes: Mutex<HashMap<String, AgentHandshake>>,
}

impl AgentChannel {
    pub fn new(
        internal: Arc<dyn Bus>,
        external: Arc<dyn Bus>,
        node_public_key: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            internal,
            external,
            node_public_key: node_public_key.into(),
            handshakes: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe the agent-facing consumers. Called once at manager startup.
    pub async fn start(
        self: &Arc<Self>,
        resolver: Arc<dyn WorkloadResolver>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), NodeError> {
        let handshake_sub = self
            .internal
            .subscribe(HANDSHAKE_SUBJECT)
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;
        let events_sub = self
            .internal
            .subscribe(AGENT_EVENTS_PATTERN)
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;
        let logs_sub = self
            .internal
            .subscribe(AGENT_LOGS_PATTERN)
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))?;

        tokio::spawn(Arc::clone(self).consume_handshakes(handshake_sub, shutdown.clone()));
        tokio::spawn(Arc::clone(self).consume_agent_events(
            events_sub,
            Arc::clone(&resolver),
            shutdown.clone(),
        ));
        tokio::spawn(Arc::clone(self).consume_agent_logs(logs_sub, resolver, shutdown));

        Ok(())
    }

    /// Whether the agent in the given VM has announced itself.
    pub async fn handshake_received(&self, vmid: &str) -> bool {
        self.handshakes.lock().await.contains_key(vmid)
    }

    /// Block until the agent in `vmid` announces itself or the deadline
    /// elapses.
    pub async fn await_handshake(&self, vmid: &str, timeout: Duration) -> Result<(), NodeError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.handshake_received(vmid).await {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(NodeError::AgentTimeout(format!(
                    "no handshake from agent in machine {vmid}"
                )));
            }

            tokio::time::sleep(HANDSHAKE_POLL_INTERVAL).await;
        }
    }

    /// Hand a workload to the agent.
    pub async fn deploy(
        &self,
        vmid: &str,
        request: &AgentDeployRequest,
        timeout: Duration,
    ) -> Result<(), NodeError> {
        let body = serde_json::to_vec(request).map_err(|e| NodeError::Decode(e.to_string()))?;

        let reply = self
            .internal
            .request(&deploy_subject(vmid), Bytes::from(body), Headers::new(), timeout)
            .await
            .map_err(|e| match e {
                BusError::Timeout => NodeError::AgentTimeout(
                    "acknowledgement of workload deployment".to_string(),
                ),
                other => NodeError::Internal(other.to_string()),
            })?;

        let response: AgentDeployResponse = serde_json::from_slice(&reply.payload)
            .map_err(|e| NodeError::Decode(format!("invalid deploy response: {e}")))?;

        if !response.accepted {
            return Err(NodeError::AgentReject(
                response.message.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        Ok(())
    }

    /// Ask the agent to shut its workload down gracefully. Best-effort: the
    /// caller tears the VM down regardless of the outcome.
    pub async fn undeploy(&self, vmid: &str, timeout: Duration) -> Result<(), NodeError> {
        self.internal
            .request(&undeploy_subject(vmid), Bytes::new(), Headers::new(), timeout)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                BusError::Timeout => {
                    NodeError::AgentTimeout("acknowledgement of undeploy".to_string())
                }
                other => NodeError::Internal(other.to_string()),
            })
    }

    /// Forward an external trigger message into the agent and return the
    /// execution result bytes with the reported runtime in nanoseconds.
    pub async fn trigger(
        &self,
        vmid: &str,
        original_subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(Bytes, i64), NodeError> {
        let mut headers = Headers::new();
        headers.insert(TRIGGER_SUBJECT_HEADER.to_string(), original_subject.to_string());

        let reply = self
            .internal
            .request(&trigger_subject(vmid), payload, headers, timeout)
            .await
            .map_err(|e| match e {
                BusError::Timeout => {
                    NodeError::AgentTimeout("agent execution via trigger".to_string())
                }
                other => NodeError::Internal(other.to_string()),
            })?;

        let runtime_ns = match reply.headers.get(RUNTIME_NS_HEADER) {
            Some(raw) => raw.parse::<i64>().unwrap_or_else(|_| {
                warn!(vmid = %vmid, runtime = %raw, "Failed to parse function runtime header");
                0
            }),
            None => 0,
        };

        Ok((reply.payload, runtime_ns))
    }

    // -------------------------------------------------------------------------
    // Consumers
    // -------------------------------------------------------------------------

    async fn consume_handshakes(
        self: Arc<Self>,
        mut sub: crate::bus::Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    self.handle_handshake(msg).await;
                }
            }
        }
    }

    async fn handle_handshake(&self, msg: Message) {
        let handshake: AgentHandshake = match serde_json::from_slice(&msg.payload) {
            Ok(h) => h,
            Err(err) => {
                warn!(error = %err, "Discarding malformed agent handshake");
                return;
            }
        };

        info!(
            vmid = %handshake.machine_id,
            message = handshake.message.as_deref().unwrap_or(""),
            "Received agent handshake"
        );

        self.handshakes
            .lock()
            .await
            .insert(handshake.machine_id.clone(), handshake);

        if let Some(reply) = msg.reply {
            let _ = self.internal.publish(&reply, Bytes::from_static(b"OK")).await;
        }
    }

    async fn consume_agent_events(
        self: Arc<Self>,
        mut sub: crate::bus::Subscription,
        resolver: Arc<dyn WorkloadResolver>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                msg = sub.next() => {
                    let Some(msg) = msg else { break };

                    // agentint.<vmid>.events.<kind>
                    let tokens: Vec<&str> = msg.subject.split('.').collect();
                    if tokens.len() < 4 {
                        continue;
                    }
                    let vmid = tokens[1];
                    let kind = tokens[3];

                    let Some((namespace, _)) = resolver.workload_info(vmid).await else {
                        debug!(vmid = %vmid, "Dropping event from unknown machine");
                        continue;
                    };

                    debug!(vmid = %vmid, kind = %kind, "Forwarding agent event");
                    if let Err(err) = self
                        .external
                        .publish(&events_subject(&namespace), msg.payload.clone())
                        .await
                    {
                        warn!(error = %err, "Failed to forward agent event");
                    }
                }
            }
        }
    }

    async fn consume_agent_logs(
        self: Arc<Self>,
        mut sub: crate::bus::Subscription,
        resolver: Arc<dyn WorkloadResolver>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                msg = sub.next() => {
                    let Some(msg) = msg else { break };

                    // agentint.<vmid>.logs
                    let tokens: Vec<&str> = msg.subject.split('.').collect();
                    if tokens.len() < 3 {
                        continue;
                    }
                    let vmid = tokens[1];

                    let Some((namespace, workload_name)) = resolver.workload_info(vmid).await
                    else {
                        debug!(vmid = %vmid, "Dropping log from unknown machine");
                        continue;
                    };

                    let subject =
                        logs_subject(&namespace, &self.node_public_key, &workload_name, vmid);
                    if let Err(err) = self.external.publish(&subject, msg.payload.clone()).await {
                        warn!(error = %err, "Failed to forward agent log");
                    }
                }
            }
        }
    }
}
