//! Operator-facing control listener.
//!
//! Terminates the request–reply control plane on the external bus:
//!
//! | Subject | Handler |
//! |---|---|
//! | `$NEX.PING` / `$NEX.PING.<nodeId>` | node summary |
//! | `$NEX.INFO.<ns>.<nodeId>` | full node info, namespace-scoped machines |
//! | `$NEX.DEPLOY.<ns>.<nodeId>` | deploy flow |
//! | `$NEX.STOP.<ns>.<nodeId>` | stop flow |
//!
//! Every reply is the JSON envelope `{type, data, error?}`; failures carry
//! the error string and empty data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::agent::AgentDeployRequest;
use crate::bus::{Bus, Message, Subscription};
use crate::claims::{
    open_environment, verify_token, EncryptedEnvelope, NodeKeys, StopClaims, WorkloadClaims,
};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::machines::{Machine, MachineManager};
use crate::payload::PayloadCache;

/// Subject prefix of the operator control plane.
pub const API_PREFIX: &str = "$NEX";

/// Node version published in ping/info responses.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const PING_RESPONSE_TYPE: &str = "ping_response";
const INFO_RESPONSE_TYPE: &str = "info_response";
const RUN_RESPONSE_TYPE: &str = "run_response";
const STOP_RESPONSE_TYPE: &str = "stop_response";

// =============================================================================
// Envelope
// =============================================================================

/// JSON wrapper for every operator-facing reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub response_type: String,

    pub data: T,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    fn ok(response_type: &str, data: T) -> Self {
        Self {
            response_type: response_type.to_string(),
            data,
            error: None,
        }
    }
}

fn failure_envelope(response_type: &str, reason: String) -> Envelope<String> {
    Envelope {
        response_type: response_type.to_string(),
        data: String::new(),
        error: Some(reason),
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    #[serde(rename = "WorkloadType")]
    pub workload_type: String,

    #[serde(rename = "Location")]
    pub location: String,

    #[serde(rename = "WorkloadName")]
    pub workload_name: String,

    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Argv", skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,

    /// Environment map sealed to the node's curve public key.
    #[serde(rename = "WorkloadEnvironment")]
    pub workload_environment: EncryptedEnvelope,

    #[serde(rename = "TriggerSubjects", default)]
    pub trigger_subjects: Vec<String>,

    #[serde(rename = "JsDomain", skip_serializing_if = "Option::is_none")]
    pub js_domain: Option<String>,

    /// Signed workload claims token.
    #[serde(rename = "ClaimsJwt")]
    pub claims_jwt: String,
}

impl DeployRequest {
    /// Verify the signed claims, cross-check them against the request, and
    /// open the encrypted environment.
    pub fn validate(
        &self,
        keys: &NodeKeys,
    ) -> Result<(WorkloadClaims, HashMap<String, String>), NodeError> {
        let claims: WorkloadClaims = verify_token(&self.claims_jwt)?;

        if claims.subject != self.workload_name {
            return Err(NodeError::ClaimValidation(
                "claims subject does not match workload name".to_string(),
            ));
        }

        if !claims.workload_type.eq_ignore_ascii_case(&self.workload_type) {
            return Err(NodeError::ClaimValidation(
                "claims workload type does not match request".to_string(),
            ));
        }

        if claims.location != self.location {
            return Err(NodeError::ClaimValidation(
                "claims location does not match request".to_string(),
            ));
        }

        if claims.hash.is_empty() {
            return Err(NodeError::ClaimValidation(
                "claims carry no artifact hash".to_string(),
            ));
        }

        let environment = open_environment(&self.workload_environment, keys)?;
        Ok((claims, environment))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(rename = "WorkloadId")]
    pub workload_id: String,

    /// Stop claims token signed by the workload's issuer.
    #[serde(rename = "ClaimsJwt")]
    pub claims_jwt: String,
}

impl StopRequest {
    /// Verify the stop token against the claims of the deployment it targets.
    pub fn validate(&self, deploy_claims: &WorkloadClaims) -> Result<StopClaims, NodeError> {
        let stop: StopClaims = verify_token(&self.claims_jwt)?;
        stop.validate_against(deploy_claims)?;

        if stop.workload_id != self.workload_id {
            return Err(NodeError::ClaimValidation(
                "stop claims do not name the requested machine".to_string(),
            ));
        }

        Ok(stop)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Uptime")]
    pub uptime: String,
    #[serde(rename = "RunningMachines")]
    pub running_machines: usize,
    #[serde(rename = "Tags")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "PublicXKey")]
    pub public_xkey: String,
    #[serde(rename = "Uptime")]
    pub uptime: String,
    #[serde(rename = "Tags")]
    pub tags: HashMap<String, String>,
    #[serde(rename = "SupportedWorkloadTypes")]
    pub supported_workload_types: Vec<String>,
    #[serde(rename = "Machines")]
    pub machines: Vec<MachineSummary>,
    #[serde(rename = "Memory")]
    pub memory: Option<MemoryStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Healthy")]
    pub healthy: bool,
    #[serde(rename = "Uptime")]
    pub uptime: String,
    #[serde(rename = "Workload")]
    pub workload: WorkloadSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSummary {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Runtime")]
    pub runtime: String,
    #[serde(rename = "WorkloadType")]
    pub workload_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(rename = "MemTotalKb")]
    pub total_kb: i64,
    #[serde(rename = "MemFreeKb")]
    pub free_kb: i64,
    #[serde(rename = "MemAvailableKb")]
    pub available_kb: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    #[serde(rename = "Started")]
    pub started: bool,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Issuer")]
    pub issuer: String,
    #[serde(rename = "MachineId")]
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    #[serde(rename = "Stopped")]
    pub stopped: bool,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Issuer")]
    pub issuer: String,
    #[serde(rename = "MachineId")]
    pub machine_id: String,
}

// =============================================================================
// Listener
// =============================================================================

pub struct ApiListener {
    bus: Arc<dyn Bus>,
    manager: Arc<MachineManager>,
    cache: Arc<PayloadCache>,
    keys: Arc<NodeKeys>,
    config: NodeConfig,
    node_id: String,
    tags: HashMap<String, String>,
    start: Instant,
}

impl ApiListener {
    pub fn new(
        bus: Arc<dyn Bus>,
        manager: Arc<MachineManager>,
        cache: Arc<PayloadCache>,
        keys: Arc<NodeKeys>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let mut tags = config.tags.clone();
        tags.insert("nex.os".to_string(), std::env::consts::OS.to_string());
        tags.insert("nex.arch".to_string(), std::env::consts::ARCH.to_string());
        tags.insert(
            "nex.cpucount".to_string(),
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .to_string(),
        );

        info!(
            public_xkey = %keys.xkey_public(),
            "Use this key as the recipient for encrypted run requests"
        );

        let node_id = keys.public_key().to_string();
        Arc::new(Self {
            bus,
            manager,
            cache,
            keys,
            config,
            node_id,
            tags,
            start: Instant::now(),
        })
    }

    /// Subscribe the control subjects and start serving.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
        let patterns = [
            format!("{API_PREFIX}.PING"),
            format!("{API_PREFIX}.PING.{}", self.node_id),
            format!("{API_PREFIX}.INFO.*.{}", self.node_id),
            format!("{API_PREFIX}.DEPLOY.*.{}", self.node_id),
            format!("{API_PREFIX}.STOP.*.{}", self.node_id),
        ];

        for pattern in patterns {
            let sub = self
                .bus
                .subscribe(&pattern)
                .await
                .map_err(|e| NodeError::Internal(format!("failed to subscribe {pattern}: {e}")))?;
            tokio::spawn(Arc::clone(self).serve(sub, shutdown.clone()));
        }

        info!(
            id = %self.node_id,
            version = VERSION,
            "Control interface awaiting commands"
        );
        Ok(())
    }

    async fn serve(self: Arc<Self>, mut sub: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }

                msg = sub.next() => {
                    let Some(msg) = msg else { return };
                    self.dispatch(msg).await;
                }
            }
        }
    }

    async fn dispatch(&self, msg: Message) {
        let op = msg.subject.split('.').nth(1).unwrap_or_default().to_string();
        match op.as_str() {
            "PING" => self.handle_ping(msg).await,
            "INFO" => self.handle_info(msg).await,
            "DEPLOY" => self.handle_deploy(msg).await,
            "STOP" => self.handle_stop(msg).await,
            other => warn!(subject = %msg.subject, op = %other, "Unroutable control message"),
        }
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    async fn handle_ping(&self, msg: Message) {
        let response = PingResponse {
            node_id: self.node_id.clone(),
            version: VERSION.to_string(),
            uptime: format_uptime(self.start.elapsed()),
            running_machines: self.manager.running_count().await,
            tags: self.tags.clone(),
        };

        self.respond(&msg, Envelope::ok(PING_RESPONSE_TYPE, response))
            .await;
    }

    async fn handle_info(&self, msg: Message) {
        let namespace = match extract_namespace(&msg.subject) {
            Ok(ns) => ns,
            Err(err) => {
                error!(subject = %msg.subject, error = %err, "Failed to extract namespace for info request");
                self.respond_fail(INFO_RESPONSE_TYPE, &msg, err.to_string())
                    .await;
                return;
            }
        };

        let machines = self.manager.machines_snapshot().await;
        let response = InfoResponse {
            version: VERSION.to_string(),
            public_xkey: self.keys.xkey_public().to_string(),
            uptime: format_uptime(self.start.elapsed()),
            tags: self.tags.clone(),
            supported_workload_types: self.config.workload_types.clone(),
            machines: summarize_machines(&machines, &namespace),
            memory: read_memory_stats(),
        };

        self.respond(&msg, Envelope::ok(INFO_RESPONSE_TYPE, response))
            .await;
    }

    async fn handle_deploy(&self, msg: Message) {
        let namespace = match extract_namespace(&msg.subject) {
            Ok(ns) => ns,
            Err(err) => {
                error!(subject = %msg.subject, error = %err, "Invalid subject for workload deployment");
                self.respond_fail(
                    RUN_RESPONSE_TYPE,
                    &msg,
                    "Invalid subject for workload deployment".to_string(),
                )
                .await;
                return;
            }
        };

        let request: DeployRequest = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, "Failed to deserialize deploy request");
                self.respond_fail(
                    RUN_RESPONSE_TYPE,
                    &msg,
                    format!("Unable to deserialize deploy request: {err}"),
                )
                .await;
                return;
            }
        };

        if !self.config.supports_workload_type(&request.workload_type) {
            error!(workload_type = %request.workload_type, "This node does not support the given workload type");
            self.respond_fail(
                RUN_RESPONSE_TYPE,
                &msg,
                NodeError::UnsupportedWorkloadType(request.workload_type.clone()).to_string(),
            )
            .await;
            return;
        }

        // Trigger subjects are rejected before any VM is consumed when the
        // workload type cannot register them.
        if !request.trigger_subjects.is_empty()
            && !self.config.supports_trigger_subjects(&request.workload_type)
        {
            error!(workload_type = %request.workload_type, "Workload type does not support trigger subject registration");
            self.respond_fail(
                RUN_RESPONSE_TYPE,
                &msg,
                NodeError::TriggerNotSupported(request.workload_type.clone()).to_string(),
            )
            .await;
            return;
        }

        let (claims, environment) = match request.validate(&self.keys) {
            Ok(v) => v,
            Err(err) => {
                error!(error = %err, "Invalid deploy request");
                self.respond_fail(RUN_RESPONSE_TYPE, &msg, format!("Invalid deploy request: {err}"))
                    .await;
                return;
            }
        };

        if !self.config.issuer_is_valid(&claims.issuer) {
            let err = NodeError::IssuerRejected(claims.issuer.clone());
            error!(error = %err, "Workload validation failed");
            self.respond_fail(RUN_RESPONSE_TYPE, &msg, err.to_string())
                .await;
            return;
        }

        let (num_bytes, hash) = match self
            .cache
            .cache_workload(&claims, request.js_domain.as_deref())
            .await
        {
            Ok(v) => v,
            Err(err) => {
                error!(error = %err, "Failed to cache workload bytes");
                self.respond_fail(
                    RUN_RESPONSE_TYPE,
                    &msg,
                    format!("Failed to cache workload bytes: {err}"),
                )
                .await;
                return;
            }
        };

        let vmid = match self.manager.allocate().await {
            Ok(vmid) => vmid,
            Err(err) => {
                error!(error = %err, "No warm machine available for deployment");
                self.respond_fail(RUN_RESPONSE_TYPE, &msg, format!("Unable to deploy workload: {err}"))
                    .await;
                return;
            }
        };

        let workload_name = claims.subject.clone();
        info!(
            vmid = %vmid,
            namespace = %namespace,
            workload = %workload_name,
            workload_size = num_bytes,
            workload_sha256 = %hash,
            workload_type = %request.workload_type,
            "Submitting workload to VM"
        );

        let agent_request = AgentDeployRequest {
            argv: request.argv.clone(),
            decoded_claims: claims.clone(),
            description: request.description.clone(),
            environment,
            hash,
            namespace: namespace.clone(),
            total_bytes: num_bytes as i64,
            trigger_subjects: request.trigger_subjects.clone(),
            workload_name: workload_name.clone(),
            workload_type: request.workload_type.clone(),
        };

        if let Err(err) = self.manager.deploy_workload(&vmid, agent_request).await {
            error!(error = %err, "Failed to deploy workload in VM");
            self.respond_fail(RUN_RESPONSE_TYPE, &msg, format!("Unable to deploy workload: {err}"))
                .await;
            return;
        }

        info!(workload = %workload_name, vmid = %vmid, "Workload deployed");

        let response = RunResponse {
            started: true,
            name: workload_name,
            issuer: claims.issuer,
            machine_id: vmid,
        };
        self.respond(&msg, Envelope::ok(RUN_RESPONSE_TYPE, response))
            .await;
    }

    async fn handle_stop(&self, msg: Message) {
        let namespace = match extract_namespace(&msg.subject) {
            Ok(ns) => ns,
            Err(err) => {
                error!(subject = %msg.subject, error = %err, "Invalid subject for workload stop");
                self.respond_fail(
                    STOP_RESPONSE_TYPE,
                    &msg,
                    "Invalid subject for workload stop".to_string(),
                )
                .await;
                return;
            }
        };

        let request: StopRequest = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, "Failed to deserialize stop request");
                self.respond_fail(
                    STOP_RESPONSE_TYPE,
                    &msg,
                    format!("Unable to deserialize stop request: {err}"),
                )
                .await;
                return;
            }
        };

        if !self.manager.machine_exists(&request.workload_id).await {
            error!(vmid = %request.workload_id, "Stop request: no such workload");
            self.respond_fail(STOP_RESPONSE_TYPE, &msg, NodeError::NotFound.to_string())
                .await;
            return;
        }

        // Reported identically to not-found so existence cannot be probed
        // across namespaces.
        let vm_namespace = self.manager.machine_namespace(&request.workload_id).await;
        if vm_namespace.as_deref() != Some(namespace.as_str()) {
            error!(
                namespace = vm_namespace.as_deref().unwrap_or(""),
                targetnamespace = %namespace,
                "Namespace mismatch on workload stop request"
            );
            self.respond_fail(
                STOP_RESPONSE_TYPE,
                &msg,
                NodeError::NamespaceMismatch.to_string(),
            )
            .await;
            return;
        }

        let Some(deploy_claims) = self.manager.deployed_claims(&request.workload_id).await else {
            error!(vmid = %request.workload_id, "Stop request for machine without workload");
            self.respond_fail(STOP_RESPONSE_TYPE, &msg, NodeError::NotFound.to_string())
                .await;
            return;
        };

        if let Err(err) = request.validate(&deploy_claims) {
            error!(error = %err, "Failed to validate stop request");
            self.respond_fail(STOP_RESPONSE_TYPE, &msg, format!("Invalid stop request: {err}"))
                .await;
            return;
        }

        if let Err(err) = self.manager.stop_machine(&request.workload_id).await {
            error!(error = %err, "Failed to stop workload");
            self.respond_fail(STOP_RESPONSE_TYPE, &msg, format!("Failed to stop workload: {err}"))
                .await;
            return;
        }

        let response = StopResponse {
            stopped: true,
            name: deploy_claims.subject,
            issuer: deploy_claims.issuer,
            machine_id: request.workload_id,
        };
        self.respond(&msg, Envelope::ok(STOP_RESPONSE_TYPE, response))
            .await;
    }

    // -------------------------------------------------------------------------
    // Replies
    // -------------------------------------------------------------------------

    async fn respond<T: Serialize>(&self, msg: &Message, envelope: Envelope<T>) {
        let Some(reply) = &msg.reply else { return };

        match serde_json::to_vec(&envelope) {
            Ok(raw) => {
                if let Err(err) = self.bus.publish(reply, Bytes::from(raw)).await {
                    error!(error = %err, "Failed to publish control response");
                }
            }
            Err(err) => error!(error = %err, "Failed to marshal control response"),
        }
    }

    async fn respond_fail(&self, response_type: &str, msg: &Message, reason: String) {
        self.respond(msg, failure_envelope(response_type, reason))
            .await;
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// The namespace token of a control subject (`<prefix>.<op>.<ns>...`).
pub fn extract_namespace(subject: &str) -> Result<String, NodeError> {
    subject
        .split('.')
        .nth(2)
        .map(str::to_string)
        .ok_or(NodeError::InvalidSubject)
}

fn summarize_machines(machines: &[Machine], namespace: &str) -> Vec<MachineSummary> {
    let now = chrono::Utc::now();

    machines
        .iter()
        .filter(|m| m.namespace.as_deref() == Some(namespace))
        .filter_map(|m| {
            let deployment = m.deployment.as_ref()?;
            let machine_uptime = (now - m.machine_started)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let runtime = m
                .workload_started
                .map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);

            Some(MachineSummary {
                id: m.vmid.clone(),
                healthy: m.handshake_ok,
                uptime: format_uptime(machine_uptime),
                workload: WorkloadSummary {
                    name: deployment.decoded_claims.subject.clone(),
                    description: deployment.description.clone().unwrap_or_default(),
                    runtime: format_uptime(runtime),
                    workload_type: deployment.workload_type.clone(),
                },
            })
        })
        .collect()
}

/// Uptime rendering matching the NATS server, for operator consistency.
pub fn format_uptime(d: Duration) -> String {
    let tsecs = d.as_secs();
    let tmins = tsecs / 60;
    let thrs = tmins / 60;
    let tdays = thrs / 24;
    let tyrs = tdays / 365;

    if tyrs > 0 {
        return format!(
            "{}y{}d{}h{}m{}s",
            tyrs,
            tdays % 365,
            thrs % 24,
            tmins % 60,
            tsecs % 60
        );
    }
    if tdays > 0 {
        return format!("{}d{}h{}m{}s", tdays, thrs % 24, tmins % 60, tsecs % 60);
    }
    if thrs > 0 {
        return format!("{}h{}m{}s", thrs, tmins % 60, tsecs % 60);
    }
    if tmins > 0 {
        return format!("{}m{}s", tmins, tsecs % 60);
    }
    format!("{}s", tsecs)
}

/// Best-effort host memory stats; absent on platforms without /proc.
fn read_memory_stats() -> Option<MemoryStats> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut free_kb = None;
    let mut available_kb = None;

    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<i64>() else {
            continue;
        };

        match key.trim_end_matches(':') {
            "MemTotal" => total_kb = Some(value),
            "MemFree" => free_kb = Some(value),
            "MemAvailable" => available_kb = Some(value),
            _ => {}
        }

        if total_kb.is_some() && free_kb.is_some() && available_kb.is_some() {
            break;
        }
    }

    Some(MemoryStats {
        total_kb: total_kb?,
        free_kb: free_kb?,
        available_kb: available_kb?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_namespace() {
        assert_eq!(
            extract_namespace("$NEX.DEPLOY.ns1.NODEID").unwrap(),
            "ns1"
        );
        assert_eq!(extract_namespace("$NEX.STOP.ns2.NODEID").unwrap(), "ns2");
        assert!(matches!(
            extract_namespace("$NEX.PING"),
            Err(NodeError::InvalidSubject)
        ));
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(12)), "12s");
        assert_eq!(format_uptime(Duration::from_secs(62)), "1m2s");
        assert_eq!(format_uptime(Duration::from_secs(3_723)), "1h2m3s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d1h1m1s");
        assert_eq!(
            format_uptime(Duration::from_secs(365 * 24 * 3600 + 90_061)),
            "1y1d1h1m1s"
        );
    }

    #[test]
    fn test_failure_envelope_has_empty_data() {
        let envelope = failure_envelope(RUN_RESPONSE_TYPE, "No such workload".to_string());
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "run_response");
        assert_eq!(value["data"], "");
        assert_eq!(value["error"], "No such workload");
    }

    #[test]
    fn test_ping_response_wire_names() {
        let response = PingResponse {
            node_id: "NODE".to_string(),
            version: VERSION.to_string(),
            uptime: "1s".to_string(),
            running_machines: 2,
            tags: HashMap::new(),
        };
        let value = serde_json::to_value(Envelope::ok(PING_RESPONSE_TYPE, response)).unwrap();
        assert_eq!(value["data"]["NodeId"], "NODE");
        assert_eq!(value["data"]["RunningMachines"], 2);
        assert!(value.get("error").is_none());
    }
}
