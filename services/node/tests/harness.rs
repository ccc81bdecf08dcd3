//! Test harness for node integration tests.
//!
//! Wires a full node against in-process buses: mock launcher with agent
//! handshakes, a scripted fake agent on the internal bus, and helpers to
//! build signed deploy/stop requests the way an operator client would.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use nex_node::agent::{AgentDeployResponse, RUNTIME_NS_HEADER};
use nex_node::bus::{Bus, Headers, MemoryBus, Message};
use nex_node::claims::{
    issued_now, seal_environment, IssuerKey, NodeKeys, StopClaims, WorkloadClaims,
};
use nex_node::config::NodeConfig;
use nex_node::control::{ApiListener, DeployRequest, Envelope, StopRequest};
use nex_node::launcher::{MockLauncher, NoopNetworkReset};
use nex_node::machines::MachineManager;
use nex_node::payload::PayloadCache;
use nex_node::telemetry::Telemetry;

/// Bucket test artifacts live in on the "remote" object store.
pub const REMOTE_BUCKET: &str = "wbucket";

/// How the fake agent behaves.
#[derive(Debug, Clone)]
pub struct AgentScript {
    /// Accept deploy hand-offs.
    pub accept_deploys: bool,
    /// Reply to undeploy requests (false simulates a hung workload).
    pub respond_undeploy: bool,
}

impl Default for AgentScript {
    fn default() -> Self {
        Self {
            accept_deploys: true,
            respond_undeploy: true,
        }
    }
}

pub struct TestNode {
    pub external: Arc<MemoryBus>,
    pub internal: Arc<MemoryBus>,
    pub launcher: Arc<MockLauncher>,
    pub telemetry: Arc<Telemetry>,
    pub manager: Arc<MachineManager>,
    pub issuer: IssuerKey,
    pub node_id: String,
    pub xkey_public: String,
}

/// Start a complete node with handshaking mock VMs and a scripted agent.
pub async fn start_node(config: NodeConfig, script: AgentScript) -> TestNode {
    let external: Arc<MemoryBus> = Arc::new(MemoryBus::new());
    let internal: Arc<MemoryBus> = Arc::new(MemoryBus::new());
    let launcher = Arc::new(MockLauncher::with_handshakes(internal.clone()));
    start_node_with(config, script, external, internal, launcher).await
}

/// Start a node whose launched VMs never announce an agent handshake.
pub async fn start_silent_node(config: NodeConfig) -> TestNode {
    let external: Arc<MemoryBus> = Arc::new(MemoryBus::new());
    let internal: Arc<MemoryBus> = Arc::new(MemoryBus::new());
    let launcher = Arc::new(MockLauncher::silent(internal.clone()));
    // No fake agent either: deploys to these machines time out.
    start_node_with(
        config,
        AgentScript {
            accept_deploys: false,
            respond_undeploy: false,
        },
        external,
        internal,
        launcher,
    )
    .await
}

async fn start_node_with(
    config: NodeConfig,
    script: AgentScript,
    external: Arc<MemoryBus>,
    internal: Arc<MemoryBus>,
    launcher: Arc<MockLauncher>,
) -> TestNode {
    let keys = Arc::new(NodeKeys::generate());
    let node_id = keys.public_key().to_string();
    let xkey_public = keys.xkey_public().to_string();

    let telemetry = Arc::new(Telemetry::new().unwrap());
    let manager = MachineManager::new(
        config.clone(),
        node_id.clone(),
        external.clone(),
        internal.clone(),
        launcher.clone(),
        Arc::new(NoopNetworkReset),
        telemetry.clone(),
    )
    .await
    .unwrap();

    tokio::spawn(Arc::clone(&manager).run());

    let cache = Arc::new(PayloadCache::new(external.clone(), internal.clone()));
    let listener = ApiListener::new(
        external.clone(),
        Arc::clone(&manager),
        cache,
        keys,
        config,
    );
    listener.start(manager.shutdown_signal()).await.unwrap();

    spawn_fake_agent(internal.clone(), script).await;

    TestNode {
        external,
        internal,
        launcher,
        telemetry,
        manager,
        issuer: IssuerKey::generate(),
        node_id,
        xkey_public,
    }
}

/// Scripted agent living on the internal bus. Echoes trigger payloads with a
/// fixed runtime header. All subjects are subscribed before this returns.
async fn spawn_fake_agent(internal: Arc<MemoryBus>, script: AgentScript) {
    let mut deploy_sub = internal.subscribe("agentint.*.deploy").await.unwrap();
    let mut undeploy_sub = internal.subscribe("agentint.*.undeploy").await.unwrap();
    let mut trigger_sub = internal.subscribe("agentint.*.trigger").await.unwrap();

    {
        let internal = internal.clone();
        let script = script.clone();
        tokio::spawn(async move {
            while let Some(msg) = deploy_sub.next().await {
                let response = AgentDeployResponse {
                    accepted: script.accept_deploys,
                    message: (!script.accept_deploys).then(|| "deploy refused".to_string()),
                };
                if let Some(reply) = msg.reply {
                    internal
                        .publish(&reply, Bytes::from(serde_json::to_vec(&response).unwrap()))
                        .await
                        .unwrap();
                }
            }
        });
    }

    {
        let internal = internal.clone();
        tokio::spawn(async move {
            while let Some(msg) = undeploy_sub.next().await {
                if !script.respond_undeploy {
                    continue;
                }
                if let Some(reply) = msg.reply {
                    internal.publish(&reply, Bytes::new()).await.unwrap();
                }
            }
        });
    }

    tokio::spawn(async move {
        while let Some(msg) = trigger_sub.next().await {
            let mut headers = Headers::new();
            headers.insert(RUNTIME_NS_HEADER.to_string(), "1500".to_string());
            if let Some(reply) = msg.reply {
                internal
                    .publish_message(Message {
                        subject: reply,
                        reply: None,
                        headers,
                        payload: msg.payload,
                    })
                    .await
                    .unwrap();
            }
        }
    });
}

/// Block until the node tracks at least `count` machines.
pub async fn wait_for_pool(node: &TestNode, count: usize) {
    for _ in 0..200 {
        if node.manager.running_count().await >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pool never warmed to {count} machines");
}

/// Stage an artifact in the remote store and build the signed deploy request
/// an operator client would send.
pub async fn build_deploy_request(
    node: &TestNode,
    workload_name: &str,
    workload_type: &str,
    trigger_subjects: Vec<String>,
    artifact: &[u8],
) -> DeployRequest {
    let key = format!("{workload_name}.bin");
    node.external
        .object_put(REMOTE_BUCKET, &key, Bytes::from(artifact.to_vec()))
        .await
        .unwrap();

    let claims = WorkloadClaims {
        subject: workload_name.to_string(),
        issuer: node.issuer.public_key(),
        hash: hex::encode(Sha256::digest(artifact)),
        location: format!("nats://{REMOTE_BUCKET}/{key}"),
        workload_type: workload_type.to_string(),
        description: Some("integration test workload".to_string()),
        trigger_subjects: (!trigger_subjects.is_empty()).then(|| trigger_subjects.clone()),
        argv: None,
        issued_at: issued_now(),
    };

    let mut environment = HashMap::new();
    environment.insert("WORKLOAD".to_string(), workload_name.to_string());

    DeployRequest {
        workload_type: workload_type.to_string(),
        location: claims.location.clone(),
        workload_name: workload_name.to_string(),
        description: claims.description.clone(),
        argv: None,
        workload_environment: seal_environment(&environment, &node.xkey_public).unwrap(),
        trigger_subjects,
        js_domain: None,
        claims_jwt: node.issuer.sign_token(&claims).unwrap(),
    }
}

/// Build a stop request for a deployed workload, signed by its issuer.
pub fn build_stop_request(node: &TestNode, workload_name: &str, vmid: &str) -> StopRequest {
    let claims = StopClaims {
        subject: workload_name.to_string(),
        issuer: node.issuer.public_key(),
        workload_id: vmid.to_string(),
        issued_at: issued_now(),
    };

    StopRequest {
        workload_id: vmid.to_string(),
        claims_jwt: node.issuer.sign_token(&claims).unwrap(),
    }
}

/// Send a control request and split the reply envelope into data / error.
pub async fn control_request<T: DeserializeOwned>(
    node: &TestNode,
    subject: &str,
    body: &impl serde::Serialize,
) -> (Option<T>, Option<String>) {
    let reply = node
        .external
        .request(
            subject,
            Bytes::from(serde_json::to_vec(body).unwrap()),
            Headers::new(),
            Duration::from_secs(5),
        )
        .await
        .expect("control request timed out");

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(&reply.payload).unwrap();
    match envelope.error {
        Some(err) => (None, Some(err)),
        None => (
            Some(serde_json::from_value(envelope.data).expect("malformed response data")),
            None,
        ),
    }
}

pub fn deploy_subject(node: &TestNode, namespace: &str) -> String {
    format!("$NEX.DEPLOY.{namespace}.{}", node.node_id)
}

pub fn stop_subject(node: &TestNode, namespace: &str) -> String {
    format!("$NEX.STOP.{namespace}.{}", node.node_id)
}
