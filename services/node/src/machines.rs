//! The machine manager: warm pool, deployment binding, lifecycle.
//!
//! Sustains N pre-warmed micro-VMs, allocates them to deployments, relays
//! workloads into their agents, and tears them down. All shared maps sit
//! behind one lock; the warm-pool channel's capacity provides backpressure
//! on VM creation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentChannel, AgentDeployRequest, WorkloadResolver};
use crate::bus::Bus;
use crate::claims::WorkloadClaims;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::launcher::{clean_sockets, NetworkReset, VmLauncher};
use crate::telemetry::Telemetry;
use crate::trigger::{bind_trigger_subject, TriggerBinding, TriggerContext};
use nex_events::{
    event_types, events_subject, logs_subject, CloudEvent, EmittedLog, LogLevel, WorkloadStopped,
};

/// Sleep at the head of the warming loop when the pool is already full.
const RUNLOOP_SLEEP: Duration = Duration::from_millis(100);

/// Lifecycle phase of a tracked machine. Transitions are monotonic except
/// warming → warm-idle → assigned; stopping is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinePhase {
    Warming,
    WarmIdle,
    Assigned,
    Stopping,
}

/// A machine tracked by the manager. Owned exclusively by the manager state;
/// a machine carries at most one deployment in its lifetime.
#[derive(Debug, Clone)]
pub struct Machine {
    pub vmid: String,
    pub ip: String,
    pub machine_started: DateTime<Utc>,
    pub workload_started: Option<DateTime<Utc>>,
    pub vcpu_count: i64,
    pub mem_size_mib: i64,
    pub phase: MachinePhase,
    pub handshake_ok: bool,
    pub namespace: Option<String>,
    pub deployment: Option<AgentDeployRequest>,
    /// Whether workload telemetry was incremented for this machine; the stop
    /// path decrements only when set so counters stay conserved.
    counted: bool,
}

#[derive(Default)]
struct ManagerState {
    machines: HashMap<String, Machine>,
    bindings: HashMap<String, Vec<TriggerBinding>>,
}

pub struct MachineManager {
    config: NodeConfig,
    node_public_key: String,
    external: Arc<dyn Bus>,
    agent: Arc<AgentChannel>,
    launcher: Arc<dyn VmLauncher>,
    network_reset: Arc<dyn NetworkReset>,
    telemetry: Arc<Telemetry>,

    state: Mutex<ManagerState>,
    pool_tx: Mutex<Option<mpsc::Sender<String>>>,
    pool_rx: Mutex<mpsc::Receiver<String>>,

    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl MachineManager {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: NodeConfig,
        node_public_key: impl Into<String>,
        external: Arc<dyn Bus>,
        internal: Arc<dyn Bus>,
        launcher: Arc<dyn VmLauncher>,
        network_reset: Arc<dyn NetworkReset>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Arc<Self>, NodeError> {
        config
            .validate()
            .map_err(|e| NodeError::Internal(format!("invalid node config: {e}")))?;

        let node_public_key = node_public_key.into();
        let agent = AgentChannel::new(internal, Arc::clone(&external), node_public_key.clone());
        let (pool_tx, pool_rx) = mpsc::channel(config.machine_pool_size);
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            config,
            node_public_key,
            external,
            agent,
            launcher,
            network_reset,
            telemetry,
            state: Mutex::new(ManagerState::default()),
            pool_tx: Mutex::new(Some(pool_tx)),
            pool_rx: Mutex::new(pool_rx),
            closing: AtomicBool::new(false),
            shutdown_tx,
        });

        let resolver: Arc<dyn WorkloadResolver> = Arc::clone(&manager) as Arc<dyn WorkloadResolver>;
        manager
            .agent
            .start(resolver, manager.shutdown_tx.subscribe())
            .await?;

        Ok(manager)
    }

    /// The agent channel, for wiring the control listener's collaborators.
    pub fn agent(&self) -> Arc<AgentChannel> {
        Arc::clone(&self.agent)
    }

    pub fn stopping(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Warming loop
    // -------------------------------------------------------------------------

    /// Sustain the warm pool until the manager stops. Run as its own task.
    pub async fn run(self: Arc<Self>) {
        info!("Virtual machine manager starting");

        if !self.config.preserve_network {
            if let Err(err) = self.network_reset.reset() {
                warn!(error = %err, "Failed to reset network");
            }
        }

        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if self.stopping() {
                return;
            }

            let Some(pool_tx) = self.pool_tx.lock().await.clone() else {
                return;
            };

            if pool_tx.capacity() == 0 {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(RUNLOOP_SLEEP) => {}
                }
                continue;
            }

            let vm = match self.launcher.launch().await {
                Ok(vm) => vm,
                Err(err) => {
                    // No backoff: the next loop iteration retries.
                    warn!(error = %err, "Failed to create VM for warming pool");
                    tokio::time::sleep(RUNLOOP_SLEEP).await;
                    continue;
                }
            };

            {
                let mut state = self.state.lock().await;
                state.machines.insert(
                    vm.vmid.clone(),
                    Machine {
                        vmid: vm.vmid.clone(),
                        ip: vm.ip.clone(),
                        machine_started: Utc::now(),
                        workload_started: None,
                        vcpu_count: vm.vcpu_count,
                        mem_size_mib: vm.mem_size_mib,
                        phase: MachinePhase::Warming,
                        handshake_ok: false,
                        namespace: None,
                        deployment: None,
                        counted: false,
                    },
                );
            }
            self.telemetry.vm_started();

            tokio::spawn(Arc::clone(&self).handshake_waiter(vm.vmid.clone()));

            info!(ip = %vm.ip, vmid = %vm.vmid, "Adding new VM to warm pool");

            {
                let mut state = self.state.lock().await;
                if let Some(machine) = state.machines.get_mut(&vm.vmid) {
                    machine.phase = MachinePhase::WarmIdle;
                }
            }

            // Blocks when the pool already holds N machines; allocation makes
            // room. This is the backpressure that keeps warming aligned to N.
            tokio::select! {
                _ = shutdown.changed() => return,
                sent = pool_tx.send(vm.vmid.clone()) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Wait for the agent handshake of a freshly launched machine. A machine
    /// that never hand-shakes stays in the map; a later deploy against it
    /// fails at the agent deadline and tears it down.
    async fn handshake_waiter(self: Arc<Self>, vmid: String) {
        match self
            .agent
            .await_handshake(&vmid, self.config.handshake_timeout)
            .await
        {
            Ok(()) => {
                let mut state = self.state.lock().await;
                if let Some(machine) = state.machines.get_mut(&vmid) {
                    machine.handshake_ok = true;
                }
                debug!(vmid = %vmid, "Agent handshake complete");
            }
            Err(_) => {
                error!(
                    vmid = %vmid,
                    "Did not receive handshake from agent within timeout"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Allocation and deployment
    // -------------------------------------------------------------------------

    /// Take ownership of a warm machine, blocking until one is available.
    pub async fn allocate(&self) -> Result<String, NodeError> {
        loop {
            let vmid = {
                let mut rx = self.pool_rx.lock().await;
                rx.recv().await
            }
            .ok_or_else(|| NodeError::Internal("warm pool closed".to_string()))?;

            let mut state = self.state.lock().await;
            match state.machines.get_mut(&vmid) {
                Some(machine) if machine.phase == MachinePhase::WarmIdle => {
                    machine.phase = MachinePhase::Assigned;
                    return Ok(vmid);
                }
                // Stale pool entry: the machine was stopped while idle.
                _ => continue,
            }
        }
    }

    /// Bind a prepared deployment to an allocated machine.
    ///
    /// On rejection, timeout, or subscription failure the machine is torn
    /// down before the error is surfaced.
    pub async fn deploy_workload(
        &self,
        vmid: &str,
        request: AgentDeployRequest,
    ) -> Result<(), NodeError> {
        let (vcpus, memory) = {
            let mut state = self.state.lock().await;
            let machine = state.machines.get_mut(vmid).ok_or(NodeError::NotFound)?;
            machine.namespace = Some(request.namespace.clone());
            machine.workload_started = Some(Utc::now());
            machine.deployment = Some(request.clone());
            (machine.vcpu_count, machine.mem_size_mib)
        };

        if let Err(err) = self
            .agent
            .deploy(vmid, &request, self.config.deploy_timeout)
            .await
        {
            error!(vmid = %vmid, error = %err, "Failed to deploy workload in VM");
            let _ = self.stop_machine(vmid).await;
            return Err(err);
        }

        if self.config.supports_trigger_subjects(&request.workload_type)
            && !request.trigger_subjects.is_empty()
        {
            for tsub in &request.trigger_subjects {
                let ctx = TriggerContext {
                    vmid: vmid.to_string(),
                    namespace: request.namespace.clone(),
                    workload_name: request.workload_name.clone(),
                    workload_type: request.workload_type.clone(),
                    node_public_key: self.node_public_key.clone(),
                };

                match bind_trigger_subject(
                    Arc::clone(&self.external),
                    self.agent(),
                    Arc::clone(&self.telemetry),
                    ctx,
                    tsub.clone(),
                    self.config.trigger_timeout,
                )
                .await
                {
                    Ok(binding) => {
                        info!(
                            vmid = %vmid,
                            trigger_subject = %tsub,
                            workload_type = %request.workload_type,
                            "Created trigger subject subscription for deployed workload"
                        );
                        let mut state = self.state.lock().await;
                        state
                            .bindings
                            .entry(vmid.to_string())
                            .or_default()
                            .push(binding);
                    }
                    Err(err) => {
                        error!(
                            vmid = %vmid,
                            trigger_subject = %tsub,
                            workload_type = %request.workload_type,
                            error = %err,
                            "Failed to create trigger subject subscription for deployed workload"
                        );
                        let _ = self.stop_machine(vmid).await;
                        return Err(err);
                    }
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            if let Some(machine) = state.machines.get_mut(vmid) {
                machine.counted = true;
            }
        }
        self.telemetry.workload_deployed(
            &request.namespace,
            &request.workload_type,
            request.total_bytes,
            vcpus,
            memory,
        );

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stop
    // -------------------------------------------------------------------------

    /// Stop a single machine. Idempotent modulo the first call returning Ok
    /// and subsequent calls failing with `NotFound`.
    pub async fn stop_machine(&self, vmid: &str) -> Result<(), NodeError> {
        let (deployment, bindings, namespace, vcpus, memory, counted) = {
            let mut state = self.state.lock().await;
            let machine = state.machines.get_mut(vmid).ok_or(NodeError::NotFound)?;
            if machine.phase == MachinePhase::Stopping {
                return Err(NodeError::NotFound);
            }
            machine.phase = MachinePhase::Stopping;

            let bindings = state.bindings.remove(vmid).unwrap_or_default();
            let machine = state.machines.get(vmid).expect("machine present");
            (
                machine.deployment.clone(),
                bindings,
                machine.namespace.clone(),
                machine.vcpu_count,
                machine.mem_size_mib,
                machine.counted,
            )
        };

        debug!(vmid = %vmid, "Attempting to stop virtual machine");

        if deployment.is_some() {
            // Graceful undeploy; the timeout is logged and swallowed because
            // the machine is torn down regardless.
            if let Err(err) = self
                .agent
                .undeploy(vmid, self.config.undeploy_timeout)
                .await
            {
                warn!(
                    vmid = %vmid,
                    error = %err,
                    "Request to undeploy workload via internal bus failed"
                );
            }
        }

        for binding in bindings {
            let subject = binding.subject.clone();
            binding.drain().await;
            debug!(
                subject = %subject,
                vmid = %vmid,
                "Drained subscription associated with VM"
            );
        }

        if let Err(err) = self.launcher.shutdown(vmid).await {
            warn!(vmid = %vmid, error = %err, "VM launcher shutdown failed");
        }

        {
            let mut state = self.state.lock().await;
            state.machines.remove(vmid);
        }

        self.publish_machine_stopped(vmid, namespace.as_deref(), deployment.as_ref())
            .await;

        self.telemetry.vm_stopped();
        if counted {
            if let (Some(namespace), Some(deployment)) = (&namespace, &deployment) {
                self.telemetry.workload_stopped(
                    namespace,
                    &deployment.workload_type,
                    deployment.total_bytes,
                    vcpus,
                    memory,
                );
            }
        }

        Ok(())
    }

    /// Stop the manager: tear down every machine and clean host residue.
    /// Runs at most once; later calls are no-ops. Events emitted here are
    /// best-effort.
    pub async fn stop(&self) -> Result<(), NodeError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Virtual machine manager stopping");
        let _ = self.shutdown_tx.send(true);

        // Close the warm pool channel; allocation fails from here on.
        self.pool_tx.lock().await.take();

        let vmids: Vec<String> = {
            let state = self.state.lock().await;
            state.machines.keys().cloned().collect()
        };

        for vmid in vmids {
            if let Err(err) = self.stop_machine(&vmid).await {
                warn!(vmid = %vmid, error = %err, "Failed to stop VM");
            }
        }

        clean_sockets();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    /// Number of machines currently tracked (idle and bound).
    pub async fn running_count(&self) -> usize {
        self.state.lock().await.machines.len()
    }

    /// Namespace bound to a machine, if deployed.
    pub async fn machine_namespace(&self, vmid: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.machines.get(vmid).and_then(|m| m.namespace.clone())
    }

    /// Whether the machine exists in the all-machines map.
    pub async fn machine_exists(&self, vmid: &str) -> bool {
        self.state.lock().await.machines.contains_key(vmid)
    }

    /// The verified claims of the deployment bound to a machine.
    pub async fn deployed_claims(&self, vmid: &str) -> Option<WorkloadClaims> {
        let state = self.state.lock().await;
        state
            .machines
            .get(vmid)
            .and_then(|m| m.deployment.as_ref())
            .map(|d| d.decoded_claims.clone())
    }

    /// Snapshot of all tracked machines, for info summaries.
    pub async fn machines_snapshot(&self) -> Vec<Machine> {
        let state = self.state.lock().await;
        state.machines.values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Lifecycle events
    // -------------------------------------------------------------------------

    async fn publish_machine_stopped(
        &self,
        vmid: &str,
        namespace: Option<&str>,
        deployment: Option<&AgentDeployRequest>,
    ) {
        let (Some(namespace), Some(deployment)) = (namespace, deployment) else {
            return;
        };

        let workload_name = deployment.decoded_claims.subject.trim();
        if workload_name.is_empty() {
            return;
        }

        let event = CloudEvent::new(
            self.node_public_key.clone(),
            event_types::WORKLOAD_STOPPED,
            WorkloadStopped {
                name: workload_name.to_string(),
                reason: Some("Workload shutdown requested".to_string()),
                vmid: vmid.to_string(),
            },
        );

        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(err) = self
                    .external
                    .publish(&events_subject(namespace), Bytes::from(payload))
                    .await
                {
                    error!(error = %err, "Failed to publish machine stopped event");
                }
            }
            Err(err) => error!(error = %err, "Failed to serialize machine stopped event"),
        }

        let log = EmittedLog {
            text: "Workload stopped".to_string(),
            level: LogLevel::Debug,
            machine_id: vmid.to_string(),
        };
        if let Ok(payload) = serde_json::to_vec(&log) {
            let subject = logs_subject(namespace, &self.node_public_key, workload_name, vmid);
            if let Err(err) = self.external.publish(&subject, Bytes::from(payload)).await {
                error!(error = %err, "Failed to publish machine stopped log");
            }
        }
    }
}

#[async_trait]
impl WorkloadResolver for MachineManager {
    async fn workload_info(&self, vmid: &str) -> Option<(String, String)> {
        let state = self.state.lock().await;
        let machine = state.machines.get(vmid)?;
        let namespace = machine.namespace.clone()?;
        let deployment = machine.deployment.as_ref()?;
        Some((namespace, deployment.workload_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::claims::issued_now;
    use crate::launcher::{MockLauncher, NoopNetworkReset};

    async fn test_manager(pool_size: usize) -> (Arc<MachineManager>, Arc<MemoryBus>, Arc<MemoryBus>)
    {
        let external: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let internal: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let launcher = Arc::new(MockLauncher::with_handshakes(internal.clone()));

        let config = NodeConfig {
            machine_pool_size: pool_size,
            ..NodeConfig::default()
        };

        let manager = MachineManager::new(
            config,
            "NODEKEY",
            external.clone(),
            internal.clone(),
            launcher,
            Arc::new(NoopNetworkReset),
            Arc::new(Telemetry::new().unwrap()),
        )
        .await
        .unwrap();

        tokio::spawn(Arc::clone(&manager).run());
        (manager, external, internal)
    }

    async fn wait_for_pool(manager: &MachineManager, count: usize) {
        for _ in 0..100 {
            if manager.running_count().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pool never warmed to {count}");
    }

    fn deploy_request(namespace: &str) -> AgentDeployRequest {
        AgentDeployRequest {
            argv: None,
            decoded_claims: WorkloadClaims {
                subject: "echo".to_string(),
                issuer: "issuer".to_string(),
                hash: "h".to_string(),
                location: "nats://b/k".to_string(),
                workload_type: "native".to_string(),
                description: None,
                trigger_subjects: None,
                argv: None,
                issued_at: issued_now(),
            },
            description: None,
            environment: HashMap::new(),
            hash: "h".to_string(),
            namespace: namespace.to_string(),
            total_bytes: 16,
            trigger_subjects: vec![],
            workload_name: "echo".to_string(),
            workload_type: "native".to_string(),
        }
    }

    /// Fake agent accepting any deploy for a vmid pattern.
    async fn spawn_accepting_agent(internal: Arc<MemoryBus>) {
        let mut sub = internal.subscribe("agentint.*.deploy").await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let response = crate::agent::AgentDeployResponse {
                    accepted: true,
                    message: None,
                };
                internal
                    .publish(
                        &msg.reply.unwrap(),
                        Bytes::from(serde_json::to_vec(&response).unwrap()),
                    )
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_pool_warms_to_configured_size() {
        let (manager, _, _) = test_manager(2).await;
        wait_for_pool(&manager, 2).await;

        // Steady state: the pool does not overshoot.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(manager.running_count().await, 2);
    }

    #[tokio::test]
    async fn test_allocate_marks_machine_assigned_and_pool_refills() {
        let (manager, _, _) = test_manager(2).await;
        wait_for_pool(&manager, 2).await;

        let vmid = manager.allocate().await.unwrap();
        let snapshot = manager.machines_snapshot().await;
        let machine = snapshot.iter().find(|m| m.vmid == vmid).unwrap();
        assert_eq!(machine.phase, MachinePhase::Assigned);

        // A replacement warms into the freed slot.
        wait_for_pool(&manager, 3).await;
    }

    #[tokio::test]
    async fn test_stop_machine_is_idempotent() {
        let (manager, _, internal) = test_manager(1).await;
        spawn_accepting_agent(internal).await;
        wait_for_pool(&manager, 1).await;

        let vmid = manager.allocate().await.unwrap();
        manager
            .deploy_workload(&vmid, deploy_request("ns1"))
            .await
            .unwrap();

        manager.stop_machine(&vmid).await.unwrap();
        let err = manager.stop_machine(&vmid).await.unwrap_err();
        assert!(matches!(err, NodeError::NotFound));
    }

    #[tokio::test]
    async fn test_deploy_timeout_tears_machine_down() {
        // No agent responder at all: deploy times out, machine is stopped.
        let external: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let internal: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let launcher = Arc::new(MockLauncher::silent(internal.clone()));

        let config = NodeConfig {
            machine_pool_size: 1,
            deploy_timeout: Duration::from_millis(80),
            ..NodeConfig::default()
        };

        let manager = MachineManager::new(
            config,
            "NODEKEY",
            external,
            internal,
            launcher,
            Arc::new(NoopNetworkReset),
            Arc::new(Telemetry::new().unwrap()),
        )
        .await
        .unwrap();
        tokio::spawn(Arc::clone(&manager).run());
        wait_for_pool(&manager, 1).await;

        let vmid = manager.allocate().await.unwrap();
        let err = manager
            .deploy_workload(&vmid, deploy_request("ns1"))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::AgentTimeout(_)));
        assert!(!manager.machine_exists(&vmid).await);
    }

    #[tokio::test]
    async fn test_stop_all_runs_once_and_drains_machines() {
        let (manager, _, _) = test_manager(2).await;
        wait_for_pool(&manager, 2).await;

        manager.stop().await.unwrap();
        assert_eq!(manager.running_count().await, 0);
        assert!(manager.stopping());

        // Second stop is a no-op.
        manager.stop().await.unwrap();

        // Allocation fails once the pool channel is closed and drained.
        let result = manager.allocate().await;
        assert!(result.is_err());
    }
}
