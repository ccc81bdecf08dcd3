//! Node telemetry.
//!
//! Counters and gauges for VMs, workloads, bytes, and resource allocation,
//! registered on a node-owned registry. Every increment on the deploy path
//! has a matching decrement on the stop path for the same VM; tests assert
//! that conservation.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

pub struct Telemetry {
    registry: Registry,

    vms_running: IntGauge,
    workloads_running: IntGaugeVec,
    deployed_bytes: IntGaugeVec,
    allocated_vcpus: IntGaugeVec,
    allocated_memory_mib: IntGaugeVec,

    function_triggers: IntCounterVec,
    function_failed_triggers: IntCounterVec,
    function_runtime_nanos: IntCounterVec,
}

impl Telemetry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let vms_running = IntGauge::new("nex_vms_running", "Machines currently tracked")?;
        let workloads_running = IntGaugeVec::new(
            Opts::new("nex_workloads_running", "Workloads currently deployed"),
            &["namespace", "workload_type"],
        )?;
        let deployed_bytes = IntGaugeVec::new(
            Opts::new("nex_deployed_bytes", "Bytes of deployed workload artifacts"),
            &["namespace"],
        )?;
        let allocated_vcpus = IntGaugeVec::new(
            Opts::new("nex_allocated_vcpus", "vCPUs allocated to deployed workloads"),
            &["namespace"],
        )?;
        let allocated_memory_mib = IntGaugeVec::new(
            Opts::new(
                "nex_allocated_memory_mib",
                "Memory (MiB) allocated to deployed workloads",
            ),
            &["namespace"],
        )?;

        let function_triggers = IntCounterVec::new(
            Opts::new("nex_function_triggers_total", "Successful trigger executions"),
            &["namespace", "workload_name"],
        )?;
        let function_failed_triggers = IntCounterVec::new(
            Opts::new(
                "nex_function_failed_triggers_total",
                "Failed trigger executions",
            ),
            &["namespace", "workload_name"],
        )?;
        let function_runtime_nanos = IntCounterVec::new(
            Opts::new(
                "nex_function_runtime_nanos_total",
                "Cumulative reported function runtime in nanoseconds",
            ),
            &["namespace", "workload_name"],
        )?;

        registry.register(Box::new(vms_running.clone()))?;
        registry.register(Box::new(workloads_running.clone()))?;
        registry.register(Box::new(deployed_bytes.clone()))?;
        registry.register(Box::new(allocated_vcpus.clone()))?;
        registry.register(Box::new(allocated_memory_mib.clone()))?;
        registry.register(Box::new(function_triggers.clone()))?;
        registry.register(Box::new(function_failed_triggers.clone()))?;
        registry.register(Box::new(function_runtime_nanos.clone()))?;

        Ok(Self {
            registry,
            vms_running,
            workloads_running,
            deployed_bytes,
            allocated_vcpus,
            allocated_memory_mib,
            function_triggers,
            function_failed_triggers,
            function_runtime_nanos,
        })
    }

    /// The underlying registry, for exposition by the surrounding runtime.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn vm_started(&self) {
        self.vms_running.add(1);
    }

    pub fn vm_stopped(&self) {
        self.vms_running.sub(1);
    }

    pub fn workload_deployed(
        &self,
        namespace: &str,
        workload_type: &str,
        total_bytes: i64,
        vcpus: i64,
        memory_mib: i64,
    ) {
        self.workloads_running
            .with_label_values(&[namespace, workload_type])
            .add(1);
        self.deployed_bytes
            .with_label_values(&[namespace])
            .add(total_bytes);
        self.allocated_vcpus
            .with_label_values(&[namespace])
            .add(vcpus);
        self.allocated_memory_mib
            .with_label_values(&[namespace])
            .add(memory_mib);
    }

    pub fn workload_stopped(
        &self,
        namespace: &str,
        workload_type: &str,
        total_bytes: i64,
        vcpus: i64,
        memory_mib: i64,
    ) {
        self.workloads_running
            .with_label_values(&[namespace, workload_type])
            .sub(1);
        self.deployed_bytes
            .with_label_values(&[namespace])
            .sub(total_bytes);
        self.allocated_vcpus
            .with_label_values(&[namespace])
            .sub(vcpus);
        self.allocated_memory_mib
            .with_label_values(&[namespace])
            .sub(memory_mib);
    }

    pub fn trigger_succeeded(&self, namespace: &str, workload_name: &str, runtime_nanos: i64) {
        self.function_triggers
            .with_label_values(&[namespace, workload_name])
            .inc();
        self.function_runtime_nanos
            .with_label_values(&[namespace, workload_name])
            .inc_by(runtime_nanos.max(0) as u64);
    }

    pub fn trigger_failed(&self, namespace: &str, workload_name: &str) {
        self.function_failed_triggers
            .with_label_values(&[namespace, workload_name])
            .inc();
    }

    // Read-side accessors, used by tests and info summaries.

    pub fn running_vms(&self) -> i64 {
        self.vms_running.get()
    }

    pub fn running_workloads(&self, namespace: &str, workload_type: &str) -> i64 {
        self.workloads_running
            .with_label_values(&[namespace, workload_type])
            .get()
    }

    pub fn deployed_bytes_for(&self, namespace: &str) -> i64 {
        self.deployed_bytes.with_label_values(&[namespace]).get()
    }

    pub fn allocated_vcpus_for(&self, namespace: &str) -> i64 {
        self.allocated_vcpus.with_label_values(&[namespace]).get()
    }

    pub fn allocated_memory_for(&self, namespace: &str) -> i64 {
        self.allocated_memory_mib
            .with_label_values(&[namespace])
            .get()
    }

    pub fn successful_triggers(&self, namespace: &str, workload_name: &str) -> u64 {
        self.function_triggers
            .with_label_values(&[namespace, workload_name])
            .get()
    }

    pub fn failed_triggers(&self, namespace: &str, workload_name: &str) -> u64 {
        self.function_failed_triggers
            .with_label_values(&[namespace, workload_name])
            .get()
    }
}
