//! Trigger-subject fan-in.
//!
//! For each trigger subject a deployment declares, the node subscribes on the
//! external bus and forwards inbound messages into the owning VM's agent.
//! Handlers for different VMs run independently; in-flight handlers are
//! awaited when a binding drains so stop observes them as completed.
//!
//! Each handler captures only the narrow context it needs (vm id, namespace,
//! workload identity, node key) plus shared channel handles, never the
//! manager itself.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::agent::AgentChannel;
use crate::bus::{Bus, Message, Subscription};
use crate::error::NodeError;
use crate::telemetry::Telemetry;
use nex_events::{
    event_types, events_subject, logs_subject, CloudEvent, EmittedLog, FunctionExecutionFailed,
    FunctionExecutionSucceeded, LogLevel,
};

/// Identity a trigger handler runs on behalf of.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub vmid: String,
    pub namespace: String,
    pub workload_name: String,
    pub workload_type: String,
    pub node_public_key: String,
}

/// A live subscription bound to a VM on behalf of its workload.
pub struct TriggerBinding {
    /// The external subject this binding listens on.
    pub subject: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TriggerBinding {
    /// Stop delivery and wait for in-flight handlers to finish.
    pub async fn drain(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(subject = %self.subject, error = %err, "Trigger consumer ended abnormally");
        }
    }
}

/// Subscribe a trigger subject and route its messages into the VM's agent.
pub async fn bind_trigger_subject(
    bus: Arc<dyn Bus>,
    agent: Arc<AgentChannel>,
    telemetry: Arc<Telemetry>,
    ctx: TriggerContext,
    subject: String,
    timeout: Duration,
) -> Result<TriggerBinding, NodeError> {
    let sub = bus
        .subscribe(&subject)
        .await
        .map_err(|e| NodeError::SubscribeFailed {
            subject: subject.clone(),
            reason: e.to_string(),
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_trigger_consumer(
        bus,
        agent,
        telemetry,
        ctx,
        sub,
        shutdown_rx,
        timeout,
    ));

    Ok(TriggerBinding {
        subject,
        shutdown: shutdown_tx,
        task,
    })
}

async fn run_trigger_consumer(
    bus: Arc<dyn Bus>,
    agent: Arc<AgentChannel>,
    telemetry: Arc<Telemetry>,
    ctx: TriggerContext,
    mut sub: Subscription,
    mut shutdown: watch::Receiver<bool>,
    timeout: Duration,
) {
    let mut inflight = JoinSet::new();

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
                inflight.spawn(handle_trigger(
                    Arc::clone(&bus),
                    Arc::clone(&agent),
                    Arc::clone(&telemetry),
                    ctx.clone(),
                    msg,
                    timeout,
                ));
            }
        }
    }

    // Drain: wait for handlers already dispatched.
    while inflight.join_next().await.is_some() {}
}

async fn handle_trigger(
    bus: Arc<dyn Bus>,
    agent: Arc<AgentChannel>,
    telemetry: Arc<Telemetry>,
    ctx: TriggerContext,
    msg: Message,
    timeout: Duration,
) {
    match agent
        .trigger(&ctx.vmid, &msg.subject, msg.payload.clone(), timeout)
        .await
    {
        Ok((result, runtime_ns)) => {
            debug!(
                vmid = %ctx.vmid,
                trigger_subject = %msg.subject,
                workload_type = %ctx.workload_type,
                function_run_time_nanosec = runtime_ns,
                payload_size = result.len(),
                "Received response from execution via trigger subject"
            );

            telemetry.trigger_succeeded(&ctx.namespace, &ctx.workload_name, runtime_ns);
            publish_function_succeeded(&bus, &ctx, &msg.subject, runtime_ns).await;

            if !result.is_empty() {
                if let Some(reply) = &msg.reply {
                    if let Err(err) = bus.publish(reply, result).await {
                        error!(
                            vmid = %ctx.vmid,
                            trigger_subject = %msg.subject,
                            error = %err,
                            "Failed to respond to trigger subject request"
                        );
                    }
                }
            }
        }

        Err(err) => {
            error!(
                error = %err,
                trigger_subject = %msg.subject,
                workload_type = %ctx.workload_type,
                vmid = %ctx.vmid,
                "Failed to request agent execution via internal trigger subject"
            );

            telemetry.trigger_failed(&ctx.namespace, &ctx.workload_name);
            publish_function_failed(&bus, &ctx, &msg.subject, &err).await;
        }
    }
}

async fn publish_function_succeeded(
    bus: &Arc<dyn Bus>,
    ctx: &TriggerContext,
    trigger_subject: &str,
    elapsed_nanos: i64,
) {
    let event = CloudEvent::new(
        ctx.node_public_key.clone(),
        event_types::FUNCTION_EXECUTION_SUCCEEDED,
        FunctionExecutionSucceeded {
            name: ctx.workload_name.clone(),
            subject: trigger_subject.to_string(),
            elapsed: elapsed_nanos,
            namespace: ctx.namespace.clone(),
        },
    );
    publish_event(bus, &ctx.namespace, &event).await;

    let log = EmittedLog {
        text: format!(
            "Function {} execution succeeded ({}ns)",
            ctx.workload_name, elapsed_nanos
        ),
        level: LogLevel::Debug,
        machine_id: ctx.vmid.clone(),
    };
    publish_emitted_log(bus, ctx, &log).await;
}

async fn publish_function_failed(
    bus: &Arc<dyn Bus>,
    ctx: &TriggerContext,
    trigger_subject: &str,
    err: &NodeError,
) {
    let event = CloudEvent::new(
        ctx.node_public_key.clone(),
        event_types::FUNCTION_EXECUTION_FAILED,
        FunctionExecutionFailed {
            name: ctx.workload_name.clone(),
            subject: trigger_subject.to_string(),
            namespace: ctx.namespace.clone(),
            error: err.to_string(),
        },
    );
    publish_event(bus, &ctx.namespace, &event).await;

    let log = EmittedLog {
        text: "Function execution failed".to_string(),
        level: LogLevel::Error,
        machine_id: ctx.vmid.clone(),
    };
    publish_emitted_log(bus, ctx, &log).await;
}

async fn publish_event<P: serde::Serialize>(
    bus: &Arc<dyn Bus>,
    namespace: &str,
    event: &CloudEvent<P>,
) {
    let payload = match serde_json::to_vec(event) {
        Ok(p) => p,
        Err(err) => {
            error!(error = %err, "Failed to serialize cloud event");
            return;
        }
    };

    if let Err(err) = bus.publish(&events_subject(namespace), Bytes::from(payload)).await {
        error!(error = %err, "Failed to publish cloud event");
    }
}

async fn publish_emitted_log(bus: &Arc<dyn Bus>, ctx: &TriggerContext, log: &EmittedLog) {
    let payload = match serde_json::to_vec(log) {
        Ok(p) => p,
        Err(err) => {
            error!(error = %err, "Failed to serialize emitted log");
            return;
        }
    };

    let subject = logs_subject(
        &ctx.namespace,
        &ctx.node_public_key,
        &ctx.workload_name,
        &ctx.vmid,
    );
    if let Err(err) = bus.publish(&subject, Bytes::from(payload)).await {
        error!(error = %err, "Failed to publish emitted log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentChannel, RUNTIME_NS_HEADER};
    use crate::bus::{Headers, MemoryBus};

    fn test_ctx(vmid: &str) -> TriggerContext {
        TriggerContext {
            vmid: vmid.to_string(),
            namespace: "ns1".to_string(),
            workload_name: "echo".to_string(),
            workload_type: "v8".to_string(),
            node_public_key: "NODEKEY".to_string(),
        }
    }

    /// Fake agent that echoes trigger payloads back with a runtime header.
    async fn spawn_echo_agent(internal: Arc<MemoryBus>, vmid: &str) {
        let subject = crate::agent::trigger_subject(vmid);
        let mut sub = internal.subscribe(&subject).await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let mut headers = Headers::new();
                headers.insert(RUNTIME_NS_HEADER.to_string(), "1000".to_string());
                internal
                    .publish_message(Message {
                        subject: msg.reply.unwrap(),
                        reply: None,
                        headers,
                        payload: msg.payload,
                    })
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_trigger_round_trip_and_telemetry() {
        let external: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let internal: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let agent = AgentChannel::new(internal.clone(), external.clone(), "NODEKEY");
        let telemetry = Arc::new(Telemetry::new().unwrap());

        spawn_echo_agent(internal.clone(), "vm_1").await;

        let binding = bind_trigger_subject(
            external.clone(),
            agent,
            telemetry.clone(),
            test_ctx("vm_1"),
            "a.b".to_string(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let reply = external
            .request(
                "a.b",
                Bytes::from_static(b"payload"),
                Headers::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], b"payload");

        // Telemetry updated on the success path.
        assert_eq!(telemetry.successful_triggers("ns1", "echo"), 1);
        assert_eq!(telemetry.failed_triggers("ns1", "echo"), 0);

        binding.drain().await;
    }

    #[tokio::test]
    async fn test_trigger_failure_publishes_failure_event() {
        let external: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let internal: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let agent = AgentChannel::new(internal.clone(), external.clone(), "NODEKEY");
        let telemetry = Arc::new(Telemetry::new().unwrap());

        // No agent responder: the forwarded trigger times out.
        let binding = bind_trigger_subject(
            external.clone(),
            agent,
            telemetry.clone(),
            test_ctx("vm_dead"),
            "a.b".to_string(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let mut events = external.subscribe("$NEX.events.ns1").await.unwrap();
        external
            .publish("a.b", Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(value["type"], event_types::FUNCTION_EXECUTION_FAILED);
        assert_eq!(value["data"]["workload_name"], "echo");

        assert_eq!(telemetry.failed_triggers("ns1", "echo"), 1);
        binding.drain().await;
    }
}
