//! Messaging-bus capability.
//!
//! The node never owns a concrete bus client; the surrounding runtime hands it
//! one. `Bus` is the narrow interface the core needs: publish, subscribe,
//! request–reply, and object-store access. Subjects are dot-separated tokens
//! with `*` (one token) and `>` (tail) wildcards.
//!
//! `MemoryBus` is an in-process implementation backing tests and dev mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Per-subscription mailbox depth before the publisher drops the message.
const SUBSCRIPTION_MAILBOX: usize = 256;

/// Message headers (flat string map, lowercase keys by convention).
pub type Headers = HashMap<String, String>;

/// A message delivered to a subscriber or returned from a request.
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,

    /// Reply inbox if the publisher expects a response.
    pub reply: Option<String>,

    /// Message headers.
    pub headers: Headers,

    /// Payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// A bare message with no reply inbox and no headers.
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload,
        }
    }
}

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No reply arrived within the request deadline.
    #[error("request timed out")]
    Timeout,

    /// The object-store bucket or key does not exist.
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// The remote store rejected our credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Object-store or transport I/O failure.
    #[error("bus storage error: {0}")]
    Storage(String),

    /// The bus connection is closed.
    #[error("bus connection closed")]
    Closed,
}

/// A stream of messages for one subject pattern.
///
/// Dropping the subscription stops delivery; the bus prunes the registration
/// on the next publish that fails to deliver.
pub struct Subscription {
    /// The pattern this subscription was created with.
    pub subject: String,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Receive the next message. `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// The messaging-bus capability handed in by the surrounding runtime.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Publish a fully-formed message (headers and reply inbox included).
    async fn publish_message(&self, msg: Message) -> Result<(), BusError>;

    /// Request–reply with a deadline.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Headers,
        timeout: Duration,
    ) -> Result<Message, BusError>;

    /// Subscribe to a subject pattern.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Object-store metadata probe; returns the object size.
    async fn object_info(
        &self,
        bucket: &str,
        key: &str,
        api_prefix: Option<&str>,
    ) -> Result<u64, BusError>;

    /// Object-store read.
    async fn object_get(
        &self,
        bucket: &str,
        key: &str,
        api_prefix: Option<&str>,
    ) -> Result<Bytes, BusError>;

    /// Object-store write; returns the stored size.
    async fn object_put(&self, bucket: &str, key: &str, payload: Bytes) -> Result<u64, BusError>;
}

/// Match a dot-token subject against a pattern with `*` / `>` wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// =============================================================================
// In-process bus
// =============================================================================

struct SubEntry {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct BusState {
    subs: Vec<SubEntry>,
    store: HashMap<String, HashMap<String, Bytes>>,
}

/// In-process bus with wildcard subjects, reply inboxes, and an in-memory
/// object store. Backs tests and dev mode.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    next_sub_id: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            next_sub_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn effective_bucket(bucket: &str, api_prefix: Option<&str>) -> String {
        match api_prefix {
            Some(prefix) => format!("{prefix}.{bucket}"),
            None => bucket.to_string(),
        }
    }

    async fn deliver(&self, msg: Message) {
        let targets: Vec<(u64, mpsc::Sender<Message>)> = {
            let state = self.state.lock().await;
            state
                .subs
                .iter()
                .filter(|s| subject_matches(&s.pattern, &msg.subject))
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            // Closed receivers are pruned; a full mailbox drops the message,
            // matching at-most-once bus semantics.
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        if !dead.is_empty() {
            let mut state = self.state.lock().await;
            state.subs.retain(|s| !dead.contains(&s.id));
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.deliver(Message::new(subject, payload)).await;
        Ok(())
    }

    async fn publish_message(&self, msg: Message) -> Result<(), BusError> {
        self.deliver(msg).await;
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Headers,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4());
        let mut sub = self.subscribe(&inbox).await?;

        self.deliver(Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            headers,
            payload,
        })
        .await;

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_MAILBOX);
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        state.subs.push(SubEntry {
            id,
            pattern: subject.to_string(),
            tx,
        });

        Ok(Subscription {
            subject: subject.to_string(),
            rx,
        })
    }

    async fn object_info(
        &self,
        bucket: &str,
        key: &str,
        api_prefix: Option<&str>,
    ) -> Result<u64, BusError> {
        let state = self.state.lock().await;
        state
            .store
            .get(&Self::effective_bucket(bucket, api_prefix))
            .and_then(|b| b.get(key))
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| BusError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn object_get(
        &self,
        bucket: &str,
        key: &str,
        api_prefix: Option<&str>,
    ) -> Result<Bytes, BusError> {
        let state = self.state.lock().await;
        state
            .store
            .get(&Self::effective_bucket(bucket, api_prefix))
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| BusError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn object_put(&self, bucket: &str, key: &str, payload: Bytes) -> Result<u64, BusError> {
        let size = payload.len() as u64;
        let mut state = self.state.lock().await;
        state
            .store
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), payload);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(subject_matches("a.>", "a.b.c"));
        assert!(subject_matches("agentint.*.events.*", "agentint.vm1.events.started"));

        assert!(!subject_matches("a.b", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
        assert!(!subject_matches("a.*.c", "a.b.d"));
        assert!(!subject_matches("b.>", "a.b.c"));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("events.*").await.unwrap();

        bus.publish("events.started", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.subject, "events.started");
        assert_eq!(&msg.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("svc.echo").await.unwrap();

        let responder = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let msg = sub.next().await.unwrap();
                let reply = msg.reply.clone().unwrap();
                bus.publish(&reply, msg.payload).await.unwrap();
            })
        };

        let resp = bus
            .request(
                "svc.echo",
                Bytes::from_static(b"ping"),
                Headers::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(&resp.payload[..], b"ping");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        let bus = MemoryBus::new();
        let err = bus
            .request(
                "nobody.home",
                Bytes::new(),
                Headers::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Timeout));
    }

    #[tokio::test]
    async fn test_object_store_round_trip() {
        let bus = MemoryBus::new();

        let missing = bus.object_info("bucket", "key", None).await;
        assert!(matches!(missing, Err(BusError::NotFound { .. })));

        bus.object_put("bucket", "key", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert_eq!(bus.object_info("bucket", "key", None).await.unwrap(), 3);
        assert_eq!(
            &bus.object_get("bucket", "key", None).await.unwrap()[..],
            b"abc"
        );
    }

    #[tokio::test]
    async fn test_api_prefix_scopes_buckets() {
        let bus = MemoryBus::new();
        bus.object_put("hub.bucket", "key", Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(bus.object_get("bucket", "key", None).await.is_err());
        assert!(bus.object_get("bucket", "key", Some("hub")).await.is_ok());
    }
}
