//! # Event bus
//!
//! Internal notifications for lifecycle, peer, and storage activity.
//! Subscribers register a callback per named event kind; emission is
//! synchronous and FIFO, after the state change that caused the event, and
//! never reordered relative to one subscriber.
//!
//! Handlers run on the emitting task, so they must be cheap and must not
//! block. Anything heavier should forward into its own channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::identity::NodeId;

/// Names for subscription. `NodeEvent::kind` maps every event here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Stopped,
    Error,
    PeerConnect,
    PeerDisconnect,
    MessageReceived,
    MessageSent,
    Stored,
    Retrieved,
    Deleted,
    Replicated,
    ReplicationFailed,
    ContentPublished,
    VersionCreated,
}

/// Events emitted by the node and its subsystems.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum NodeEvent {
    Started { node_id: NodeId },
    Stopped { node_id: NodeId },
    Error { message: String },
    PeerConnect { peer_id: NodeId },
    PeerDisconnect { peer_id: NodeId },
    MessageReceived { from: NodeId, dht_type: String },
    MessageSent { to: NodeId, dht_type: String },
    Stored { id: String, size: u64, provider: String },
    Retrieved { id: String, size: u64, provider: String },
    Deleted { id: String },
    Replicated { id: String, provider: String },
    ReplicationFailed { id: String, provider: String, error: String },
    ContentPublished { id: String, size: u64, chunks: usize },
    VersionCreated { id: String, version: String },
}

impl NodeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NodeEvent::Started { .. } => EventKind::Started,
            NodeEvent::Stopped { .. } => EventKind::Stopped,
            NodeEvent::Error { .. } => EventKind::Error,
            NodeEvent::PeerConnect { .. } => EventKind::PeerConnect,
            NodeEvent::PeerDisconnect { .. } => EventKind::PeerDisconnect,
            NodeEvent::MessageReceived { .. } => EventKind::MessageReceived,
            NodeEvent::MessageSent { .. } => EventKind::MessageSent,
            NodeEvent::Stored { .. } => EventKind::Stored,
            NodeEvent::Retrieved { .. } => EventKind::Retrieved,
            NodeEvent::Deleted { .. } => EventKind::Deleted,
            NodeEvent::Replicated { .. } => EventKind::Replicated,
            NodeEvent::ReplicationFailed { .. } => EventKind::ReplicationFailed,
            NodeEvent::ContentPublished { .. } => EventKind::ContentPublished,
            NodeEvent::VersionCreated { .. } => EventKind::VersionCreated,
        }
    }
}

type Handler = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// Cheap to clone; all clones share the subscription lists.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<EventKind, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Handlers fire in
    /// subscription order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Deliver an event to its subscribers, synchronously, FIFO.
    pub fn emit(&self, event: NodeEvent) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subs.get(&event.kind()).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}
