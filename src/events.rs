// src/events.rs

use crate::models::DownloadProgress;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer size of the broadcast channel backing the bus.
const DEFAULT_BUS_CAPACITY: usize = 256;

/// Namespaces under which events are published on the shared bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventNamespace {
    Downloads,
}

/// Domain events surfaced to external subscribers (UI and friends).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    DownloadProgress(DownloadProgress),
}

/// An event together with the namespace it is published under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdkEvent {
    pub namespace: EventNamespace,
    pub event: Event,
}

impl SdkEvent {
    pub fn downloads(event: Event) -> Self {
        Self {
            namespace: EventNamespace::Downloads,
            event,
        }
    }
}

/// Fire-and-forget event bus over `tokio::sync::broadcast`.
///
/// Emitting with no live subscribers is not an error; events are simply
/// dropped. Slow subscribers miss the oldest events when the buffer
/// overflows.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SdkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: SdkEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Interaction kind recorded with telemetry events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InteractType {
    Other,
}

/// Fine-grained interaction sub-type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InteractSubType {
    ContentDownloadInitiate,
    ContentDownloadSuccess,
    ContentDownloadCancel,
}

/// Kind of object an interaction refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ObjectType {
    Content,
}

/// A structured interaction event handed to the telemetry sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionEvent {
    pub interact_type: InteractType,
    pub sub_type: InteractSubType,
    pub env: String,
    pub page_id: String,
    pub object_id: String,
    pub object_type: ObjectType,
}

impl InteractionEvent {
    /// Builds a content-download interaction for the given identifier.
    pub fn content_download(sub_type: InteractSubType, object_id: &str) -> Self {
        Self {
            interact_type: InteractType::Other,
            sub_type,
            env: "sdk".to_string(),
            page_id: "ContentDetail".to_string(),
            object_id: object_id.to_string(),
            object_type: ObjectType::Content,
        }
    }
}
