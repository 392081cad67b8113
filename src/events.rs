use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::config::EVENT_BUFFER_SIZE;
use crate::error::{ErrorKind, SyncError};

#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub level: EventLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Poll,
    Command,
    Control,
    Session,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl EventLevel {
    fn severity(self) -> u8 {
        match self {
            EventLevel::Debug => 0,
            EventLevel::Info => 1,
            EventLevel::Warn => 2,
            EventLevel::Error => 3,
        }
    }

    pub fn at_least(self, min: EventLevel) -> bool {
        self.severity() >= min.severity()
    }
}

/// Viewer-side selection of events: one source, and a minimum level.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EventFilter {
    pub source: Option<EventSource>,
    #[serde(rename = "level")]
    pub min_level: Option<EventLevel>,
}

impl EventFilter {
    pub fn matches(&self, event: &SyncEvent) -> bool {
        self.source.is_none_or(|source| event.source == source)
            && self.min_level.is_none_or(|min| event.level.at_least(min))
    }
}

/// Bounded history of engine events plus a live feed for viewers.
pub struct EventLog {
    buffer: Arc<RwLock<VecDeque<SyncEvent>>>,
    sender: broadcast::Sender<SyncEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(EVENT_BUFFER_SIZE))),
            sender,
        }
    }

    pub async fn push(&self, event: SyncEvent) {
        let mut buf = self.buffer.write().await;
        if buf.len() >= EVENT_BUFFER_SIZE {
            buf.pop_front();
        }
        buf.push_back(event.clone());
        drop(buf);

        let _ = self.sender.send(event);
    }

    pub async fn history(&self) -> Vec<SyncEvent> {
        self.buffer.read().await.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub async fn emit(&self, source: EventSource, level: EventLevel, message: impl Into<String>) {
        self.push(SyncEvent {
            timestamp: Utc::now(),
            source,
            level,
            message: message.into(),
            error_kind: None,
        })
        .await;
    }

    /// Record a failure together with its error class.
    pub async fn emit_error(&self, source: EventSource, level: EventLevel, error: &SyncError) {
        self.push(SyncEvent {
            timestamp: Utc::now(),
            source,
            level,
            message: error.to_string(),
            error_kind: Some(error.kind()),
        })
        .await;
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
