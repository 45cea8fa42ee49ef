use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// An event in a run's log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while executing a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        targets: Vec<RuleId>,
        nodes: usize,
        stale: usize,
    },
    RunCompleted {
        succeeded: bool,
        duration_ms: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Node lifecycle events
    NodeScheduled {
        rule: RuleId,
        reason: String,
    },
    NodeSkipped {
        rule: RuleId,
    },
    NodeStarted {
        rule: RuleId,
        attempt: u32,
    },
    NodeSucceeded {
        rule: RuleId,
        duration_ms: u64,
    },
    NodeFailed {
        rule: RuleId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    NodeBlocked {
        rule: RuleId,
        reason: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>>;
}

/// Discards every event
pub struct NullEventLog;

#[async_trait::async_trait]
impl EventLog for NullEventLog {
    async fn append(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn get_run_events(&self, _run_id: RunId) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

/// Keeps events in memory, mostly for tests
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

/// Appends events to a JSON Lines file, one object per line
pub struct JsonlEventLog {
    path: PathBuf,
    // Serializes appends from concurrent workers
    lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create event log directory")?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("Failed to open event log")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event log")?;

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read event log"),
        };

        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let event: Event = serde_json::from_str(line).context("Failed to parse event")?;
            if event.run_id == run_id {
                events.push(event);
            }
        }

        Ok(events)
    }
}
