use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify, RwLock};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::EventLog;
use crate::patcher::{apply_shallow, rebase};
use crate::report::{FullNode, ShallowNode};

pub type SharedState = Arc<SyncState>;

pub struct SyncState {
    pub config: SyncConfig,
    pub tree: TreeStore,
    pub poll: RwLock<PollStatus>,
    pub control: RwLock<ControlFlags>,
    pub events: EventLog,
    /// Wakes the poll loop for an immediate refresh.
    pub refresh_notify: Notify,
}

impl SyncState {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            tree: TreeStore::new(),
            poll: RwLock::new(PollStatus::new()),
            control: RwLock::new(ControlFlags::default()),
            events: EventLog::new(),
            refresh_notify: Notify::new(),
        }
    }

    pub fn request_refresh(&self) {
        self.refresh_notify.notify_one();
    }
}

// --- Poll status ---

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Idle,
    Fetching,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub phase: PollPhase,
    pub cycles: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl PollStatus {
    pub fn new() -> Self {
        Self {
            phase: PollPhase::Idle,
            cycles: 0,
            consecutive_failures: 0,
            last_error: None,
            last_success_at: None,
        }
    }
}

impl Default for PollStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Control operations currently awaiting the server.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ControlFlags {
    pub resetting: bool,
    pub reloading: bool,
    pub aborting: bool,
    /// Tree revision at which the confirmed reset was merged. Only a poll
    /// started from this revision or later may release `resetting`.
    #[serde(skip)]
    pub reset_revision: Option<u64>,
}

impl ControlFlags {
    pub fn any(&self) -> bool {
        self.resetting || self.reloading || self.aborting
    }
}

// --- Tree store ---

/// A tree as seen at one point in time. `revision` increases with every
/// write to the store.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub root: Option<Arc<FullNode>>,
    pub revision: u64,
}

struct TreeSlot {
    root: Option<Arc<FullNode>>,
    revision: u64,
    ended: bool,
}

/// Owner of the report tree. Every write goes through this lock and reads
/// the latest tree before replacing it, so poll results and command
/// results never overwrite each other with a stale copy.
pub struct TreeStore {
    slot: Mutex<TreeSlot>,
    stop_tx: watch::Sender<bool>,
}

impl TreeStore {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            slot: Mutex::new(TreeSlot {
                root: None,
                revision: 0,
                ended: false,
            }),
            stop_tx,
        }
    }

    pub async fn snapshot(&self) -> TreeSnapshot {
        let slot = self.slot.lock().await;
        TreeSnapshot {
            root: slot.root.clone(),
            revision: slot.revision,
        }
    }

    pub async fn current(&self) -> Option<Arc<FullNode>> {
        self.slot.lock().await.root.clone()
    }

    /// Store a tree fetched starting from `base`. If commands were applied
    /// since `base` was taken, their effect is carried over.
    pub async fn commit_fetch(
        &self,
        base: &TreeSnapshot,
        fetched: Arc<FullNode>,
    ) -> Result<Arc<FullNode>, SyncError> {
        let mut slot = self.slot.lock().await;
        if slot.ended {
            return Err(SyncError::SessionEnded);
        }

        let merged = match (&base.root, &slot.root) {
            (Some(base_root), Some(current)) if slot.revision != base.revision => {
                rebase(&fetched, base_root, current)
            }
            _ => fetched,
        };

        if let Some(current) = &slot.root {
            if Arc::ptr_eq(current, &merged) {
                return Ok(merged);
            }
        }
        slot.root = Some(merged.clone());
        slot.revision += 1;
        Ok(merged)
    }

    /// Merge a shallow entry returned by the server into the current tree.
    pub async fn apply_patch(&self, update: &ShallowNode) -> Result<Arc<FullNode>, SyncError> {
        self.apply_patch_at(update).await.map(|(root, _)| root)
    }

    /// Like `apply_patch`, also returning the revision the patch created.
    pub async fn apply_patch_at(
        &self,
        update: &ShallowNode,
    ) -> Result<(Arc<FullNode>, u64), SyncError> {
        let mut slot = self.slot.lock().await;
        if slot.ended {
            return Err(SyncError::SessionEnded);
        }
        let root = slot.root.as_ref().ok_or(SyncError::NoReport)?;
        let patched = apply_shallow(root, update)?;
        slot.root = Some(patched.clone());
        slot.revision += 1;
        Ok((patched, slot.revision))
    }

    /// Refuse all further writes and tell the poll loop to stop.
    pub async fn end_session(&self) {
        let mut slot = self.slot.lock().await;
        slot.ended = true;
        self.stop_tx.send_replace(true);
    }

    pub async fn is_ended(&self) -> bool {
        self.slot.lock().await.ended
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }
}

impl Default for TreeStore {
    fn default() -> Self {
        Self::new()
    }
}
