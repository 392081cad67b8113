use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::client::{ControlCall, ReportApi};
use crate::error::{ErrorKind, SyncError};
use crate::events::{EventLevel, EventSource};
use crate::report::{Address, EnvStatus, FullNode, NodeFields, RuntimeStatus};
use crate::state::SharedState;

/// Requested change to an entry's own state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChanges {
    #[serde(default)]
    pub runtime_status: Option<RuntimeStatus>,
    #[serde(default)]
    pub env_status: Option<EnvStatus>,
}

impl FieldChanges {
    pub fn runtime(status: RuntimeStatus) -> Self {
        Self {
            runtime_status: Some(status),
            env_status: None,
        }
    }

    pub fn env(status: EnvStatus) -> Self {
        Self {
            runtime_status: None,
            env_status: Some(status),
        }
    }

    fn apply_to(&self, fields: &mut NodeFields) {
        if let Some(status) = &self.runtime_status {
            fields.runtime_status = Some(status.clone());
        }
        if let Some(status) = &self.env_status {
            fields.env_status = Some(status.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvAction {
    Start,
    Stop,
}

impl EnvAction {
    pub fn requested_status(&self) -> EnvStatus {
        match self {
            EnvAction::Start => EnvStatus::Starting,
            EnvAction::Stop => EnvStatus::Stopping,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvStopOutcome {
    pub uid: String,
    pub error: Option<String>,
}

/// Turns user actions into PUT requests and folds the server's answer
/// back into the tree. Nothing is applied before the server confirms.
pub struct CommandDispatcher<A> {
    api: Arc<A>,
    state: SharedState,
}

impl<A> Clone for CommandDispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            state: self.state.clone(),
        }
    }
}

impl<A: ReportApi> CommandDispatcher<A> {
    pub fn new(api: Arc<A>, state: SharedState) -> Self {
        Self { api, state }
    }

    pub async fn apply_command(
        &self,
        node: &FullNode,
        changes: FieldChanges,
    ) -> Result<Arc<FullNode>, SyncError> {
        self.send_command(node, changes).await.map(|(tree, _)| tree)
    }

    /// Send the command and merge the reply, returning the new tree and
    /// the store revision that holds it.
    async fn send_command(
        &self,
        node: &FullNode,
        changes: FieldChanges,
    ) -> Result<(Arc<FullNode>, u64), SyncError> {
        if self.state.tree.is_ended().await {
            return Err(SyncError::SessionEnded);
        }

        let mut shallow = node.to_shallow();
        changes.apply_to(&mut shallow.fields);
        info!(path = ?shallow.fields.address().uids(), ?changes, "Sending command");

        let response = match self.api.put_entry(&shallow).await {
            Ok(response) => response,
            Err(e) => {
                self.report_failure(EventSource::Command, &e).await;
                return Err(e);
            }
        };

        match self.state.tree.apply_patch_at(&response).await {
            Ok(patched) => Ok(patched),
            Err(e) => {
                self.report_failure(EventSource::Command, &e).await;
                Err(e)
            }
        }
    }

    /// Look the entry up in the current tree, then apply `changes` to it.
    pub async fn command_at(
        &self,
        address: &Address,
        changes: FieldChanges,
    ) -> Result<Arc<FullNode>, SyncError> {
        let root = self.state.tree.current().await.ok_or(SyncError::NoReport)?;
        let node = root.find(address).ok_or_else(|| SyncError::PathNotFound {
            path: address.uids().to_vec(),
        })?;
        self.apply_command(node, changes).await
    }

    pub async fn run(&self, node: &FullNode) -> Result<Arc<FullNode>, SyncError> {
        self.apply_command(node, FieldChanges::runtime(RuntimeStatus::Running))
            .await
    }

    pub async fn reset(&self, node: &FullNode) -> Result<Arc<FullNode>, SyncError> {
        self.apply_command(node, FieldChanges::runtime(RuntimeStatus::Resetting))
            .await
    }

    pub async fn env_ctrl(
        &self,
        node: &FullNode,
        action: EnvAction,
    ) -> Result<Arc<FullNode>, SyncError> {
        self.apply_command(node, FieldChanges::env(action.requested_status()))
            .await
    }

    /// Put the whole report into `resetting`. The flag stays set until a
    /// poll started after the reset was merged sees the report settle.
    pub async fn reset_report(&self) -> Result<Arc<FullNode>, SyncError> {
        let root = self.state.tree.current().await.ok_or(SyncError::NoReport)?;
        {
            let mut flags = self.state.control.write().await;
            if flags.any() {
                return Err(SyncError::Busy("reset the report"));
            }
            flags.resetting = true;
            flags.reset_revision = None;
        }

        let result = self
            .send_command(&root, FieldChanges::runtime(RuntimeStatus::Resetting))
            .await;
        let mut flags = self.state.control.write().await;
        match result {
            Ok((tree, revision)) => {
                flags.reset_revision = Some(revision);
                Ok(tree)
            }
            Err(e) => {
                flags.resetting = false;
                flags.reset_revision = None;
                Err(e)
            }
        }
    }

    pub async fn reload_code(&self) -> Result<(), SyncError> {
        {
            let mut flags = self.state.control.write().await;
            if flags.any() {
                return Err(SyncError::Busy("reload test code"));
            }
            flags.reloading = true;
        }

        info!("Requesting code reload");
        let result = self.api.control(ControlCall::Reload).await;
        self.state.control.write().await.reloading = false;

        match &result {
            Ok(()) => {
                self.state
                    .events
                    .emit(EventSource::Control, EventLevel::Info, "Test code reloaded")
                    .await;
            }
            Err(e) => self.report_failure(EventSource::Control, e).await,
        }
        result
    }

    /// Terminate the remote session. Once the server confirms, the tree
    /// is frozen and polling stops.
    pub async fn abort(&self) -> Result<(), SyncError> {
        {
            let mut flags = self.state.control.write().await;
            if flags.aborting {
                return Err(SyncError::Busy("abort"));
            }
            flags.aborting = true;
        }

        info!("Requesting session abort");
        match self.api.control(ControlCall::Abort).await {
            Ok(()) => {
                self.state.tree.end_session().await;
                self.state
                    .events
                    .emit(EventSource::Session, EventLevel::Info, "Session aborted")
                    .await;
                Ok(())
            }
            Err(e) => {
                self.state.control.write().await.aborting = false;
                self.report_failure(EventSource::Control, &e).await;
                Err(e)
            }
        }
    }

    /// Ask every top-level test with a started environment to stop it.
    pub async fn stop_all_environments(&self) -> Result<Vec<EnvStopOutcome>, SyncError> {
        let root = self.state.tree.current().await.ok_or(SyncError::NoReport)?;
        let started = root
            .entries
            .iter()
            .filter(|test| test.fields.env_status == Some(EnvStatus::Started));

        let outcomes = join_all(started.map(|test| async move {
            let result = self.env_ctrl(test, EnvAction::Stop).await;
            EnvStopOutcome {
                uid: test.uid().to_string(),
                error: result.err().map(|e| e.to_string()),
            }
        }))
        .await;
        Ok(outcomes)
    }

    async fn report_failure(&self, source: EventSource, err: &SyncError) {
        match err.kind() {
            ErrorKind::Protocol => warn!("Report structure drifted: {}", err),
            _ => error!("{:?} failed: {}", source, err),
        }
        self.state
            .events
            .emit_error(source, EventLevel::Error, err)
            .await;
    }
}
