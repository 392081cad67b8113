use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::client::ReportApi;
use crate::server::AppState;
use crate::state::{ControlFlags, PollPhase, PollStatus, SharedState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
    pub demo: bool,
    pub poll: PollStatus,
    pub control: ControlFlags,
    pub revision: u64,
    pub has_report: bool,
    pub session_ended: bool,
    pub version: String,
}

/// Overall status from the poll state. Pure so it can be tested directly.
pub fn determine_overall_status(
    session_ended: bool,
    has_report: bool,
    consecutive_failures: u32,
    phase: PollPhase,
) -> &'static str {
    if session_ended || phase == PollPhase::Stopped {
        "ended"
    } else if consecutive_failures > 0 {
        "degraded"
    } else if has_report {
        "synced"
    } else {
        "connecting"
    }
}

pub async fn health<A: ReportApi>(State(app): State<AppState<A>>) -> Json<HealthResponse> {
    Json(build_health_response(&app.state).await)
}

pub async fn build_health_response(state: &SharedState) -> HealthResponse {
    let snapshot = state.tree.snapshot().await;
    let session_ended = state.tree.is_ended().await;
    let poll = state.poll.read().await.clone();
    let control = *state.control.read().await;
    let has_report = snapshot.root.is_some();

    HealthResponse {
        status: determine_overall_status(
            session_ended,
            has_report,
            poll.consecutive_failures,
            poll.phase,
        )
        .to_string(),
        backend: state.config.base_url.clone(),
        demo: state.config.demo,
        poll,
        control,
        revision: snapshot.revision,
        has_report,
        session_ended,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        assert_eq!(
            determine_overall_status(false, false, 0, PollPhase::Fetching),
            "connecting"
        );
        assert_eq!(
            determine_overall_status(false, true, 0, PollPhase::Idle),
            "synced"
        );
        assert_eq!(
            determine_overall_status(false, true, 2, PollPhase::Backoff),
            "degraded"
        );
        assert_eq!(
            determine_overall_status(true, true, 0, PollPhase::Idle),
            "ended"
        );
    }
}
