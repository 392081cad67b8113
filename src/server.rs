use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::client::ReportApi;
use crate::dispatcher::CommandDispatcher;
use crate::routes::{control, events, health, report};
use crate::state::SharedState;

/// State shared by every view-server handler.
pub struct AppState<A> {
    pub state: SharedState,
    pub dispatcher: Arc<CommandDispatcher<A>>,
}

impl<A> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<A: ReportApi> AppState<A> {
    pub fn new(api: Arc<A>, state: SharedState) -> Self {
        let dispatcher = Arc::new(CommandDispatcher::new(api, state.clone()));
        Self { state, dispatcher }
    }
}

pub fn build_router<A: ReportApi>(app: AppState<A>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health::health::<A>))
        // Report tree and entry commands
        .route("/report", get(report::get_report::<A>))
        .route("/report/reset", post(report::reset_report::<A>))
        .route("/entries/command", post(report::command::<A>))
        .route("/entries/env", post(report::env_ctrl::<A>))
        // Session control
        .route("/control/reload", post(control::reload::<A>))
        .route("/control/abort", post(control::abort::<A>))
        .route(
            "/control/stop-environments",
            post(control::stop_environments::<A>),
        )
        // Events
        .route("/events/history", get(events::event_history::<A>))
        .route("/events/stream", get(events::event_stream::<A>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app)
}
