use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::client::ReportApi;
use crate::events::{EventFilter, EventLevel, EventSource};
use crate::server::AppState;

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub source: Option<EventSource>,
    pub level: Option<EventLevel>,
}

impl HistoryQuery {
    fn filter(&self) -> EventFilter {
        EventFilter {
            source: self.source,
            min_level: self.level,
        }
    }
}

fn default_limit() -> usize {
    100
}

/// GET /events/history?source=poll&level=warn: most recent events first.
/// `level` keeps events at that level or more severe.
pub async fn event_history<A: ReportApi>(
    State(app): State<AppState<A>>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let events = app.state.events.history().await;
    let total = events.len();
    let filter = query.filter();
    let matched: Vec<_> = events
        .into_iter()
        .rev()
        .filter(|event| filter.matches(event))
        .collect();
    let matched_count = matched.len();
    let events: Vec<_> = matched.into_iter().take(query.limit).collect();

    Json(serde_json::json!({
        "events": events,
        "matched": matched_count,
        "total": total,
        "limit": query.limit,
    }))
}

/// GET /events/stream: SSE feed of engine events, filtered like the history.
pub async fn event_stream<A: ReportApi>(
    State(app): State<AppState<A>>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = app.state.events.subscribe();
    let stream = BroadcastStream::new(rx);

    let event_stream = stream.filter_map(move |result| match result {
        Ok(event) if !filter.matches(&event) => None,
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().event("sync").data(data)))
        }
        // Lagged receivers skip what they missed.
        Err(_) => None,
    });

    Sse::new(event_stream).keep_alive(KeepAlive::default())
}
