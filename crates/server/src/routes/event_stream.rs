use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use db::models::progress_event::ProgressEvent;
use deployment::Deployment;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Resume after this sequence number. `Last-Event-ID` wins when both are set.
    pub after: Option<i64>,
}

fn resume_point(headers: &HeaderMap, query: &StreamQuery) -> Option<i64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .or(query.after)
}

/// One SSE frame per progress event: `event` is the event type, `id` the
/// sequence number, and the data `{type, data, timestamp}`.
fn to_sse_event(event: &ProgressEvent) -> Event {
    let frame = json!({
        "type": event.event_type,
        "data": event.payload,
        "timestamp": event.created_at,
    });
    Event::default()
        .event(event.event_type.to_string())
        .id(event.seq.to_string())
        .data(frame.to_string())
}

/// Live progress for one task. The stream closes after the terminal event.
pub async fn stream_task_events(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let after = resume_point(&headers, &query);
    tracing::debug!("[PROGRESS] SSE subscriber for task {} (after {:?})", task_id, after);

    let events = deployment.progress().subscribe(task_id, after).await?;
    let stream = events.map(|event| Ok::<_, Infallible>(to_sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
