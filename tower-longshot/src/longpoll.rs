use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use longshot_poll::Change;
use longshot_poll::Snapshot;
use longshot_poll::parse_last_seen;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Clone, Debug)]
pub(crate) struct LongPollMetrics {
    resolved: Counter<u64>,
    timed_out: Counter<u64>,
}

impl LongPollMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("long_poll");
        Self {
            resolved: meter.u64_counter("resolved").build(),
            timed_out: meter.u64_counter("timed_out").build(),
        }
    }
}

/// A scored event as clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub score: i64,
    pub updated_at: u64,
}

impl From<Snapshot<i64>> for Item {
    fn from(snapshot: Snapshot<i64>) -> Self {
        Self {
            id: snapshot.id,
            score: snapshot.value,
            updated_at: snapshot.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusQuery {
    #[serde(rename = "eventId")]
    event_id: Option<String>,
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScoreUpdate {
    score: i64,
}

fn item(item: Item) -> Json<Value> {
    Json(json!({ "success": true, "data": { "item": item } }))
}

/// `GET /status?eventId=..&last_updated=..`
///
/// Answers as soon as the event is newer than `last_updated`, holding the request open
/// for up to the configured timeout otherwise.
pub(crate) async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(event_id) = query.event_id.filter(|id| !id.is_empty()) else {
        return Err(ApiError::InvalidArgument(
            "eventId query parameter is required".to_string(),
        ));
    };
    let Some(raw) = query.last_updated else {
        return Err(ApiError::InvalidArgument(
            "last_updated query parameter is required".to_string(),
        ));
    };
    let last_seen = parse_last_seen(&raw)?;

    let change = state
        .events
        .await_change(&event_id, last_seen, state.poll_timeout)
        .await?;

    match change {
        Change::Updated(snapshot) => {
            state.metrics.resolved.add(1, &[]);
            tracing::debug!(%event_id, updated_at = snapshot.updated_at, "status resolved");
            Ok(item(snapshot.into()))
        }
        Change::TimedOut => {
            state.metrics.timed_out.add(1, &[]);
            tracing::debug!(%event_id, "status timed out");
            Err(ApiError::Timeout)
        }
    }
}

/// `GET /events`, the initial page load.
pub(crate) async fn list_events(State(state): State<AppState>) -> Json<Value> {
    let items: Vec<Item> = state.events.snapshots().into_iter().map(Item::from).collect();
    Json(json!({ "success": true, "data": { "items": items } }))
}

/// `POST /events/{id}` with `{"score": n}`.
pub(crate) async fn update_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ScoreUpdate>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(update) = payload.map_err(|rejection| {
        ApiError::InvalidArgument(format!("invalid score update: {}", rejection.body_text()))
    })?;
    let snapshot = state.events.mutate(&id, update.score)?;
    tracing::info!(%id, score = update.score, "event updated by hand");
    Ok(item(snapshot.into()))
}
