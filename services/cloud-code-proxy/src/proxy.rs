//! `/v1/messages` HTTP handler
//!
//! Translates an inbound Anthropic Messages request into an
//! [`cloud_code_executor::Executor::execute`] call and translates the
//! outcome back into an HTTP response. The executor owns retries,
//! fallback, and account selection (spec.md §4); this layer only speaks
//! HTTP (spec.md §7).

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use serde_json::Value;

use cloud_code_executor::{AnthropicRequest, ExecuteOutcome, Executor};

use crate::error::{Error, Result};
use crate::service::ServiceMetrics;

/// Shared state for the `/v1/messages` handler.
#[derive(Clone)]
pub struct MessagesState {
    pub executor: Arc<Executor>,
    pub fallback_enabled: bool,
    pub metrics: ServiceMetrics,
    /// Flips to cancelled on graceful shutdown so in-flight attempts give up
    /// the account retry loop instead of running out the full request
    /// timeout, bounding the drain window (spec.md §5).
    pub shutdown: cloud_code_executor::CancelSignal,
}

/// `POST /v1/messages`
pub async fn messages_handler(
    State(state): State<MessagesState>,
    Json(body): Json<Value>,
) -> Result<Response> {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    state.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
    let started_at = std::time::Instant::now();
    let result = run(&state, body).await;
    state.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);

    let status = match &result {
        Ok(response) => response.status().as_u16(),
        Err(err) => err.status().as_u16(),
    };
    crate::metrics::record_request(status, "POST", started_at.elapsed().as_secs_f64());

    if let Err(err) = &result {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_upstream_error(err.error_type());
    }
    result
}

async fn run(state: &MessagesState, body: Value) -> Result<Response> {
    if body.get("model").and_then(Value::as_str).is_none() {
        return Err(Error::InvalidRequest("missing \"model\" field".into()));
    }

    let request = AnthropicRequest::new(body);
    let outcome = state
        .executor
        .execute(request, state.fallback_enabled, state.shutdown.clone())
        .await?;

    Ok(match outcome {
        ExecuteOutcome::NonStreaming(value) => Json(value).into_response(),
        ExecuteOutcome::Streaming(events) => streaming_response(events),
    })
}

/// Renders a completed list of upstream events as a Server-Sent Events body.
/// The executor has already drained the upstream stream (spec.md §6); this
/// replays the buffered events to the client in one response so the
/// HTTP-layer concerns (framing, `Content-Type`) stay out of the core.
fn streaming_response(events: Vec<Value>) -> Response {
    let sse_events = events.into_iter().map(|event| {
        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message");
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, std::convert::Infallible>(Event::default().event(event_type).data(data))
    });

    Sse::new(stream::iter(sse_events))
        .keep_alive(KeepAlive::default())
        .into_response()
}
