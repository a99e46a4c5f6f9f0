use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::Stream;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::instrument;

use super::{
    guard::{settle, GuardController, GuardFrame, TracingNavigator},
    identity::IdentityState,
    policy::GuardRole,
    report::TracingReporter,
};
use crate::{auth::extractors::AuthUser, state::AppState};

const FRAME_BUFFER: usize = 16;

pub fn access_routes() -> Router<AppState> {
    Router::new()
        .route("/access/:role", get(access_decision))
        .route("/access/:role/events", get(access_events))
}

/// GET /access/:role: one read of the account record, one decision.
#[instrument(skip(state))]
pub async fn access_decision(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(role): Path<GuardRole>,
) -> Json<GuardFrame> {
    let read = state.feed.fetch(identity.id).await;
    Json(settle(role, read, &TracingReporter, OffsetDateTime::now_utc()))
}

/// GET /access/:role/events: SSE stream of guard frames for the caller.
///
/// The guard lives as long as the connection. The identity is signed out when
/// the access token expires.
#[instrument(skip(state))]
pub async fn access_events(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(role): Path<GuardRole>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let identities = IdentityState::new();
    let expires_at = identity.expires_at;
    identities.sign_in(identity);
    if let Some(deadline) = expires_at {
        identities.expire_at(deadline);
    }

    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    let controller = GuardController::new(role, state.feed.clone(), Arc::new(TracingReporter));
    let watch = identities.subscribe();
    tokio::spawn(async move {
        controller.run(watch, Arc::new(TracingNavigator), tx).await;
        identities.teardown();
    });

    let stream = ReceiverStream::new(rx).map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_default();
        Ok(Event::default().event("guard").data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
