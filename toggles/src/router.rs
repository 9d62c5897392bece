use std::collections::HashMap;
use std::future::ready;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::api::{BatchOutcome, DeletedFlag, FlagBatchRequest, FlagError, FlagSetRequest, FlagState};
use crate::identity::Actor;
use crate::mutation::MutationService;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::resolver::{EffectiveFlag, FlagResolver};

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<FlagResolver>,
    pub mutations: Arc<MutationService>,
}

async fn index() -> &'static str {
    "toggles"
}

async fn liveness() -> &'static str {
    "ok"
}

async fn list_flags(State(state): State<AppState>) -> Json<HashMap<String, bool>> {
    Json(state.resolver.resolve_all().await)
}

/// Reads never fail: unknown keys come back disabled with source `default`.
async fn get_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<EffectiveFlag> {
    Json(state.resolver.resolve(&key).await)
}

async fn toggle_flag(
    State(state): State<AppState>,
    actor: Actor,
    Path(key): Path<String>,
) -> Result<Json<FlagState>, FlagError> {
    state.mutations.toggle(&actor, &key).await.map(Json)
}

async fn set_flag(
    State(state): State<AppState>,
    actor: Actor,
    Path(key): Path<String>,
    Json(body): Json<FlagSetRequest>,
) -> Result<Json<FlagState>, FlagError> {
    state.mutations.set(&actor, &key, body.enabled).await.map(Json)
}

async fn batch_set_flags(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<FlagBatchRequest>,
) -> Result<Json<BatchOutcome>, FlagError> {
    state.mutations.batch_set(&actor, &body.updates).await.map(Json)
}

async fn delete_flag(
    State(state): State<AppState>,
    actor: Actor,
    Path(key): Path<String>,
) -> Result<Json<DeletedFlag>, FlagError> {
    state.mutations.delete_override(&actor, &key).await.map(Json)
}

pub fn router(
    resolver: Arc<FlagResolver>,
    mutations: Arc<MutationService>,
    metrics: bool,
) -> Router {
    let state = AppState {
        resolver,
        mutations,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/flags", get(list_flags))
        .route("/flags/batch", post(batch_set_flags))
        .route(
            "/flags/:key",
            get(get_flag).put(set_flag).delete(delete_flag),
        )
        .route("/flags/:key/toggle", post(toggle_flag))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when the router is used as a library
    // (during tests etc) does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
