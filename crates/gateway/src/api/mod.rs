pub mod auth;
pub mod conversations;
pub mod envelope;
pub mod events;
pub mod health;
pub mod interactive;
pub mod payload;
pub mod tools;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes split into **public** (health probe) and **protected** (gated
/// behind the bearer-token middleware, which also attaches the caller
/// identity).
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/v1/api/health", get(health::health));

    let protected = Router::new()
        // Conversations
        .route("/v1/api/conversations", post(conversations::create))
        .route("/v1/api/conversations", get(conversations::list))
        .route("/v1/api/conversations/:id", delete(conversations::delete))
        .route(
            "/v1/api/conversations/:id/archive",
            post(conversations::archive),
        )
        .route(
            "/v1/api/conversations/:id/messages",
            post(conversations::post_message),
        )
        .route(
            "/v1/api/conversations/:id/messages",
            get(conversations::get_messages),
        )
        .route("/v1/api/conversations/:id/events", get(events::events))
        .route(
            "/v1/api/conversations/:id/terminate",
            post(conversations::terminate),
        )
        // Interactive resolvers
        .route(
            "/v1/api/elicitation/:msg_id",
            post(interactive::resolve_elicitation),
        )
        .route(
            "/v1/api/approval/:msg_id",
            post(interactive::resolve_approval),
        )
        .route("/v1/api/pending", get(interactive::list_pending))
        // Payloads
        .route("/v1/api/payload/:id", get(payload::get_payload))
        // Tool catalog
        .route("/v1/api/tools", get(tools::list_tools))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_token,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
