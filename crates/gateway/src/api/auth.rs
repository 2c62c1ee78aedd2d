//! API authentication middleware.
//!
//! The env var named by `config.server.api_token_env` is read **once at
//! startup** and its SHA-256 digest cached in `AppState`.
//! - When set, every protected request must carry `Authorization: Bearer
//!   <token>`.
//! - When unset, the server logs a warning once and allows
//!   unauthenticated access (dev mode).
//!
//! The middleware attaches an [`Identity`] to the request either way; a
//! present bearer travels with the turn into every tool-proxy call, and
//! absent credentials yield the anonymous identity.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use pv_domain::error::Error;

use crate::api::envelope::error_response;
use crate::state::{AppState, Identity};

pub async fn require_api_token(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned);

    if let Some(expected_hash) = &state.api_token_hash {
        // Hash to fixed length, compare in constant time.
        let provided_hash = Sha256::digest(provided.as_deref().unwrap_or("").as_bytes());
        if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
            return error_response(&Error::Unauthorized(
                "invalid or missing API token".into(),
            ));
        }
    }

    let identity = match provided {
        Some(token) => Identity::bearer(token),
        None => Identity::anonymous(),
    };
    req.extensions_mut().insert(identity);

    next.run(req).await
}
