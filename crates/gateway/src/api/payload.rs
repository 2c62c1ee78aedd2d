//! Payload retrieval — JSON envelope, metadata-only, or raw byte stream.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use crate::api::envelope::{self, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PayloadQuery {
    #[serde(default)]
    pub raw: Option<u8>,
    #[serde(default)]
    pub meta: Option<u8>,
}

pub async fn get_payload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PayloadQuery>,
) -> ApiResult {
    if q.meta == Some(1) {
        let (record, _) = state.store.get_payload(&id)?;
        let mut v = serde_json::to_value(&record).unwrap_or(Value::Null);
        // The inline body is omitted from metadata responses.
        if let Some(obj) = v.as_object_mut() {
            obj.remove("inline");
        }
        return Ok(envelope::ok(v));
    }

    let (record, body) = state.store.get_payload(&id)?;

    if q.raw == Some(1) {
        return Ok(([(header::CONTENT_TYPE, record.mime.clone())], body).into_response());
    }

    Ok(envelope::ok(serde_json::json!({
        "id": record.id,
        "mime": record.mime,
        "size": record.size,
        "createdAt": record.created_at,
        "content": base64::engine::general_purpose::STANDARD.encode(&body),
    })))
}
