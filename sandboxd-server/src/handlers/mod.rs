//! HTTP handlers for the box API.

pub mod boxes;
pub mod exec;
pub mod fs;
pub mod images;

use axum::body::Body;
use axum::http::HeaderMap;
use axum::http::header::ACCEPT;
use serde::de::DeserializeOwned;

use sandboxd_shared::constants::media;

use crate::error::ApiError;

/// Whether the caller asked for a newline-delimited JSON progress stream.
pub(crate) fn wants_ndjson(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains(media::NDJSON))
        .unwrap_or(false)
}

/// Upper bound on JSON request bodies.
const MAX_JSON_BODY: usize = 10 * 1024 * 1024;

/// Read and parse a JSON body, mapping malformed input to a 400 rather
/// than the extractor's default rejection.
pub(crate) async fn read_json<T: DeserializeOwned>(body: Body) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(body, MAX_JSON_BODY)
        .await
        .map_err(|e| ApiError::bad_request(format!("reading body: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::bad_request(format!("bad body: {}", e)))
}

/// Like [`read_json`] but an empty body parses as the default.
pub(crate) async fn read_json_or_default<T: DeserializeOwned + Default>(
    body: Body,
) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(body, MAX_JSON_BODY)
        .await
        .map_err(|e| ApiError::bad_request(format!("reading body: {}", e)))?;
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::bad_request(format!("bad body: {}", e)))
}
