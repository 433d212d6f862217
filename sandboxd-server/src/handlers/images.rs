//! Image update handler: synchronous report or streamed progress.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use sandboxd::backend::types::ImageUpdateParams;

use super::{read_json_or_default, wants_ndjson};
use crate::error::ApiResult;
use crate::progress::progress_stream_response;
use crate::routes::AppState;

pub async fn update(
    State(service): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let params: ImageUpdateParams = read_json_or_default(body).await?;

    if wants_ndjson(&headers) {
        let service = Arc::clone(&service);
        return Ok(progress_stream_response(StatusCode::OK, move |progress| {
            async move { service.update_image(params, Some(progress)).await }
        }));
    }

    let report = service.update_image(params, None).await?;
    Ok(Json(report).into_response())
}
