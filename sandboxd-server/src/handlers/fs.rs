//! Box filesystem handlers: list, read, write, and archive transfer.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::Method;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use sandboxd::backend::types::PathStat;
use sandboxd_shared::constants::{PATH_STAT_HEADER, media};

use super::read_json;
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub path: String,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct WriteBody {
    path: String,
    content: String,
}

pub async fn list(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let files = service.list_files(&id, &query.path, query.depth).await?;
    Ok(Json(json!({ "data": files })))
}

pub async fn read(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let content = service.read_file(&id, &query.path).await?;
    Ok(Json(json!({ "content": content })))
}

pub async fn write(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: Body,
) -> ApiResult<Json<serde_json::Value>> {
    let params: WriteBody = read_json(body).await?;
    service.write_file(&id, &params.path, &params.content).await?;
    Ok(Json(json!({ "message": format!("wrote {}", params.path) })))
}

fn archive_headers(stat: &PathStat) -> ApiResult<[(String, String); 2]> {
    let value = serde_json::to_string(stat)
        .map_err(|e| ApiError::from(sandboxd_shared::SandboxError::from(e)))?;
    Ok([
        (CONTENT_TYPE.to_string(), media::TAR.to_string()),
        (PATH_STAT_HEADER.to_string(), value),
    ])
}

/// GET returns the tar stream with the path stat header; HEAD returns
/// only the headers.
pub async fn archive(
    method: Method,
    State(service): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Response> {
    if method == Method::HEAD {
        let stat = service.head_archive(&id, &query.path).await?;
        return Ok((archive_headers(&stat)?, Body::empty()).into_response());
    }

    let (stat, stream) = service.get_archive(&id, &query.path).await?;
    let headers = archive_headers(&stat)?;
    Ok((headers, Body::from_stream(stream)).into_response())
}

pub async fn extract_archive(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
    body: axum::body::Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    service.extract_archive(&id, &query.path, body).await?;
    Ok(Json(json!({ "message": format!("extracted into {}", query.path) })))
}
