//! Box CRUD, lifecycle, and reclaim handlers.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use sandboxd::backend::types::{BoxFilter, BoxInfo, CreateBoxParams};
use sandboxd::service::ReclaimReport;
use sandboxd_shared::SandboxError;

use super::{read_json_or_default, wants_ndjson};
use crate::error::{ApiError, ApiResult};
use crate::progress::progress_stream_response;
use crate::routes::AppState;

/// Minimal percent-decoder for query values (`%XX` and `+`).
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse repeated `filter=` query terms.
fn parse_filters(query: &str) -> Result<Vec<BoxFilter>, ApiError> {
    let mut filters = Vec::new();
    for pair in query.split('&').filter(|s| !s.is_empty()) {
        if let Some(value) = pair.strip_prefix("filter=") {
            let filter = BoxFilter::parse(&percent_decode(value)).map_err(ApiError::from)?;
            filters.push(filter);
        }
    }
    Ok(filters)
}

pub async fn list(
    State(service): State<AppState>,
    RawQuery(query): RawQuery,
) -> ApiResult<Json<Vec<BoxInfo>>> {
    let filters = parse_filters(query.as_deref().unwrap_or(""))?;
    Ok(Json(service.list(&filters).await?))
}

pub async fn get(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BoxInfo>> {
    Ok(Json(service.get(&id).await?))
}

pub async fn create_linux(
    State(service): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let params: CreateBoxParams = read_json_or_default(body).await?;

    if wants_ndjson(&headers) {
        let service = Arc::clone(&service);
        return Ok(progress_stream_response(
            StatusCode::ACCEPTED,
            move |progress| async move { service.create(params, Some(progress)).await },
        ));
    }

    let info = service.create(params, None).await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

pub async fn create_android() -> ApiError {
    ApiError(SandboxError::Unsupported(
        "android boxes are not implemented".into(),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteBody {
    #[serde(default)]
    force: bool,
}

pub async fn delete(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: Body,
) -> ApiResult<Json<serde_json::Value>> {
    let params: DeleteBody = read_json_or_default(body).await?;
    service.delete(&id, params.force).await?;
    Ok(Json(json!({ "message": format!("box {} deleted", id) })))
}

pub async fn delete_all(
    State(service): State<AppState>,
    body: Body,
) -> ApiResult<Json<serde_json::Value>> {
    let params: DeleteBody = read_json_or_default(body).await?;
    let deleted = service.delete_all(params.force).await?;
    Ok(Json(json!({
        "message": format!("deleted {} boxes", deleted.len()),
        "deleted": deleted,
    })))
}

pub async fn start(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BoxInfo>> {
    Ok(Json(service.start(&id).await?))
}

pub async fn stop(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BoxInfo>> {
    Ok(Json(service.stop(&id).await?))
}

pub async fn reclaim(State(service): State<AppState>) -> ApiResult<Json<ReclaimReport>> {
    Ok(Json(service.reclaim().await?))
}

pub async fn external_port(
    State(service): State<AppState>,
    Path((id, port)): Path<(String, u16)>,
) -> ApiResult<Json<serde_json::Value>> {
    let external = service.get_external_port(&id, port).await?;
    Ok(Json(json!({ "externalPort": external })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("a%3Db"), "a=b");
        assert_eq!(percent_decode("one+two"), "one two");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }

    #[test]
    fn test_parse_filters() {
        let filters = parse_filters("filter=id%3Dabc&filter=label%3Dteam%3Dinfra").unwrap();
        assert_eq!(
            filters,
            vec![
                BoxFilter::Id("abc".into()),
                BoxFilter::LabelKeyValue("team".into(), "infra".into())
            ]
        );
        assert!(parse_filters("filter=bogus").is_err());
        assert!(parse_filters("unrelated=1").unwrap().is_empty());
    }
}
