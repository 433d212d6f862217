//! Command execution handlers: non-interactive, interactive (hijacked
//! upgraded connection), and run-code.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use sandboxd::backend::types::{
    ExecOutput, ExecParams, InteractiveExecParams, RunCodeParams, StreamMode,
};
use sandboxd_shared::constants::media;

use super::read_json;
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

/// Content negotiation for the command endpoint.
///
/// Absent (or wildcard) Accept defaults to the multiplexed stream; any
/// other media type is refused with 406.
fn negotiate_stream_mode(headers: &HeaderMap) -> Result<StreamMode, Response> {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .trim();
    if accept.is_empty() || accept == "*/*" || accept.starts_with(media::MULTIPLEXED_STREAM) {
        return Ok(StreamMode::Multiplexed);
    }
    if accept.starts_with(media::RAW_STREAM) {
        return Ok(StreamMode::Raw);
    }
    Err((
        StatusCode::NOT_ACCEPTABLE,
        Json(serde_json::json!({
            "error": format!(
                "accept must be {} or {}",
                media::RAW_STREAM,
                media::MULTIPLEXED_STREAM
            )
        })),
    )
        .into_response())
}

/// `Upgrade: tcp` + `Connection: Upgrade` requests a hijacked stream.
fn wants_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_tcp = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("tcp"))
        .unwrap_or(false);
    connection_upgrade && upgrade_tcp
}

pub async fn commands(
    State(service): State<AppState>,
    Path(id): Path<String>,
    mut req: Request,
) -> Response {
    let mode = match negotiate_stream_mode(req.headers()) {
        Ok(mode) => mode,
        Err(response) => return response,
    };
    let upgrade_requested = wants_upgrade(req.headers());
    let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();

    let params: ExecParams = match read_json(req.into_body()).await {
        Ok(params) => params,
        Err(e) => return e.into_response(),
    };
    if params.commands.is_empty() {
        return ApiError::bad_request("commands must not be empty").into_response();
    }

    if upgrade_requested {
        let Some(on_upgrade) = on_upgrade else {
            return ApiError::bad_request("connection cannot be upgraded").into_response();
        };
        let interactive = InteractiveExecParams {
            commands: params.commands,
            envs: params.envs,
            working_dir: params.working_dir,
            mode,
        };

        // After the 101 is flushed the connection is a full-duplex pipe;
        // errors from here on are logged, never written as HTTP.
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(box_id = %id, error = %e, "connection upgrade failed");
                    return;
                }
            };
            let io = TokioIo::new(upgraded);
            match service
                .exec_interactive(&id, interactive, Box::new(io))
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(box_id = %id, exit_code = outcome.exit_code, "interactive exec finished");
                }
                Err(e) => {
                    tracing::warn!(box_id = %id, error = %e, "interactive exec failed");
                }
            }
        });

        return (
            StatusCode::SWITCHING_PROTOCOLS,
            [
                (CONNECTION, "Upgrade"),
                (UPGRADE, "tcp"),
                (CONTENT_TYPE, mode.content_type()),
            ],
            Body::empty(),
        )
            .into_response();
    }

    // No upgrade: run the command to completion and return the collected
    // result.
    match service.exec(&id, params).await {
        Ok(output) => Json(output).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

pub async fn run_code(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: Body,
) -> ApiResult<Json<ExecOutput>> {
    let params: RunCodeParams = read_json(body).await?;
    Ok(Json(service.run_code(&id, params).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_accept(accept: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(
                axum::http::header::ACCEPT,
                HeaderValue::from_str(accept).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_negotiation_defaults_to_multiplexed() {
        let mode = negotiate_stream_mode(&headers_with_accept(None)).unwrap();
        assert_eq!(mode, StreamMode::Multiplexed);
        let mode = negotiate_stream_mode(&headers_with_accept(Some("*/*"))).unwrap();
        assert_eq!(mode, StreamMode::Multiplexed);
    }

    #[test]
    fn test_negotiation_picks_requested_mode() {
        let mode =
            negotiate_stream_mode(&headers_with_accept(Some(media::RAW_STREAM))).unwrap();
        assert_eq!(mode, StreamMode::Raw);
        let mode =
            negotiate_stream_mode(&headers_with_accept(Some(media::MULTIPLEXED_STREAM))).unwrap();
        assert_eq!(mode, StreamMode::Multiplexed);
    }

    #[test]
    fn test_negotiation_rejects_unknown_media_type() {
        let result = negotiate_stream_mode(&headers_with_accept(Some("text/html")));
        assert!(result.is_err());
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("tcp"));
        assert!(wants_upgrade(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("tcp"));
        assert!(!wants_upgrade(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!wants_upgrade(&headers));
    }
}
