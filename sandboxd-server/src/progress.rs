//! Newline-delimited JSON progress streaming.
//!
//! Long operations (create, image update) can stream their progress as one
//! JSON object per line; the operation's final value, or an error record,
//! is the last line.

use std::convert::Infallible;
use std::future::Future;

use axum::body::Body;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use sandboxd::backend::types::{ProgressRecord, ProgressSender};
use sandboxd_shared::constants::media;
use sandboxd_shared::errors::SandboxResult;

fn json_line<T: serde::Serialize>(value: &T) -> Option<Bytes> {
    let mut line = serde_json::to_vec(value).ok()?;
    line.push(b'\n');
    Some(line.into())
}

/// Run `work` with a progress sink and stream the records to the client,
/// flushed per line. Record order is preserved; the final line is the
/// operation's result (or an error record).
pub fn progress_stream_response<T, Fut>(
    status: StatusCode,
    work: impl FnOnce(ProgressSender) -> Fut,
) -> Response
where
    T: serde::Serialize + Send + 'static,
    Fut: Future<Output = SandboxResult<T>> + Send + 'static,
{
    let (line_tx, line_rx) = mpsc::channel::<Bytes>(16);
    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressRecord>(16);
    let fut = work(progress_tx);

    let forward_tx = line_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(record) = progress_rx.recv().await {
            let Some(line) = json_line(&record) else {
                continue;
            };
            if forward_tx.send(line).await.is_err() {
                // Client went away; drain so the worker is not blocked.
                continue;
            }
        }
    });

    tokio::spawn(async move {
        let result = fut.await;
        // The work future owned the only progress sender, so the forwarder
        // has drained every record once it joins. This keeps the final
        // line last.
        let _ = forwarder.await;
        let line = match result {
            Ok(value) => json_line(&value),
            Err(e) => json_line(&ProgressRecord::error(e.to_string())),
        };
        if let Some(line) = line {
            let _ = line_tx.send(line).await;
        }
    });

    let body = Body::from_stream(ReceiverStream::new(line_rx).map(Ok::<_, Infallible>));
    (status, [(CONTENT_TYPE, media::NDJSON)], body).into_response()
}
