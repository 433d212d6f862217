//! Router assembly and middleware.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sandboxd::service::BoxService;

use crate::handlers::{boxes, exec, fs, images};

pub type AppState = Arc<BoxService>;

pub fn router(service: AppState) -> Router {
    let api = Router::new()
        .route("/boxes", get(boxes::list).delete(boxes::delete_all))
        .route("/boxes/linux", post(boxes::create_linux))
        .route("/boxes/android", post(boxes::create_android))
        .route("/boxes/reclaim", post(boxes::reclaim))
        .route("/boxes/images/update", post(images::update))
        .route("/boxes/:id", get(boxes::get).delete(boxes::delete))
        .route("/boxes/:id/start", post(boxes::start))
        .route("/boxes/:id/stop", post(boxes::stop))
        .route("/boxes/:id/commands", post(exec::commands))
        .route("/boxes/:id/run-code", post(exec::run_code))
        .route("/boxes/:id/fs/list", get(fs::list))
        .route("/boxes/:id/fs/read", get(fs::read))
        .route("/boxes/:id/fs/write", post(fs::write))
        .route(
            "/boxes/:id/archive",
            get(fs::archive).put(fs::extract_archive),
        )
        .route("/boxes/:id/ports/:port", get(boxes::external_port))
        .with_state(service);

    Router::new()
        .nest("/api/v1", api)
        // Panics become a generic 500 instead of a torn response.
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
