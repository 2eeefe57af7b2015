use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::handler;
use crate::state::AppState;

/// Build the axum router with all TiddlyWeb endpoints.
pub fn build_router(state: AppState) -> Router {
    let tiddler_limit = DefaultBodyLimit::max(state.config.tiddler_size_limit);
    let upload_limit = DefaultBodyLimit::max(state.config.upload_size_limit);
    let index = ServeFile::new(&state.config.index_path);
    let files = ServeDir::new(&state.config.files_dir);

    Router::new()
        .route("/v1/health", get(handler::health))
        .route("/status", get(handler::status))
        .route("/recipes/:recipe/tiddlers.json", get(handler::list))
        .route(
            "/recipes/:recipe/tiddlers/*title",
            get(handler::get_tiddler)
                .put(handler::put_tiddler)
                .delete(handler::delete_tiddler)
                .layer(tiddler_limit),
        )
        .route("/bags/:recipe/tiddlers/*title", delete(handler::delete_tiddler))
        .route("/upload", post(handler::upload).layer(upload_limit))
        .route(
            "/challenge/tiddlywebplugins.tiddlyspace.cookie_form",
            post(handler::login),
        )
        .route("/logout", post(handler::logout))
        .route_service("/", index)
        .nest_service("/files", files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
