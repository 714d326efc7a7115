use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

pub mod dto;
pub mod handler;
pub mod model;
pub mod planner;
pub mod repository;
pub mod service;
pub mod store;
pub mod stream_handler;

pub fn router(state: AppState) -> Router<AppState> {
    let stream_routes = Router::new()
        .route("/stream/{rendition_id}", get(stream_handler::stream_video))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth::optional_auth,
        ));

    let viewer_routes = Router::new()
        .route("/job/{job_id}", get(handler::get_job_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth::auth_middleware,
        ));

    let admin_routes = Router::new()
        .route("/upload", post(handler::upload_video))
        .route("/jobs", get(handler::list_jobs))
        .route("/job/{job_id}/cancel", delete(handler::cancel_job))
        .route_layer(middleware::from_fn(crate::middleware::role::admin_guard))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware,
        ));

    stream_routes.merge(viewer_routes).merge(admin_routes)
}
