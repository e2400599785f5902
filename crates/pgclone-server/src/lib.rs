//! pgclone API server: hands out short-lived, access-controlled copies of an
//! anonymised production database.

pub mod auth;
pub mod config;
pub mod correlator;
pub mod error;
pub mod lifecycle;
pub mod middleware;
pub mod oauth;
pub mod routes;
pub mod store;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::correlator::AuthCorrelator;
use crate::lifecycle::{ImageLifecycle, InstanceLifecycle};
use crate::routes::{access_tokens, images, instances};

pub use crate::config::ServerConfig;
pub use crate::error::ApiError;

/// Version reported in the `pgclone-version` response header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub images: ImageLifecycle,
    pub instances: InstanceLifecycle,
    pub correlator: AuthCorrelator,
    pub authenticator: Arc<dyn Authenticator>,
}

pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/images",
            get(images::list_images_handler).post(images::create_image_handler),
        )
        .route(
            "/images/:id",
            get(images::get_image_handler).delete(images::destroy_image_handler),
        )
        .route("/images/:id/done", post(images::done_handler))
        .route(
            "/instances",
            get(instances::list_instances_handler).post(instances::create_instance_handler),
        )
        .route(
            "/instances/:id",
            get(instances::get_instance_handler).delete(instances::destroy_instance_handler),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.authenticator.clone(),
            middleware::authenticate,
        ));

    Router::new()
        .merge(protected)
        .route("/health", get(routes::health_handler))
        .route("/authenticate", get(access_tokens::authenticate_handler))
        .route("/oauth_callback", get(access_tokens::oauth_callback_handler))
        .route(
            "/access_tokens",
            post(access_tokens::create_access_token_handler),
        )
        .with_state(state)
        .layer(axum::middleware::map_response(version_header))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(middleware::request_span))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn version_header(mut response: axum::response::Response) -> axum::response::Response {
    response.headers_mut().insert(
        "pgclone-version",
        axum::http::HeaderValue::from_static(VERSION),
    );
    response
}
