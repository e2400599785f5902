//! Request chain stages shared by every route.

use crate::auth::Authenticator;
use crate::error::ApiError;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tower_http::request_id::RequestId;
use tracing::{info, Span};

/// Identity of the caller, attached by [`authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Resolve the caller through the authenticator, or stop with 401.
pub async fn authenticate(
    State(authenticator): State<Arc<dyn Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticator.authenticate(request.headers()).await {
        Ok(identity) => {
            Span::current().record("user", identity.as_str());
            request.extensions_mut().insert(AuthenticatedUser(identity));
            next.run(request).await
        }
        Err(e) => {
            info!(error = %e, "Rejected unauthenticated request");
            ApiError::unauthorized().into_response()
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    /// A handler asking for the user outside the authenticated routes is a
    /// wiring bug, not an anonymous request.
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| {
                tracing::error!("Could not acquire authenticated user");
                ApiError::missing_identity()
            })
    }
}

/// Root span for a request, tagged with the id set by the request-id layer.
pub fn request_span(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or("-");

    tracing::info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
        user = tracing::field::Empty,
    )
}
