//! The three legs of the OAuth token flow.
//!
//! `authenticate` and `oauth_callback` are visited by the user's browser,
//! `access_tokens` by the client waiting for the token. None of them carry a
//! bearer credential, since obtaining one is the point.

use crate::correlator::CallbackOutcome;
use crate::error::ApiError;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header::LOCATION, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use pgclone_common::AccessToken;
use serde::Deserialize;
use tracing::{error, info};

const SUCCESS_PAGE: &str =
    "<h1>Success!</h1><h3>You can close this tab</h3><script>window.close()</script>";

#[derive(Debug, Deserialize)]
pub struct StateParams {
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub state: String,
    pub code: Option<String>,
    pub error: Option<String>,
}

fn require_state(state: &str) -> Result<&str, ApiError> {
    if state.trim().is_empty() {
        return Err(ApiError::bad_request("state must not be empty", "state"));
    }
    Ok(state)
}

/// Redirect the browser to the provider's consent page.
pub async fn authenticate_handler(
    State(app): State<AppState>,
    Query(params): Query<StateParams>,
) -> Result<Response, ApiError> {
    let state = require_state(&params.state)?;
    let url = app.correlator.authorize_url(state);
    Ok((StatusCode::FOUND, [(LOCATION, url)]).into_response())
}

/// Block until the browser completes the flow for `state`.
pub async fn create_access_token_handler(
    State(app): State<AppState>,
    payload: Result<Json<StateParams>, JsonRejection>,
) -> Result<(StatusCode, Json<AccessToken>), ApiError> {
    let Json(params) = payload?;
    let state = require_state(&params.state)?;

    let token = app.correlator.create(state).await?;
    info!("Issued access token");
    Ok((StatusCode::CREATED, Json(token)))
}

/// Redirect target of the provider. Renders HTML for the browser.
pub async fn oauth_callback_handler(
    State(app): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let outcome = app
        .correlator
        .callback(
            &params.state,
            params.code.as_deref(),
            params.error.as_deref(),
        )
        .await;

    match outcome {
        Ok(CallbackOutcome::Delivered) => Html(SUCCESS_PAGE).into_response(),
        Ok(CallbackOutcome::NoWaiter) => Html(
            "<h1>Nothing to do</h1><h3>This sign-in request is no longer pending. Please try again</h3>",
        )
        .into_response(),
        Err(e) => {
            error!(error = %e, "OAuth callback failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(error_page(&e.to_string())),
            )
                .into_response()
        }
    }
}

fn error_page(message: &str) -> String {
    format!(
        "<h1>Error</h1><h3>There was an error. Please try again</h3><pre>{}</pre>",
        html_escape::encode_text(message)
    )
}
