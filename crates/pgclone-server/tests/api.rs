use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use pgclone_common::{AccessToken, Image, Instance};
use pgclone_executor::{ExecutorOp, RecordingExecutor};
use pgclone_server::auth::SharedSecretAuthenticator;
use pgclone_server::correlator::AuthCorrelator;
use pgclone_server::lifecycle::{ImageClaims, ImageLifecycle, InstanceLifecycle, PortAllocator};
use pgclone_server::oauth::{OAuthClient, OAuthError};
use pgclone_server::store::{InMemoryImageStore, InMemoryInstanceStore};
use pgclone_server::{create_app, ApiError, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const TOKEN: &str = "test-token";

struct StubProvider;

#[async_trait]
impl OAuthClient for StubProvider {
    fn auth_code_url(&self, state: &str) -> String {
        format!("https://accounts.example.com/o/oauth2/auth?state={state}")
    }

    async fn exchange(&self, code: &str) -> Result<AccessToken, OAuthError> {
        Ok(AccessToken {
            access_token: format!("access-{code}"),
            token_type: "Bearer".to_string(),
            refresh_token: Some(format!("refresh-{code}")),
            expiry: None,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<AccessToken, OAuthError> {
        Err(OAuthError::MissingEmail)
    }

    async fn user_email(&self, _access_token: &str) -> Result<String, OAuthError> {
        Err(OAuthError::MissingEmail)
    }
}

struct TestApp {
    router: Router,
    executor: RecordingExecutor,
    correlator: AuthCorrelator,
}

fn test_app() -> TestApp {
    let images = Arc::new(InMemoryImageStore::new());
    let instances = Arc::new(InMemoryInstanceStore::new());
    let executor = RecordingExecutor::new();
    let correlator = AuthCorrelator::new(Arc::new(StubProvider));
    let claims = ImageClaims::new();

    let state = AppState {
        images: ImageLifecycle::new(
            images.clone(),
            instances.clone(),
            Arc::new(executor.clone()),
            claims.clone(),
        ),
        instances: InstanceLifecycle::new(
            images,
            instances,
            Arc::new(executor.clone()),
            PortAllocator::new(6000..=6010),
            claims,
        ),
        correlator: correlator.clone(),
        authenticator: Arc::new(SharedSecretAuthenticator::new(TOKEN)),
    };

    TestApp {
        router: create_app(state),
        executor,
        correlator,
    }
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn create_image(app: &Router) -> Image {
    let (status, body) = send(
        app,
        request(
            "POST",
            "/images",
            Some(json!({
                "backed_up_at": "2016-01-02T03:04:05Z",
                "anon": "UPDATE users SET email = 'anon@example.com';"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn image_to_instance_round_trip() {
    let TestApp {
        router, executor, ..
    } = test_app();

    let image = create_image(&router).await;
    assert!(!image.ready);
    assert_eq!(image.backed_up_at.to_rfc3339(), "2016-01-02T03:04:05+00:00");

    let create_instance = json!({ "image_id": image.id.to_string() });
    let (status, body) = send(
        &router,
        request("POST", "/instances", Some(create_instance.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let error: ApiError = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.status, "422");

    let (status, body) = send(
        &router,
        request("POST", &format!("/images/{}/done", image.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let finalised: Image = serde_json::from_slice(&body).unwrap();
    assert!(finalised.ready);

    let (status, body) = send(&router, request("POST", "/instances", Some(create_instance))).await;
    assert_eq!(status, StatusCode::CREATED);
    let instance: Instance = serde_json::from_slice(&body).unwrap();
    assert_eq!(instance.image_id, image.id);
    assert!(instance.port > 0);

    let (status, _) = send(
        &router,
        request("DELETE", &format!("/instances/{}", instance.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&router, request("GET", "/instances", None)).await;
    assert_eq!(status, StatusCode::OK);
    let remaining: Vec<Instance> = serde_json::from_slice(&body).unwrap();
    assert!(remaining.is_empty());

    assert_eq!(executor.count(ExecutorOp::ProvisionInstance).await, 1);
    assert_eq!(executor.count(ExecutorOp::TeardownInstance).await, 1);
}

#[tokio::test]
async fn concurrent_finalisation_has_one_winner() {
    let app = test_app();
    let image = create_image(&app.router).await;
    let uri = format!("/images/{}/done", image.id);

    let results = futures::future::join_all(
        (0..4).map(|_| send(&app.router, request("POST", &uri, None))),
    )
    .await;

    let ok = results.iter().filter(|(s, _)| *s == StatusCode::OK).count();
    let conflicts = results
        .iter()
        .filter(|(s, _)| *s == StatusCode::CONFLICT)
        .count();
    assert_eq!((ok, conflicts), (1, 3));
    assert_eq!(app.executor.count(ExecutorOp::FinalizeImage).await, 1);
}

#[tokio::test]
async fn list_hides_anon_but_get_shows_it() {
    let app = test_app();
    let image = create_image(&app.router).await;

    let (_, body) = send(&app.router, request("GET", "/images", None)).await;
    let listed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(listed[0].get("anon").is_none());

    let (_, body) = send(
        &app.router,
        request("GET", &format!("/images/{}", image.id), None),
    )
    .await;
    let fetched: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        fetched["anon"],
        "UPDATE users SET email = 'anon@example.com';"
    );
}

#[tokio::test]
async fn bad_ids_and_unknown_resources() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        request("POST", "/instances", Some(json!({ "image_id": "latest" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["source"]["parameter"], "image_id");

    let (status, _) = send(&app.router, request("GET", "/images/999", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app.router,
        request("POST", "/images", Some(json!({ "anon": "no timestamp" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["code"], "invalid_json");
}

#[tokio::test]
async fn protected_routes_require_a_bearer() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/images")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("pgclone-version"));

    let (status, _) = send(
        &app.router,
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn access_token_flow_end_to_end() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/authenticate?state=flow-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://accounts.example.com/o/oauth2/auth?state=flow-1"
    );

    let waiter = {
        let router = app.router.clone();
        tokio::spawn(async move {
            send(
                &router,
                Request::builder()
                    .method("POST")
                    .uri("/access_tokens")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "state": "flow-1" }).to_string()))
                    .unwrap(),
            )
            .await
        })
    };

    while !app.correlator.is_pending("flow-1") {
        tokio::task::yield_now().await;
    }

    let (status, body) = send(
        &app.router,
        Request::builder()
            .uri("/oauth_callback?state=flow-1&code=xyz")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("Success!"));

    let (status, body) = waiter.await.unwrap();
    assert_eq!(status, StatusCode::CREATED);
    let token: AccessToken = serde_json::from_slice(&body).unwrap();
    assert_eq!(token.access_token, "access-xyz");
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-xyz"));
    assert_eq!(app.correlator.pending_count(), 0);
}

#[tokio::test]
async fn callback_errors_render_html() {
    let app = test_app();

    let (status, _) = send(
        &app.router,
        Request::builder()
            .uri("/oauth_callback?state=nobody&code=xyz")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let pending = app.correlator.register("denied").unwrap();
    let (status, body) = send(
        &app.router,
        Request::builder()
            .uri("/oauth_callback?state=denied&error=%3Cb%3Eaccess_denied%3C%2Fb%3E")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let page = String::from_utf8(body).unwrap();
    assert!(page.contains("&lt;b&gt;access_denied&lt;/b&gt;"));
    assert!(pending.wait().await.is_err());
}
