//! HTTP handlers: registration, login, history, one-off submission, health.

use std::fmt;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::{Identity, OutboundMessage, RelayError, Submission};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth;
use crate::broadcast::BroadcastStats;
use crate::server::AppState;

/// Error response: `{"error": {"code", "message"}}` with a mapped status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn internal(detail: impl fmt::Display) -> Self {
        error!(error = %detail, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: "internal server error".into(),
        }
    }

    pub fn over_capacity(limit: usize) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "OVER_CAPACITY",
            message: format!("connection limit of {limit} reached"),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        let status = match &e {
            RelayError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            RelayError::AlreadyExists(_) => StatusCode::CONFLICT,
            RelayError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            RelayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::DeliveryFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        RelayError::MalformedInput(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": { "code": self.code, "message": self.message } });
        (self.status, Json(body)).into_response()
    }
}

/// Run store or hashing work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RelayError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

fn session_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = auth::bearer_token(headers)
        .ok_or_else(|| RelayError::AuthFailure("missing bearer token".into()))?;
    Ok(state.tokens.resolve(token)?)
}

#[derive(Deserialize)]
pub struct CredentialsBody {
    username: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub username: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub messages: Option<u64>,
    pub broadcast: BroadcastStats,
}

/// POST /register
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Json(CredentialsBody { username, password }) = body?;
    let password = SecretString::from(password);
    let gate = Arc::clone(&state.gate);
    let name = username.clone();
    blocking(move || gate.register(&name, &password)).await?;

    info!(author = %username, "registered");
    Ok((StatusCode::CREATED, Json(RegisterResponse { username })))
}

/// POST /login
pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(CredentialsBody { username, password }) = body?;
    let password = SecretString::from(password);
    let gate = Arc::clone(&state.gate);
    let identity = blocking(move || gate.authenticate(&username, &password))
        .await
        .inspect_err(|e| warn!(status = %e.status, "login rejected"))?;

    let token = state.tokens.issue(identity.clone());
    info!(author = %identity, "logged in");
    Ok(Json(LoginResponse {
        username: identity.as_str().to_owned(),
        token: token.as_str().to_owned(),
    }))
}

/// POST /logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    let token = auth::bearer_token(&headers)
        .ok_or_else(|| RelayError::AuthFailure("missing bearer token".into()))?;
    if !state.tokens.revoke(token) {
        return Err(RelayError::AuthFailure("invalid or expired session token".into()).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /messages: the full log in order.
pub async fn history(State(state): State<AppState>) -> Result<Json<Vec<OutboundMessage>>, ApiError> {
    let log = Arc::clone(&state.log);
    let messages = blocking(move || log.list_all()).await?;
    Ok(Json(messages.into_iter().map(OutboundMessage::from).collect()))
}

/// POST /messages: publish one message as the bearer's identity.
pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Submission>, JsonRejection>,
) -> Result<(StatusCode, Json<OutboundMessage>), ApiError> {
    let identity = session_identity(&state, &headers)?;
    let Json(submission) = body?;
    submission.validate()?;

    let broadcaster = Arc::clone(&state.broadcaster);
    let message = blocking(move || broadcaster.publish(&identity, &submission.body)).await?;
    Ok((StatusCode::CREATED, Json(message.into())))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let log = Arc::clone(&state.log);
    let messages = blocking(move || log.count()).await.ok();
    let (status, label) = match messages {
        Some(_) => (StatusCode::OK, "healthy"),
        None => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };
    let body = HealthResponse {
        status: label.into(),
        connections: state.registry.len(),
        messages,
        broadcast: state.broadcaster.stats(),
    };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::tests::UnavailableLog;
    use crate::config::ServerConfig;
    use crate::server::build_router;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use axum::Router;
    use relay_core::{CredentialGate, MessageLog};
    use relay_store::{CredentialStore, Database, MessageRepo};
    use tower::ServiceExt;

    fn gate(db: Database) -> Arc<dyn CredentialGate> {
        let params = argon2::Params::new(argon2::Params::MIN_M_COST, 1, 1, None).unwrap();
        Arc::new(CredentialStore::with_params(db, params))
    }

    fn state_with(log: Arc<dyn MessageLog>) -> AppState {
        let db = Database::in_memory().unwrap();
        AppState::new(ServerConfig::default(), log, gate(db))
    }

    fn state() -> AppState {
        let db = Database::in_memory().unwrap();
        let log = Arc::new(MessageRepo::new(db.clone()));
        AppState::new(ServerConfig::default(), log, gate(db))
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn login_as(app: &Router, user: &str) -> String {
        let creds = json!({ "username": user, "password": "pw" });
        let (status, _) = send(app, json_request(Method::POST, "/register", creds.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = send(app, json_request(Method::POST, "/login", creds)).await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_owned()
    }

    fn post_with_token(token: &str, body: serde_json::Value) -> Request<Body> {
        let mut req = json_request(Method::POST, "/messages", body);
        let _ = req
            .headers_mut()
            .insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        req
    }

    #[test]
    fn relay_errors_map_to_statuses() {
        let cases = [
            (RelayError::AuthFailure(String::new()), StatusCode::UNAUTHORIZED),
            (RelayError::AlreadyExists(String::new()), StatusCode::CONFLICT),
            (RelayError::MalformedInput(String::new()), StatusCode::BAD_REQUEST),
            (RelayError::StoreUnavailable(String::new()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn register_login_and_duplicate() {
        let app = build_router(state());
        let creds = json!({ "username": "alice", "password": "pw" });

        let (status, body) = send(&app, json_request(Method::POST, "/register", creds.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["username"], "alice");

        let (status, body) = send(&app, json_request(Method::POST, "/register", creds.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "ALREADY_EXISTS");

        let (status, body) = send(&app, json_request(Method::POST, "/login", creds)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "alice");
        assert!(body["token"].as_str().unwrap().starts_with("tok_"));
    }

    #[tokio::test]
    async fn bad_credentials_are_unauthorized() {
        let app = build_router(state());
        let _ = login_as(&app, "alice").await;

        let wrong = json!({ "username": "alice", "password": "nope" });
        let (status, body) = send(&app, json_request(Method::POST, "/login", wrong)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_FAILURE");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let app = build_router(state());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{oops"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "MALFORMED_INPUT");
    }

    #[tokio::test]
    async fn post_message_uses_token_identity() {
        let state = state();
        let app = build_router(state.clone());
        let token = login_as(&app, "alice").await;

        let (status, body) = send(
            &app,
            post_with_token(&token, json!({ "author": "mallory", "body": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["author"], "alice");
        assert_eq!(body["body"], "hello");

        let (status, history) = send(
            &app,
            Request::builder().uri("/messages").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0], body);
    }

    #[tokio::test]
    async fn post_message_requires_token() {
        let app = build_router(state());
        let (status, _) = send(&app, json_request(Method::POST, "/messages", json!({ "body": "x" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, post_with_token("tok_forged", json!({ "body": "x" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn blank_body_is_rejected() {
        let app = build_router(state());
        let token = login_as(&app, "alice").await;
        let (status, _) = send(&app, post_with_token(&token, json!({ "body": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_revokes_token() {
        let app = build_router(state());
        let token = login_as(&app, "alice").await;

        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/logout")
            .body(Body::empty())
            .unwrap();
        let _ = req
            .headers_mut()
            .insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, post_with_token(&token, json!({ "body": "x" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_503() {
        let state = state_with(Arc::new(UnavailableLog));
        let token = state.tokens.issue(Identity::new("alice"));
        let app = build_router(state);

        let (status, body) = send(&app, post_with_token(token.as_str(), json!({ "body": "x" }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "STORE_UNAVAILABLE");

        let (status, _) = send(
            &app,
            Request::builder().uri("/messages").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let app = build_router(state());
        let token = login_as(&app, "alice").await;
        let _ = send(&app, post_with_token(&token, json!({ "body": "one" }))).await;

        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["messages"], 1);
        assert_eq!(body["broadcast"]["published"], 1);
    }
}
