//! HTTP adapter (`spec.md` §6)
//!
//! The only layer that translates [`AppError`] into a status code; every
//! internal boundary stays `AppResult<T>`. Routes: `GET /auth` renders the
//! consent form, `POST /process` drives the [`AuthorizationController`],
//! `POST /token` drives the [`TokenExchange`]. Handler shape (state extractor,
//! `Json`/`Form` bodies, `IntoResponse` error mapping) follows the teacher's
//! `axum`-adjacent response conventions in `server.rs`'s tool-result envelopes,
//! adapted from MCP tool calls to plain REST handlers.

use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::authorization::{AuthorizationController, AuthorizationRequest};
use crate::db::Db;
use crate::errors::{AppError, AppResult};
use crate::token_exchange::{TokenExchange, TokenRequest};

pub struct AppState {
    pub db: Db,
    pub authorization: AuthorizationController,
    pub token_exchange: TokenExchange,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth", get(auth_form))
        .route("/process", post(process_authorization))
        .route("/token", post(token))
        .with_state(state)
}

/// Resolve `raw` to an existing application's id. A malformed id and an id
/// naming no application are indistinguishable to the caller — both produce
/// the same `invalid_request`/400 shape, mirroring
/// `original_source/app/api/v3/connect.py::show_auth_form`'s single
/// "Invalid client_id" branch, which catches both the `uuid.UUID()` parse
/// failure and the missing-row lookup the same way.
async fn resolve_client_id(db: &Db, raw: &str) -> AppResult<Uuid> {
    let invalid = || AppError::InvalidRequest("invalid client_id".to_owned());
    let id = Uuid::parse_str(raw).map_err(|_| invalid())?;
    db.get_application(id).await.map_err(|_| invalid())?;
    Ok(id)
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    client_id: String,
    redirect_uri: String,
    state: String,
    scope: Option<String>,
    response_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    login_hint: Option<String>,
}

/// Minimal inline consent form. HTML rendering is explicitly out of scope
/// beyond this one page (`spec.md` §1) — no templating engine is pulled in
/// for a single static form. `response_type` must be `code`, the
/// `redirect_uri` must be well-formed, and `client_id` must name an existing
/// application; any other value is a 400 (`spec.md` §8 boundary behaviour).
async fn auth_form(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
) -> Result<impl IntoResponse, AppError> {
    if query.response_type != "code" {
        return Err(AppError::InvalidRequest(format!(
            "unsupported response_type '{}'",
            query.response_type
        )));
    }
    AuthorizationController::validate_redirect_uri(&query.redirect_uri)?;
    let client_id = resolve_client_id(&state.db, &query.client_id).await?;

    let scope = query.scope.unwrap_or_default();
    Ok(Html(format!(
        r#"<!doctype html>
<html><body>
<form method="post" action="/process">
  <input type="hidden" name="client_id" value="{client_id}">
  <input type="hidden" name="redirect_uri" value="{redirect_uri}">
  <input type="hidden" name="state" value="{state}">
  <input type="hidden" name="scope" value="{scope}">
  <label>Email <input type="text" name="email" required></label>
  <label>IMAP username <input type="text" name="username" required></label>
  <label>IMAP password <input type="password" name="password" required></label>
  <label>IMAP host <input type="text" name="imap_host" required></label>
  <label>IMAP port <input type="number" name="imap_port" value="993" required></label>
  <label>SMTP host <input type="text" name="smtp_host" value=""></label>
  <label>SMTP port <input type="number" name="smtp_port" value="587"></label>
  <button type="submit">Grant access</button>
</form>
</body></html>"#,
        client_id = client_id,
        redirect_uri = query.redirect_uri,
        state = query.state,
        scope = scope,
    )))
}

#[derive(Debug, Deserialize)]
struct ProcessForm {
    client_id: String,
    redirect_uri: String,
    state: String,
    scope: Option<String>,
    email: String,
    username: String,
    password: String,
    imap_host: String,
    #[serde(default = "default_imap_port")]
    imap_port: u16,
    #[serde(default)]
    smtp_host: String,
    #[serde(default = "default_smtp_port")]
    smtp_port: u16,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

/// `spec.md` §6: on success, `{success: true, redirect_url}` where
/// `redirect_url = redirect_uri?code=…&state=…&source=nolas`; on failure,
/// `{success: false, error}` with HTTP 400 — matching
/// `original_source/app/api/v3/connect.py::process_authorization`, whose
/// outer `try/except` 400s every expected failure (bad client_id, bad
/// redirect_uri, failed trial login, disallowed host, ...) and reserves 500
/// for a genuinely unexpected exception. Unlike most handlers here, this one
/// does not let [`AppError`]'s blanket `IntoResponse` mapping apply, since
/// that mapping would leak `invalid_client`/401 and `upstream_unavailable`/500
/// through for cases `/process` must always report as 400.
async fn process_authorization(State(state): State<Arc<AppState>>, Form(form): Form<ProcessForm>) -> Response {
    match process_authorization_inner(&state, form).await {
        Ok(redirect_url) => Json(json!({ "success": true, "redirect_url": redirect_url })).into_response(),
        Err(AppError::Internal(message)) => {
            tracing::error!(error = %message, "process_authorization failed unexpectedly");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "internal", "message": message })),
            )
                .into_response()
        }
        Err(other) => {
            tracing::warn!(kind = other.kind(), error = %other, "process_authorization rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": other.kind(), "message": other.to_string() })),
            )
                .into_response()
        }
    }
}

async fn process_authorization_inner(state: &AppState, form: ProcessForm) -> AppResult<String> {
    let client_id = resolve_client_id(&state.db, &form.client_id).await?;
    AuthorizationController::validate_redirect_uri(&form.redirect_uri)?;

    let redirect_uri = form.redirect_uri.clone();
    let request_state = form.state.clone();
    let code = state
        .authorization
        .process_authorization(AuthorizationRequest {
            application_id: client_id,
            redirect_uri: form.redirect_uri,
            scope: form.scope.filter(|s| !s.is_empty()),
            email: form.email,
            username: form.username,
            password: form.password,
            imap_host: form.imap_host,
            imap_port: form.imap_port,
            smtp_host: form.smtp_host,
            smtp_port: form.smtp_port,
        })
        .await?;

    Ok(format!(
        "{redirect_uri}?code={code}&state={request_state}&source=nolas",
        code = urlencoding::encode(&code.code),
        request_state = urlencoding::encode(&request_state),
    ))
}

#[derive(Debug, Deserialize)]
struct TokenRequestBody {
    grant_type: String,
    client_id: String,
    code: String,
    redirect_uri: String,
}

/// `spec.md` §6: JSON body, authenticated by the transport layer against
/// application credentials. The transport-level authentication mechanism
/// itself is out of scope (`spec.md` §1: "the HTTP transport" is an external
/// collaborator) — this handler treats `client_id` as the application the
/// transport already authenticated the caller as, and [`TokenExchange`]
/// still re-validates every remaining check in `spec.md` §4.H's table
/// (code existence/validity, redirect binding, code-to-application binding).
/// A `client_id` that does not even parse as an id is folded into the same
/// `invalid_client`/401 the exchange itself returns for one that parses but
/// names no application, rather than surfacing as a generic body-parse
/// rejection.
async fn token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenRequestBody>,
) -> Result<impl IntoResponse, AppError> {
    let client_id =
        Uuid::parse_str(&body.client_id).map_err(|_| AppError::InvalidClient("invalid client_id".to_owned()))?;
    let response = state
        .token_exchange
        .exchange(TokenRequest {
            grant_type: body.grant_type,
            client_id,
            code: body.code,
            redirect_uri: body.redirect_uri,
        })
        .await?;

    Ok(Json(json!({
        "request_id": response.request_id,
        "grant_id": response.grant_id,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use crate::auth_code::AuthCodeStore;
    use crate::authorization::AuthorizationController;
    use crate::config::ServerConfig;
    use crate::crypto::CredentialCipher;
    use crate::db::Db;

    async fn test_state() -> (Arc<AppState>, Db) {
        let db = Db::connect("sqlite::memory:", 1, 1).await.expect("connects");
        let mut config = ServerConfig::load_from_env().expect("loads defaults");
        config.allowed_imap_hosts = vec!["imap.purelymail.com".to_owned()];
        let cipher = CredentialCipher::from_env().expect("builds cipher");
        let codes = AuthCodeStore::new(db.clone(), &config);
        let authorization = AuthorizationController::new(db.clone(), config.clone(), cipher, codes.clone());
        let token_exchange = TokenExchange::new(db.clone(), codes);
        (
            Arc::new(AppState {
                db: db.clone(),
                authorization,
                token_exchange,
            }),
            db,
        )
    }

    #[tokio::test]
    async fn auth_rejects_non_code_response_type() {
        let (state, _db) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::get(
                    "/auth?client_id=00000000-0000-0000-0000-000000000000&redirect_uri=https://x.test/cb&state=xyz&response_type=token",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn auth_accepts_well_formed_request() {
        let (state, db) = test_state().await;
        let application = db.create_application("acme").await.expect("seeds application");
        let app = router(state);
        let response = app
            .oneshot(
                Request::get(format!(
                    "/auth?client_id={}&redirect_uri=https://x.test/cb&state=xyz&response_type=code",
                    application.id
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_rejects_unknown_client_id() {
        let (state, _db) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::get(
                    "/auth?client_id=00000000-0000-0000-0000-000000000000&redirect_uri=https://x.test/cb&state=xyz&response_type=code",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn auth_rejects_malformed_client_id_with_the_same_shape_as_unknown() {
        let (state, _db) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::get(
                    "/auth?client_id=not-a-uuid&redirect_uri=https://x.test/cb&state=xyz&response_type=code",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["message"], "invalid client_id");
    }

    #[tokio::test]
    async fn process_maps_controller_failures_to_400() {
        let (state, db) = test_state().await;
        let application = db.create_application("acme").await.expect("seeds application");
        let app = router(state);
        let form = format!(
            "client_id={}&redirect_uri=https://x.test/cb&state=xyz&email=a@b.test&username=a&password=b&imap_host=not.allowed.test",
            application.id
        );
        let response = app
            .oneshot(
                Request::post("/process")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        // `not.allowed.test` is not on the allow-list, which the controller
        // reports as `UpstreamUnavailable` (a 500 under the global mapping);
        // `/process` must still surface this as 400.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn token_rejects_malformed_json() {
        let (state, _db) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::post("/token")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn token_rejects_malformed_client_id() {
        let (state, _db) = test_state().await;
        let app = router(state);
        let body = json!({
            "grant_type": "authorization_code",
            "client_id": "not-a-uuid",
            "code": "whatever",
            "redirect_uri": "https://x.test/cb",
        });
        let response = app
            .oneshot(
                Request::post("/token")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_rejects_unsupported_grant_type() {
        let (state, db) = test_state().await;
        let application = db.create_application("acme").await.expect("seeds application");
        let app = router(state);
        let body = json!({
            "grant_type": "password",
            "client_id": application.id,
            "code": "whatever",
            "redirect_uri": "https://x.test/cb",
        });
        let response = app
            .oneshot(
                Request::post("/token")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn token_rejects_unknown_code() {
        let (state, db) = test_state().await;
        let application = db.create_application("acme").await.expect("seeds application");
        let app = router(state);
        let body = json!({
            "grant_type": "authorization_code",
            "client_id": application.id,
            "code": "does-not-exist",
            "redirect_uri": "https://x.test/cb",
        });
        let response = app
            .oneshot(
                Request::post("/token")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "invalid_grant");
    }
}
