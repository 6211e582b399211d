//! HTTP Transport
//!
//! Thin axum layer over the orchestrator. Every body is JSON with a
//! `success` flag; failures carry `{kind, message}` and a status code derived
//! from the error kind.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};

use crate::error::PairingError;
use crate::orchestrator::{
    Challenge, CredentialRetention, DeleteOutcome, Orchestrator, StartOptions, StartOutcome,
};

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Successful response envelope
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, PairingError>;

/// HTTP status for each error kind
pub fn status_code(err: &PairingError) -> StatusCode {
    match err {
        PairingError::Conflict(_) => StatusCode::CONFLICT,
        PairingError::NotFound(_) => StatusCode::NOT_FOUND,
        PairingError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PairingError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        PairingError::PairingUnavailable(_)
        | PairingError::ConnectionClosed(_)
        | PairingError::TransientDisconnect(_) => StatusCode::SERVICE_UNAVAILABLE,
        PairingError::LoggedOut(_) => StatusCode::UNAUTHORIZED,
        PairingError::Cancelled(_) => StatusCode::GONE,
        PairingError::EngineInit(_) | PairingError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for PairingError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        debug!("Request failed ({}): {}", status, self);
        let body = serde_json::json!({
            "success": false,
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartQuery {
    session_id: Option<String>,
    wipe_after_pairing: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeQuery {
    number: Option<String>,
    session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    session_id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairing_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_hint: Option<String>,
}

impl From<StartOutcome> for StartBody {
    fn from(outcome: StartOutcome) -> Self {
        let mut body = Self {
            session_id: outcome.session_id().to_string(),
            status: "connected",
            qr_string: None,
            pairing_code: None,
            phone_hint: None,
        };
        match outcome {
            StartOutcome::Challenge {
                challenge: Challenge::Qr(qr),
                ..
            } => {
                body.status = "qr_ready";
                body.qr_string = Some(qr);
            }
            StartOutcome::Challenge {
                challenge: Challenge::PairingCode(code),
                ..
            } => {
                body.status = "code_ready";
                body.pairing_code = Some(code);
            }
            StartOutcome::Connected { phone_hint, .. } => {
                body.phone_hint = phone_hint;
            }
        }
        body
    }
}

#[derive(Serialize)]
struct DeleteBody {
    deleted: bool,
    message: &'static str,
}

#[derive(Serialize)]
struct ListBody<T: Serialize> {
    sessions: Vec<T>,
    count: usize,
}

/// Build the router (shared between the binary and tests)
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/session", get(start_handler))
        .route("/session/code", get(pairing_code_handler))
        .route("/session/list", get(list_handler))
        .route("/session/status/{id}", get(status_handler))
        .route("/session/download/{id}", get(download_handler))
        .route("/session/{id}", delete(delete_handler))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

/// Bind and serve until `shutdown` resolves
pub async fn serve(
    orchestrator: Orchestrator,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(orchestrator);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "activeSessions": state.orchestrator.active_count(),
    }))
}

async fn start_handler(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
) -> ApiResult<StartBody> {
    let options = StartOptions {
        session_id: query.session_id,
        pairing_phone: None,
        retention: query.wipe_after_pairing.map(|wipe| {
            if wipe {
                CredentialRetention::WipeAfterPairing
            } else {
                CredentialRetention::Keep
            }
        }),
    };
    let outcome = state.orchestrator.start_session(options).await?;
    Ok(ApiResponse::ok(StartBody::from(outcome)))
}

async fn pairing_code_handler(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> ApiResult<StartBody> {
    let number = query
        .number
        .ok_or_else(|| PairingError::InvalidRequest("number is required".to_string()))?;
    let outcome = state
        .orchestrator
        .request_pairing_code(query.session_id, &number)
        .await?;
    Ok(ApiResponse::ok(StartBody::from(outcome)))
}

async fn status_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<crate::orchestrator::SessionStatusReport> {
    let report = state.orchestrator.get_status(&session_id).await?;
    Ok(ApiResponse::ok(report))
}

async fn download_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, PairingError> {
    let credential = state.orchestrator.download_credential(&session_id).await?;
    let body = serde_json::to_string_pretty(&credential)?;
    let disposition = format!("attachment; filename=\"session-{}.json\"", session_id);

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<DeleteBody> {
    let body = match state.orchestrator.delete_session(&session_id).await? {
        DeleteOutcome::Deleted => DeleteBody {
            deleted: true,
            message: "Session deleted",
        },
        DeleteOutcome::NotFound => DeleteBody {
            deleted: false,
            message: "Session not found",
        },
    };
    Ok(ApiResponse::ok(body))
}

async fn list_handler(
    State(state): State<AppState>,
) -> ApiResult<ListBody<crate::orchestrator::SessionSummary>> {
    let sessions = state.orchestrator.list_sessions().await?;
    Ok(ApiResponse::ok(ListBody {
        count: sessions.len(),
        sessions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedEngine;
    use crate::engine::EngineEvent;
    use crate::orchestrator::OrchestratorConfig;
    use crate::store::{CredentialStore, MemoryCredentialStore};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn setup() -> (Router, Arc<ScriptedEngine>, Arc<MemoryCredentialStore>) {
        let engine = Arc::new(ScriptedEngine::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let config = OrchestratorConfig {
            start_timeout: Duration::from_secs(2),
            reconnect_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(config, engine.clone(), store.clone());
        (build_router(orchestrator), engine, store)
    }

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = setup();
        let (status, body) = call(&app, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeSessions"], 0);
    }

    #[tokio::test]
    async fn test_start_returns_qr_then_conflict() {
        let (app, engine, _) = setup();
        let pending = {
            let app = app.clone();
            tokio::spawn(async move { call(&app, Method::GET, "/session?sessionId=s1").await })
        };
        let conn = engine.next_connection().await;
        conn.events.send(EngineEvent::Qr("Q1".into())).await.unwrap();

        let (status, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "qr_ready");
        assert_eq!(body["qrString"], "Q1");
        assert_eq!(body["sessionId"], "s1");

        let (status, body) = call(&app, Method::GET, "/session?sessionId=s1").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "conflict");
    }

    #[tokio::test]
    async fn test_pairing_code_route() {
        let (app, engine, _) = setup();
        let pending = {
            let app = app.clone();
            tokio::spawn(async move {
                call(&app, Method::GET, "/session/code?number=15551234567&sessionId=p1").await
            })
        };
        let conn = engine.next_connection().await;
        conn.events.send(EngineEvent::PairingCodeReady).await.unwrap();

        let (status, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "code_ready");
        assert_eq!(body["pairingCode"], "ABCD1234");
    }

    #[tokio::test]
    async fn test_pairing_code_requires_number() {
        let (app, _, _) = setup();
        let (status, body) = call(&app, Method::GET, "/session/code").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn test_invalid_session_id() {
        let (app, _, _) = setup();
        let (status, _) = call(&app, Method::GET, "/session?sessionId=a%2Fb").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_download_delete() {
        let (app, _, store) = setup();
        store
            .write("s3", &serde_json::json!({ "me": { "id": "15550001111:2@s.whatsapp.net" } }))
            .await
            .unwrap();

        let (status, body) = call(&app, Method::GET, "/session/status/s3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isActive"], false);
        assert_eq!(body["hasCredentials"], true);
        assert_eq!(body["phoneHint"], "15550001111");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/session/download/s3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"session-s3.json\""
        );

        let (status, body) = call(&app, Method::DELETE, "/session/s3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
        assert_eq!(body["message"], "Session deleted");

        let (status, body) = call(&app, Method::DELETE, "/session/s3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], false);

        let (status, body) = call(&app, Method::GET, "/session/download/s3").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (app, _, store) = setup();
        store.write("a", &serde_json::json!({})).await.unwrap();
        store.write("b", &serde_json::json!({})).await.unwrap();

        let (status, body) = call(&app, Method::GET, "/session/list").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["sessions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            status_code(&PairingError::Timeout("x".into())),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            status_code(&PairingError::LoggedOut("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_code(&PairingError::Cancelled("x".into())),
            StatusCode::GONE
        );
        assert_eq!(
            status_code(&PairingError::Storage("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
