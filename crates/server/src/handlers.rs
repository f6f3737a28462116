//! Thin JSON/WebSocket handlers forwarding to the orchestrator's
//! transport-agnostic public API (spec.md §6.1/§6.2). No business logic
//! lives here — every decision (admission, termination reason, stream
//! ordering) is made by `orchestrator::Orchestrator`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use orchestrator::{Actor, RunRequest};
use store::{Claims, ProjectStore, Role, Tokens};

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::ApiError;

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Deserialize)]
pub struct RunBody {
    pub project_id: Uuid,
    pub file_path: String,
    pub language: String,
    /// Base64-less convenience for tests/CLI callers; a real REST surface
    /// would take raw multipart bodies. This field mirrors the bounded
    /// stdin buffer of spec.md §4.2 `Start`.
    pub stdin: Option<String>,
    pub entry_file_content: Option<String>,
}

/// spec.md §6.1 `Run`.
pub async fn run(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Json(body): Json<RunBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req = RunRequest {
        user_id: claims.sub,
        project_id: body.project_id,
        file_path: body.file_path,
        language: body.language,
        entry_file_content: body.entry_file_content.map(String::into_bytes),
        stdin: body.stdin.map(String::into_bytes),
    };
    let execution_id = state.orchestrator.run(req).await?;
    info!(%execution_id, user_id = %claims.sub, "execution admitted");
    Ok(Json(json!({ "success": true, "data": { "executionId": execution_id } })))
}

/// spec.md §6.1 `Stop`.
pub async fn stop(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let actor = actor_for(&claims);
    let state_value = state.orchestrator.stop(execution_id, actor).await?;
    Ok(Json(json!({ "success": true, "data": { "state": state_value } })))
}

/// spec.md §6.1 `AdminKill`. Requires an admin-role bearer token.
pub async fn admin_kill(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if claims.role != Role::Admin {
        return Err(orchestrator::OrchestratorError::Forbidden.into());
    }
    let state_value = state.orchestrator.admin_kill(execution_id, claims.sub).await?;
    Ok(Json(json!({ "success": true, "data": { "state": state_value } })))
}

/// spec.md §6.1 `Status`.
pub async fn status(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.orchestrator.status(execution_id).await?;
    Ok(Json(json!({ "success": true, "data": record })))
}

/// spec.md §6.1 `ActiveList`.
pub async fn active_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let entries = state.orchestrator.active_list().await;
    Json(json!({ "success": true, "data": entries.into_iter().map(|e| json!({
        "executionId": e.execution_id,
        "userId": e.user_id,
        "language": e.language,
        "created": e.created_at,
        "cpuPct": e.cpu_pct,
        "memBytes": e.mem_bytes,
    })).collect::<Vec<_>>() }))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub from_seq: Option<u64>,
}

/// spec.md §6.1 `Subscribe`, carried over a WebSocket connection the way
/// the teacher's `ws_handler` upgrades chat sockets.
pub async fn subscribe_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    ws.on_upgrade(move |socket| stream_frames(socket, state, execution_id, query.from_seq))
}

async fn stream_frames(mut socket: WebSocket, state: AppState, execution_id: Uuid, from_seq: Option<u64>) {
    let mut rx = match state.orchestrator.subscribe(execution_id, from_seq).await {
        Ok(rx) => rx,
        Err(err) => {
            let _ = socket
                .send(Message::Text(
                    json!({ "success": false, "error": { "kind": err.kind(), "message": err.to_string() } })
                        .to_string(),
                ))
                .await;
            return;
        }
    };

    while let Some(frame) = rx.recv().await {
        let payload = match serde_json::to_string(&frame) {
            Ok(s) => s,
            Err(e) => {
                warn!(%execution_id, error = %e, "failed to serialise frame");
                continue;
            }
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GitExecuteBody {
    pub data: serde_json::Value,
    pub credentials: Option<String>,
}

/// spec.md §6.2 `Execute`. `project` must be an owned project so a stray
/// caller cannot drive the git-worker image against someone else's files.
pub async fn git_execute(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((project_id, op)): Path<(Uuid, String)>,
    Json(body): Json<GitExecuteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !orchestrator::SUPPORTED_OPERATIONS.contains(&op.as_str()) {
        return Err(orchestrator::OrchestratorError::UnsupportedLanguage(op).into());
    }

    let project = state
        .projects
        .get(project_id)
        .await
        .map_err(|_| orchestrator::OrchestratorError::NotFound)?;
    if project.owner_id != claims.sub {
        return Err(orchestrator::OrchestratorError::Forbidden.into());
    }

    let scratch_root = std::env::temp_dir().join("orchestrator-git").join(execution_scratch_id());
    tokio::fs::create_dir_all(&scratch_root)
        .await
        .map_err(|e| orchestrator::OrchestratorError::Internal(e.to_string()))?;
    let project_prefix = format!("{project_id}/");

    let result = state
        .git_runner
        .execute(
            claims.sub,
            project_id,
            &op,
            body.data,
            body.credentials.as_deref().unwrap_or(""),
            &project_prefix,
            &scratch_root,
        )
        .await?;

    let _ = tokio::fs::remove_dir_all(&scratch_root).await;
    Ok(Json(serde_json::to_value(result).unwrap_or(json!({ "success": false }))))
}

fn execution_scratch_id() -> String {
    Uuid::new_v4().to_string()
}

fn actor_for(claims: &Claims) -> Actor {
    match claims.role {
        Role::Admin => Actor::Admin(claims.sub),
        Role::User => Actor::User(claims.sub),
    }
}

/// Seeds a profile and project for local/dev use, since the real
/// `ProfileStore`/`ProjectStore` population is owned by the out-of-scope web
/// surface (spec.md §1). Not mounted unless `DEV_SEED_ROUTES=1`.
pub async fn dev_seed(
    State(state): State<AppState>,
    Json(body): Json<DevSeedBody>,
) -> Json<serde_json::Value> {
    use store::{Profile, Project, UserStatus};

    state
        .profiles
        .seed(Profile {
            user_id: body.user_id,
            email: body.email,
            role: body.role,
            status: UserStatus::Active,
            storage_used_mb: 0,
            block_reason: None,
        })
        .await;
    state
        .projects
        .seed(Project {
            project_id: body.project_id,
            owner_id: body.user_id,
            github_url: None,
        })
        .await;
    let token = state.tokens.issue(&Claims {
        sub: body.user_id,
        email: body.email_for_claims,
        role: body.role,
    });
    Json(json!({ "success": true, "data": { "token": token } }))
}

#[derive(Debug, Deserialize)]
pub struct DevSeedBody {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub email: String,
    pub email_for_claims: String,
    pub role: Role,
}
