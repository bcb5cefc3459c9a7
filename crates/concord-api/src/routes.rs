use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use concord_core::models::{
    ArtifactStatus, CascadePreviewItem, ConflictDecision, ConflictId, CoordinationLogEntry,
    CoordinationRule, DocumentSyncState, LockAttempt, LockStatus, NewRule, PresenceUpdate,
    RuleId, RuleUpdate, SectionLock, SyncConflict, SyncHealth,
};
use concord_core::sync::PullResult;
use concord_core::{Actor, Coordinator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, query_token, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    verifier: Arc<JwtVerifier>,
    coordinator: Coordinator,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, coordinator: Coordinator) -> Self {
        Self {
            verifier: Arc::new(JwtVerifier::new(&config)),
            coordinator,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route(
            "/rules/{id}",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .route("/cascades/preview", post(preview_cascade))
        .route("/cascades/apply", post(apply_cascade))
        .route("/cascades/log", get(cascade_log))
        .route("/opportunities/{opportunity_id}/locks", get(list_locks))
        .route(
            "/opportunities/{opportunity_id}/locks/{section_id}",
            get(lock_status).post(acquire_lock).delete(release_lock),
        )
        .route(
            "/opportunities/{opportunity_id}/locks/{section_id}/extend",
            post(extend_lock),
        )
        .route("/opportunities/{opportunity_id}/channel", get(channel))
        .route("/opportunities/{opportunity_id}/artifacts", get(artifacts))
        .route(
            "/documents/{document_id}/link",
            post(link_document).delete(unlink_document),
        )
        .route("/documents/{document_id}/push", post(push_document))
        .route("/documents/{document_id}/pull", post(pull_document))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}", get(get_conflict))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let actor = {
        let token = match extract_bearer_token(request.headers()) {
            Ok(token) => token,
            Err(error) => query_token(request.uri().query()).ok_or(error)?,
        };
        state.verifier.verify(token)?
    };
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

/// Locks and presence are keyed per organization and opportunity.
fn scope_for(actor: &Actor, opportunity_id: &str) -> String {
    format!("{}/{}", actor.organization_id, opportunity_id.trim())
}

fn parse_rule_id(raw: &str) -> Result<RuleId, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid rule id '{raw}'")))
}

fn parse_conflict_id(raw: &str) -> Result<ConflictId, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid conflict id '{raw}'")))
}

// Rules

#[derive(Debug, Deserialize)]
struct CreateRuleRequest {
    source_doc_type: String,
    source_field_path: String,
    target_doc_type: String,
    target_field_path: String,
    transform_type: String,
    #[serde(default)]
    description: Option<String>,
}

async fn list_rules(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Vec<CoordinationRule>>, AppError> {
    let rules = state
        .coordinator
        .rules
        .get_rules_by_organization(&actor.organization_id)
        .await?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<CoordinationRule>), AppError> {
    let input = NewRule {
        organization_id: actor.organization_id.clone(),
        source_doc_type: request.source_doc_type,
        source_field_path: request.source_field_path,
        target_doc_type: request.target_doc_type,
        target_field_path: request.target_field_path,
        transform_type: request.transform_type,
        description: request.description,
    };
    let rule = state.coordinator.rules.create_rule(&actor, input).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<CoordinationRule>, AppError> {
    let id = parse_rule_id(&id)?;
    let rule = state.coordinator.rules.get_rule(&id).await?;
    if rule.organization_id != actor.organization_id {
        return Err(AppError::Forbidden(format!(
            "rule {id} belongs to another organization"
        )));
    }
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(update): Json<RuleUpdate>,
) -> Result<Json<CoordinationRule>, AppError> {
    let id = parse_rule_id(&id)?;
    let rule = state
        .coordinator
        .rules
        .update_rule(&actor, &id, update)
        .await?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<CoordinationRule>, AppError> {
    let id = parse_rule_id(&id)?;
    let rule = state.coordinator.rules.delete_rule(&actor, &id).await?;
    Ok(Json(rule))
}

// Cascades

#[derive(Debug, Deserialize)]
struct PreviewRequest {
    trigger_document_id: String,
    new_value: Value,
    #[serde(default)]
    rule_id: Option<String>,
    #[serde(default)]
    field_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    rule_id: String,
    trigger_document_id: String,
    new_value: Value,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    rule_id: Option<String>,
    limit: Option<usize>,
}

async fn preview_cascade(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<Vec<CascadePreviewItem>>, AppError> {
    let cascades = &state.coordinator.cascades;
    let items = match (request.rule_id.as_deref(), request.field_path.as_deref()) {
        (Some(rule_id), None) => {
            let rule_id = parse_rule_id(rule_id)?;
            cascades
                .preview_cascade(
                    &actor,
                    &rule_id,
                    &request.trigger_document_id,
                    &request.new_value,
                )
                .await?
        }
        (None, Some(field_path)) => {
            cascades
                .preview_field_change(
                    &actor,
                    &request.trigger_document_id,
                    field_path,
                    &request.new_value,
                )
                .await?
        }
        _ => {
            return Err(AppError::bad_request(
                "exactly one of `rule_id` or `field_path` is required",
            ))
        }
    };
    Ok(Json(items))
}

async fn apply_cascade(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<ApplyRequest>,
) -> Result<Json<CoordinationLogEntry>, AppError> {
    let rule_id = parse_rule_id(&request.rule_id)?;
    let entry = state
        .coordinator
        .cascades
        .apply_cascade(
            &actor,
            &rule_id,
            &request.trigger_document_id,
            &request.new_value,
        )
        .await?;
    Ok(Json(entry))
}

async fn cascade_log(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<CoordinationLogEntry>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    let cascades = &state.coordinator.cascades;
    let entries = match query.rule_id.as_deref() {
        Some(rule_id) => {
            let rule_id = parse_rule_id(rule_id)?;
            cascades.log_for_rule(&actor, &rule_id, limit).await?
        }
        None => {
            cascades
                .log_for_organization(&actor.organization_id, limit)
                .await?
        }
    };
    Ok(Json(entries))
}

// Locks

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    released: bool,
}

async fn list_locks(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(opportunity_id): Path<String>,
) -> Json<Vec<SectionLock>> {
    let locks = state
        .coordinator
        .locks
        .manager(&scope_for(&actor, &opportunity_id))
        .await;
    Json(locks.list_locks().await)
}

async fn lock_status(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((opportunity_id, section_id)): Path<(String, String)>,
) -> Json<LockStatus> {
    let locks = state
        .coordinator
        .locks
        .manager(&scope_for(&actor, &opportunity_id))
        .await;
    Json(locks.is_locked_by_other(&section_id, &actor.user_id).await)
}

async fn acquire_lock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((opportunity_id, section_id)): Path<(String, String)>,
) -> (StatusCode, Json<LockAttempt>) {
    let locks = state
        .coordinator
        .locks
        .manager(&scope_for(&actor, &opportunity_id))
        .await;
    let attempt = locks
        .acquire(&section_id, &actor.user_id, &actor.display_name)
        .await;
    let status = if attempt.is_acquired() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(attempt))
}

async fn release_lock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((opportunity_id, section_id)): Path<(String, String)>,
) -> Json<ReleaseResponse> {
    let locks = state
        .coordinator
        .locks
        .manager(&scope_for(&actor, &opportunity_id))
        .await;
    Json(ReleaseResponse {
        released: locks.release(&section_id, &actor.user_id).await,
    })
}

async fn extend_lock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((opportunity_id, section_id)): Path<(String, String)>,
) -> Result<Json<SectionLock>, AppError> {
    let locks = state
        .coordinator
        .locks
        .manager(&scope_for(&actor, &opportunity_id))
        .await;
    locks
        .extend(&section_id, &actor.user_id)
        .await
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(format!("no live lock on section {section_id} held by caller"))
        })
}

// Live channel

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    avatar: Option<String>,
}

/// Frames a client may send on the channel socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Presence(PresenceUpdate),
    AcquireLock { section_id: String },
    ReleaseLock { section_id: String },
    ExtendLock { section_id: String },
}

/// Replies addressed to one socket; broadcasts travel as channel events.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
enum DirectMessage {
    LockDenied {
        section_id: String,
        locked_by: String,
        expires_at: i64,
    },
    Error {
        message: String,
    },
}

async fn channel(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(opportunity_id): Path<String>,
    Query(query): Query<ChannelQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let scope = scope_for(&actor, &opportunity_id);
    upgrade.on_upgrade(move |socket| run_channel(state, actor, scope, query.avatar, socket))
}

async fn run_channel(
    state: AppState,
    actor: Actor,
    scope: String,
    avatar_ref: Option<String>,
    mut socket: WebSocket,
) {
    let presence = &state.coordinator.presence;
    let mut handle = presence
        .join(&scope, &actor.user_id, &actor.display_name, avatar_ref)
        .await;

    loop {
        tokio::select! {
            event = handle.recv() => {
                let Some(event) = event else {
                    break;
                };
                if send_json(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let reply = match handle_client_message(&state, &actor, &scope, &handle, text.as_str()).await {
                    Ok(reply) => reply,
                    Err(error) => Some(DirectMessage::Error {
                        message: error.to_string(),
                    }),
                };
                if let Some(reply) = reply {
                    if send_json(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    presence.leave(handle).await;
}

async fn handle_client_message(
    state: &AppState,
    actor: &Actor,
    scope: &str,
    handle: &concord_core::presence::PresenceHandle,
    text: &str,
) -> Result<Option<DirectMessage>, AppError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|error| AppError::bad_request(format!("unreadable channel message: {error}")))?;
    let locks = state.coordinator.locks.manager(scope).await;

    match message {
        ClientMessage::Presence(update) => {
            state.coordinator.presence.update(handle, update).await?;
            Ok(None)
        }
        ClientMessage::AcquireLock { section_id } => {
            match locks
                .acquire(&section_id, &actor.user_id, &actor.display_name)
                .await
            {
                LockAttempt::Acquired { .. } => Ok(None),
                LockAttempt::Denied {
                    locked_by,
                    expires_at,
                } => Ok(Some(DirectMessage::LockDenied {
                    section_id,
                    locked_by,
                    expires_at,
                })),
            }
        }
        ClientMessage::ReleaseLock { section_id } => {
            locks.release(&section_id, &actor.user_id).await;
            Ok(None)
        }
        ClientMessage::ExtendLock { section_id } => {
            if locks.extend(&section_id, &actor.user_id).await.is_some() {
                Ok(None)
            } else {
                Err(AppError::NotFound(format!(
                    "no live lock on section {section_id} held by caller"
                )))
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, payload: &impl Serialize) -> Result<(), axum::Error> {
    let text = serde_json::to_string(payload).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

// Documents and sync

#[derive(Debug, Deserialize)]
struct LinkRequest {
    provider: String,
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct ConflictQuery {
    #[serde(default = "default_pending_only")]
    pending_only: bool,
}

const fn default_pending_only() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ArtifactsResponse {
    artifacts: Vec<ArtifactStatus>,
    health: SyncHealth,
}

async fn link_document(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(document_id): Path<String>,
    Json(request): Json<LinkRequest>,
) -> Result<Json<DocumentSyncState>, AppError> {
    let sync_state = state
        .coordinator
        .sync
        .link_document(&actor, &document_id, &request.provider, &request.file_id)
        .await?;
    Ok(Json(sync_state))
}

async fn unlink_document(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentSyncState>, AppError> {
    let sync_state = state
        .coordinator
        .sync
        .unlink_document(&actor, &document_id)
        .await?;
    Ok(Json(sync_state))
}

async fn push_document(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentSyncState>, AppError> {
    let sync_state = state
        .coordinator
        .sync
        .push_document(&actor, &document_id)
        .await?;
    Ok(Json(sync_state))
}

async fn pull_document(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(document_id): Path<String>,
) -> Result<Json<PullResult>, AppError> {
    let result = state
        .coordinator
        .sync
        .pull_document(&actor, &document_id)
        .await?;
    Ok(Json(result))
}

async fn list_conflicts(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<ConflictQuery>,
) -> Result<Json<Vec<SyncConflict>>, AppError> {
    let conflicts = state
        .coordinator
        .sync
        .list_conflicts(&actor.organization_id, query.pending_only)
        .await?;
    Ok(Json(conflicts))
}

async fn get_conflict(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<SyncConflict>, AppError> {
    let id = parse_conflict_id(&id)?;
    let conflict = state.coordinator.sync.get_conflict(&actor, &id).await?;
    Ok(Json(conflict))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(decision): Json<ConflictDecision>,
) -> Result<Json<SyncConflict>, AppError> {
    let id = parse_conflict_id(&id)?;
    let conflict = state
        .coordinator
        .sync
        .resolve_conflict(&actor, &id, decision)
        .await?;
    Ok(Json(conflict))
}

async fn artifacts(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(opportunity_id): Path<String>,
) -> Result<Json<ArtifactsResponse>, AppError> {
    let artifacts = state
        .coordinator
        .sync
        .get_artifact_statuses(&actor.organization_id, opportunity_id.trim())
        .await?;
    let health = SyncHealth::from_statuses(&artifacts);
    Ok(Json(ArtifactsResponse { artifacts, health }))
}
