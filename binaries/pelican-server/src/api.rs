//! The JSON boundary: thin axum handlers translating requests into core
//! calls. Errors leave as `{"status": "error", "code": …, "message": …}`
//! with HTTP-compatible status codes; security failures share one generic
//! message.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::header::Header;
use pelican_structs::message::{InboundMessage, MessageId};
use pelican_structs::task::{SendTask, TaskId, TaskKind};

use crate::acceptor::Acceptor;
use crate::backends::Backends;
use crate::breaker::SharedBreaker;
use crate::credentials::{CredentialService, LoginTokens};
use crate::directory::MailboxDirectory;
use crate::inbox::Inbox;
use crate::metrics::{SendMetrics, WorkerSlots};
use crate::queue::SendQueue;
use crate::ratelimit::RateLimiter;
use crate::tokens::Claims;

#[derive(Clone)]
pub struct AppState {
    pub credentials: Arc<CredentialService>,
    pub directory: Arc<MailboxDirectory>,
    pub acceptor: Arc<Acceptor>,
    pub inbox: Arc<Inbox>,
    pub queue: Arc<SendQueue>,
    pub backends: Arc<Backends>,
    pub metrics: Arc<SendMetrics>,
    pub slots: Arc<WorkerSlots>,
    pub breaker: Arc<SharedBreaker>,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/revoke", post(revoke))
        .route("/users", post(create_user))
        .route("/users/{email}", delete(delete_user))
        .route("/users/{email}/totp", post(enable_totp).delete(disable_totp))
        .route("/send", post(send))
        .route("/inbound", post(inbound))
        .route("/mailboxes", get(list_mailboxes).post(create_mailbox))
        .route("/mailboxes/{email}", delete(delete_mailbox))
        .route("/mailboxes/{email}/forwarding", put(update_forwarding))
        .route("/mailboxes/{email}/messages", get(list_messages))
        .route("/mailboxes/{email}/messages/{id}", get(fetch_message).delete(delete_message))
        .route("/status", get(status))
        .with_state(state)
}

/// A fault leaving through HTTP.
pub struct ApiError(Fault);

impl From<Fault> for ApiError {
    fn from(fault: Fault) -> Self {
        Self(fault)
    }
}

fn http_status(fault: &Fault) -> StatusCode {
    match fault {
        Fault::WeakPassword | Fault::ValidationFailed(_) => StatusCode::BAD_REQUEST,
        Fault::InvalidCredentials
        | Fault::InvalidTotp
        | Fault::TotpRequired
        | Fault::TokenExpired
        | Fault::TokenRevoked => StatusCode::UNAUTHORIZED,
        Fault::Locked => StatusCode::FORBIDDEN,
        Fault::UnknownUser | Fault::UnknownRecipient => StatusCode::NOT_FOUND,
        Fault::QueueFull | Fault::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        Fault::TransportDial(_)
        | Fault::TransportTls(_)
        | Fault::TransportAuth(_)
        | Fault::TransportProtocol(_) => StatusCode::BAD_GATEWAY,
        Fault::DecryptAuthFailure => StatusCode::INTERNAL_SERVER_ERROR,
        Fault::BreakerOpen | Fault::BackendUnavailable | Fault::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "code": self.0.code(),
            "message": self.0.public_message(),
        });
        (http_status(&self.0), Json(body)).into_response()
    }
}

/// Pull the bearer token from the request and fully verify it.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, Fault> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(Fault::InvalidCredentials)?;
    state.credentials.verify(token).await
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Claims, Fault> {
    let claims = authenticate(state, headers).await?;
    if !claims.admin {
        return Err(Fault::InvalidCredentials);
    }
    Ok(claims)
}

/// Admin, or the user owning the mailbox.
async fn require_mailbox_access(
    state: &AppState,
    headers: &HeaderMap,
    mailbox: &EmailAddress,
) -> Result<Claims, Fault> {
    let claims = authenticate(state, headers).await?;
    if claims.admin {
        return Ok(claims);
    }
    let record = state
        .directory
        .lookup(mailbox)
        .await?
        .ok_or(Fault::UnknownRecipient)?;
    if record.owner != claims.sub {
        return Err(Fault::InvalidCredentials);
    }
    Ok(claims)
}

#[derive(Deserialize)]
struct LoginRequest {
    email: EmailAddress,
    password: String,
    totp: Option<String>,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginTokens>, ApiError> {
    let tokens = state
        .credentials
        .login(&request.email, &request.password, request.totp.as_deref())
        .await?;
    Ok(Json(tokens))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh: String,
}

async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<LoginTokens>, ApiError> {
    Ok(Json(state.credentials.refresh(&request.refresh).await?))
}

#[derive(Deserialize)]
struct RevokeRequest {
    token: String,
}

async fn revoke(
    State(state): State<AppState>,
    Json(request): Json<RevokeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.credentials.revoke(&request.token).await?;
    Ok(Json(json!({"status": "ok"})))
}

#[derive(Deserialize)]
struct CreateUserRequest {
    email: EmailAddress,
    password: String,
    #[serde(default)]
    is_admin: bool,
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateUserRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers).await?;
    state
        .credentials
        .create_user(&request.email, &request.password, request.is_admin)
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(email): Path<EmailAddress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers).await?;
    state.credentials.delete_user(&email).await?;
    Ok(Json(json!({"status": "ok"})))
}

async fn enable_totp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(email): Path<EmailAddress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    if !claims.admin && claims.sub != email {
        return Err(Fault::InvalidCredentials.into());
    }
    let secret = state.credentials.enable_totp(&email).await?;
    Ok(Json(json!({"status": "ok", "secret": secret})))
}

async fn disable_totp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(email): Path<EmailAddress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    if !claims.admin && claims.sub != email {
        return Err(Fault::InvalidCredentials.into());
    }
    state.credentials.disable_totp(&email).await?;
    Ok(Json(json!({"status": "ok"})))
}

#[derive(Deserialize)]
struct SendRequest {
    from: EmailAddress,
    to: Vec<EmailAddress>,
    subject: String,
    body: String,
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Serialize)]
struct SendResponse {
    status: &'static str,
    tasks: Vec<TaskId>,
}

/// Split recipients into local mailboxes and remote addresses; local
/// copies and outgoing mail travel as separate tasks through the same
/// queue.
async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    if !claims.admin && claims.sub != request.from {
        return Err(Fault::InvalidCredentials.into());
    }
    if request.to.is_empty() {
        return Err(Fault::ValidationFailed("no recipients".into()).into());
    }

    let mut local = Vec::new();
    let mut remote = Vec::new();
    for recipient in &request.to {
        let is_local = state
            .directory
            .lookup(recipient)
            .await?
            .is_some_and(|mailbox| mailbox.active);
        if is_local {
            local.push(recipient.clone());
        } else {
            remote.push(recipient.clone());
        }
    }

    let mut tasks = Vec::new();
    for (kind, recipients) in [
        (TaskKind::IncomingLocalCopy, local),
        (TaskKind::Outgoing, remote),
    ] {
        if recipients.is_empty() {
            continue;
        }
        let task = SendTask::new(
            kind,
            request.from.clone(),
            recipients,
            request.subject.clone(),
            request.body.clone(),
        )
        .with_headers(request.headers.clone());
        tasks.push(state.queue.submit(task).await?);
    }
    Ok(Json(SendResponse {
        status: "ok",
        tasks,
    }))
}

/// Entry point for the SMTP front-end: a delivered message with normalized
/// addresses and a single UTF-8 body part.
async fn inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(message): Json<InboundMessage>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let outcome = state.acceptor.accept(message).await?;
    Ok(Json(json!({"status": "ok", "outcome": outcome})))
}

async fn list_mailboxes(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let listings = state.inbox.list_mailboxes().await?;
    Ok(Json(json!({"status": "ok", "mailboxes": listings})))
}

#[derive(Deserialize)]
struct CreateMailboxRequest {
    email: EmailAddress,
    password: String,
    #[serde(default)]
    description: String,
}

async fn create_mailbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateMailboxRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    state
        .directory
        .create_mailbox(&request.email, &request.password, &request.description, &claims.sub)
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

async fn delete_mailbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(email): Path<EmailAddress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_mailbox_access(&state, &headers, &email).await?;
    state.directory.delete_mailbox(&email).await?;
    Ok(Json(json!({"status": "ok"})))
}

#[derive(Deserialize)]
struct ForwardingRequest {
    forward_to: Option<EmailAddress>,
    enabled: bool,
    #[serde(default = "default_keep_original")]
    keep_original: bool,
}

fn default_keep_original() -> bool {
    true
}

async fn update_forwarding(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(email): Path<EmailAddress>,
    Json(request): Json<ForwardingRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_mailbox_access(&state, &headers, &email).await?;
    state
        .directory
        .update_forwarding(
            &email,
            request.forward_to.as_ref(),
            request.enabled,
            request.keep_original,
        )
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
    q: Option<String>,
}

fn default_limit() -> u32 {
    50
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(email): Path<EmailAddress>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_mailbox_access(&state, &headers, &email).await?;
    let messages = match &query.q {
        Some(needle) => state.inbox.search(&email, needle).await?,
        None => state.inbox.list_messages(&email, query.page, query.limit).await?,
    };
    Ok(Json(json!({"status": "ok", "messages": messages})))
}

async fn fetch_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((email, id)): Path<(EmailAddress, MessageId)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_mailbox_access(&state, &headers, &email).await?;
    let message = state.inbox.fetch(&email, &id).await?;
    Ok(Json(json!({"status": "ok", "message": message})))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((email, id)): Path<(EmailAddress, MessageId)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_mailbox_access(&state, &headers, &email).await?;
    state.inbox.delete(&email, &id).await?;
    Ok(Json(json!({"status": "ok"})))
}

/// The C11 readout: send counters, breaker and rate-limit state, queue
/// depths, worker slots, backend health.
async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let (breaker_state, consecutive_failures) = state.breaker.snapshot();
    let depths = state.queue.depths().await?;
    Ok(Json(json!({
        "status": "ok",
        "send": state.metrics.snapshot(Instant::now()),
        "breaker": {
            "state": breaker_state.as_str(),
            "consecutive_failures": consecutive_failures,
        },
        "rate_limit": state.limiter.snapshot(),
        "queue": depths,
        "workers": state.slots.snapshot(),
        "backends": state.backends.snapshot(),
    })))
}
