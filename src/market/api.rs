use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts, Path, Query, Request, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::errors::MarketError;

use super::bidding::BiddingOutcome;
use super::commission::CommissionSchedule;
use super::db::{DbHandle, MarketDb, RequestFilter};
use super::models::*;
use super::ws::{
    Audience, Outbound, WsMessage, broadcast_message, broadcast_notifications, broadcast_outcome,
};

/// Header carrying the acting user's id. Authentication itself happens in
/// front of this service; the header is trusted as-is.
pub const USER_HEADER: &str = "x-user-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: broadcast::Sender<Outbound>,
    pub commission: CommissionSchedule,
}

impl AppState {
    pub fn new(db: MarketDb, commission: CommissionSchedule, capacity: usize) -> Self {
        let (events, _rx) = broadcast::channel(capacity.max(1));
        Self {
            db: DbHandle::new(db),
            events,
            commission,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub role: String,
}

#[derive(Deserialize, Default)]
pub struct ListRequestsQuery {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub mine: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateRequestBody {
    pub title: Option<String>,
    pub description: Option<String>,
    pub budget_cents: Option<i64>,
}

#[derive(Deserialize)]
pub struct SubmitApplicationBody {
    pub amount_cents: i64,
    pub message: Option<String>,
}

#[derive(Deserialize)]
pub struct PostMessageBody {
    pub body: String,
}

#[derive(Deserialize, Default)]
pub struct NotificationsQuery {
    pub unread: Option<bool>,
}

#[derive(Deserialize)]
pub struct QuoteQuery {
    pub amount_cents: i64,
}

/// Response body of every workflow transition.
#[derive(Serialize)]
pub struct TransitionResponse {
    pub request: MarketRequest,
    pub application: Option<Application>,
    pub payment: Option<Payment>,
    pub rejected: Vec<Application>,
}

impl From<BiddingOutcome> for TransitionResponse {
    fn from(outcome: BiddingOutcome) -> Self {
        Self {
            request: outcome.request,
            application: outcome.application,
            payment: outcome.payment,
            rejected: outcome.rejected,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        let msg = err.to_string();
        match err {
            MarketError::NotFound { .. } => ApiError::NotFound(msg),
            MarketError::Forbidden(_) => ApiError::Forbidden(msg),
            MarketError::Unauthorized(_) => ApiError::Unauthorized(msg),
            MarketError::InvalidTransition { .. } | MarketError::DuplicateApplication { .. } => {
                ApiError::Conflict(msg)
            }
            MarketError::Validation(_) | MarketError::InvalidSchedule(_) => {
                ApiError::BadRequest(msg)
            }
            MarketError::LockPoisoned => ApiError::Internal(msg),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<MarketError>() {
            Ok(market) => market.into(),
            Err(other) => ApiError::Internal(format!("{:#}", other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => error!(error = %message, "request failed"),
            StatusCode::CONFLICT | StatusCode::FORBIDDEN => {
                warn!(status = status.as_u16(), error = %message, "request rejected")
            }
            _ => {}
        }
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Extractors ────────────────────────────────────────────────────────

/// [`Json`] body that rejects with an [`ApiError`].
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// [`Path`] parameters that reject with an [`ApiError`].
pub struct ApiPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// [`Query`] string that rejects with an [`ApiError`].
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

// ── Acting user ───────────────────────────────────────────────────────

/// The authenticated caller, resolved from [`USER_HEADER`].
pub struct Actor(pub User);

impl FromRequestParts<SharedState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        resolve_actor(state, &parts.headers)
            .await?
            .map(Actor)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", USER_HEADER)))
    }
}

/// `Ok(None)` when the header is absent; an unknown or malformed id is an error.
pub(super) async fn resolve_actor(
    state: &SharedState,
    headers: &HeaderMap,
) -> Result<Option<User>, ApiError> {
    let Some(raw) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    let id: i64 = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("malformed {} header", USER_HEADER)))?;
    let user = state.db.call(move |db| db.get_user(id)).await?;
    match user {
        Some(user) => Ok(Some(user)),
        None => Err(ApiError::Unauthorized(format!("unknown user {}", id))),
    }
}

fn require_admin(user: &User) -> Result<(), ApiError> {
    if user.role == Role::Admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin role required".into()))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{id}", get(get_user))
        .route("/api/me", get(me))
        .route("/api/me/applications", get(my_applications))
        .route("/api/me/payments", get(my_payments))
        .route("/api/requests", get(list_requests).post(create_request))
        .route("/api/requests/{id}", get(get_request).patch(update_request))
        .route("/api/requests/{id}/close", post(close_request))
        .route("/api/requests/{id}/applications", post(submit_application))
        .route("/api/applications/{id}/select", post(select_application))
        .route("/api/applications/{id}/confirm", post(confirm_selection))
        .route("/api/applications/{id}/decline", post(decline_selection))
        .route("/api/applications/{id}/reject", post(reject_application))
        .route("/api/applications/{id}/withdraw", post(withdraw_application))
        .route(
            "/api/applications/{id}/messages",
            get(list_messages).post(post_message),
        )
        .route("/api/payments/{id}", get(get_payment))
        .route("/api/payments/{id}/pay", post(pay_commission))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/read-all", post(mark_all_notifications_read))
        .route("/api/notifications/{id}/read", post(mark_notification_read))
        .route("/api/commission/quote", get(commission_quote))
        .route("/api/stats", get(stats))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Run a workflow operation on the blocking pool and push its events.
async fn run_transition<F>(
    state: &SharedState,
    op: F,
) -> Result<Json<TransitionResponse>, ApiError>
where
    F: FnOnce(&MarketDb) -> anyhow::Result<BiddingOutcome> + Send + 'static,
{
    let outcome = state.db.call(op).await?;
    broadcast_outcome(&state.events, &outcome);
    Ok(Json(outcome.into()))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let role = Role::from_str(&req.role).map_err(ApiError::BadRequest)?;
    if role == Role::Admin {
        let caller = resolve_actor(&state, &headers).await?;
        match caller {
            Some(user) => require_admin(&user)?,
            None => return Err(ApiError::Forbidden("only admins can create admins".into())),
        }
    }
    let user = state
        .db
        .call(move |db| db.create_user(&req.name, &req.email, role))
        .await?;
    info!(user_id = user.id, role = %user.role, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_users(
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    let users = state.db.call(|db| db.list_users()).await?;
    Ok(Json(users))
}

async fn get_user(
    State(state): State<SharedState>,
    Actor(_): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.db.call(move |db| db.require_user(id)).await?;
    Ok(Json(user))
}

async fn me(Actor(user): Actor) -> Json<User> {
    Json(user)
}

async fn list_requests(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiQuery(query): ApiQuery<ListRequestsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = RequestFilter {
        kind: query
            .kind
            .as_deref()
            .map(RequestKind::from_str)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        status: query
            .status
            .as_deref()
            .map(RequestStatus::from_str)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        customer_id: query.mine.unwrap_or(false).then_some(user.id),
    };
    let requests = state.db.call(move |db| db.list_requests(&filter)).await?;
    Ok(Json(requests))
}

async fn create_request(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiJson(req): ApiJson<NewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state
        .db
        .call(move |db| db.create_request(user.id, &req))
        .await?;
    info!(request_id = request.id, kind = %request.kind, "request created");
    broadcast_message(
        &state.events,
        Audience::All,
        &WsMessage::RequestCreated {
            request: request.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(request)))
}

async fn get_request(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| db.get_request_detail(id, &user))
        .await?;
    Ok(Json(detail))
}

async fn update_request(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state
        .db
        .call(move |db| {
            db.update_request(
                id,
                user.id,
                req.title.as_deref(),
                req.description.as_deref(),
                req.budget_cents,
            )
        })
        .await?;
    broadcast_message(
        &state.events,
        Audience::All,
        &WsMessage::RequestUpdated {
            request: request.clone(),
        },
    );
    Ok(Json(request))
}

async fn close_request(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    run_transition(&state, move |db| db.close_request(id, user.id)).await
}

async fn submit_application(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(request_id): ApiPath<i64>,
    ApiJson(req): ApiJson<SubmitApplicationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let message = req.message.unwrap_or_default();
    let response = run_transition(&state, move |db| {
        db.submit_application(request_id, user.id, req.amount_cents, &message)
    })
    .await?;
    Ok((StatusCode::CREATED, response))
}

async fn my_applications(
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let applications = state
        .db
        .call(move |db| db.list_applications_for_provider(user.id))
        .await?;
    Ok(Json(applications))
}

async fn select_application(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    run_transition(&state, move |db| db.select_application(id, user.id)).await
}

async fn confirm_selection(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state.commission.clone();
    run_transition(&state, move |db| db.confirm_selection(id, user.id, &schedule)).await
}

async fn decline_selection(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    run_transition(&state, move |db| db.decline_selection(id, user.id)).await
}

async fn reject_application(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    run_transition(&state, move |db| db.reject_application(id, user.id)).await
}

async fn withdraw_application(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    run_transition(&state, move |db| db.withdraw_application(id, user.id)).await
}

async fn list_messages(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .db
        .call(move |db| db.list_chat_messages(id, &user))
        .await?;
    Ok(Json(messages))
}

async fn post_message(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<PostMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let posted = state
        .db
        .call(move |db| db.create_chat_message(id, user.id, &req.body))
        .await?;
    broadcast_message(
        &state.events,
        Audience::Users(posted.participants.to_vec()),
        &WsMessage::ChatMessage {
            message: posted.message.clone(),
        },
    );
    broadcast_notifications(&state.events, std::slice::from_ref(&posted.notification));
    Ok((StatusCode::CREATED, Json(posted.message)))
}

async fn get_payment(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let payment = state
        .db
        .call(move |db| {
            let payment = db.require_payment(id)?;
            let application = db.require_application(payment.application_id)?;
            let request = db.require_request(application.request_id)?;
            let party = user.id == payment.payer_id || user.id == request.customer_id;
            if !party && user.role != Role::Admin {
                return Err(MarketError::forbidden("not a party to this payment").into());
            }
            Ok(payment)
        })
        .await?;
    Ok(Json(payment))
}

async fn pay_commission(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    run_transition(&state, move |db| db.pay_commission(id, user.id)).await
}

async fn my_payments(
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let payments = state
        .db
        .call(move |db| db.list_payments_for_user(user.id))
        .await?;
    Ok(Json(payments))
}

async fn list_notifications(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiQuery(query): ApiQuery<NotificationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let unread_only = query.unread.unwrap_or(false);
    let notifications = state
        .db
        .call(move |db| db.list_notifications(user.id, unread_only))
        .await?;
    Ok(Json(notifications))
}

async fn mark_notification_read(
    State(state): State<SharedState>,
    Actor(user): Actor,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.mark_notification_read(id, user.id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_notifications_read(
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state
        .db
        .call(move |db| db.mark_all_notifications_read(user.id))
        .await?;
    Ok(Json(serde_json::json!({"updated": updated})))
}

async fn commission_quote(
    State(state): State<SharedState>,
    ApiQuery(query): ApiQuery<QuoteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let breakdown = state.commission.quote(query.amount_cents)?;
    Ok(Json(breakdown))
}

async fn stats(
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    let stats = state.db.call(|db| db.get_stats()).await?;
    Ok(Json(stats))
}

// ── Tests ─────────────────────────────────────────────────────────────
