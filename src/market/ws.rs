use axum::{
    body::Bytes,
    extract::{
        FromRequestParts, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::request::Parts,
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error};

use super::api::{ApiError, ApiQuery, SharedState, USER_HEADER, resolve_actor};
use super::bidding::BiddingOutcome;
use super::models::*;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    RequestCreated {
        request: MarketRequest,
    },
    RequestUpdated {
        request: MarketRequest,
    },
    RequestStatusChanged {
        request_id: i64,
        from: RequestStatus,
        to: RequestStatus,
    },
    ApplicationSubmitted {
        request_id: i64,
        application: Application,
    },
    ApplicationStatusChanged {
        request_id: i64,
        application_id: i64,
        status: ApplicationStatus,
    },
    CommissionDue {
        payment: Payment,
    },
    PaymentCompleted {
        payment: Payment,
    },
    ChatMessage {
        message: ChatMessage,
    },
    Notification {
        notification: Notification,
    },
}

/// Who should receive a pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    Users(Vec<i64>),
}

impl Audience {
    pub fn user(id: i64) -> Self {
        Self::Users(vec![id])
    }

    /// Anonymous sockets (`None`) only see public events.
    pub fn includes(&self, user_id: Option<i64>) -> bool {
        match (self, user_id) {
            (Self::All, _) => true,
            (Self::Users(ids), Some(id)) => ids.contains(&id),
            (Self::Users(_), None) => false,
        }
    }
}

/// A serialized event on the broadcast channel, tagged with its audience.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub audience: Audience,
    pub payload: String,
}

// ── WebSocket handler ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: Option<i64>,
}

/// Who a socket receives private events for.
///
/// Identity comes from the same header as the REST API. A socket without
/// the header is anonymous. `?user_id=` is only accepted when it names the
/// header's user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber(pub Option<i64>);

impl FromRequestParts<SharedState> for Subscriber {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let user = resolve_actor(state, &parts.headers).await?;
        let ApiQuery(params) = ApiQuery::<WsParams>::from_request_parts(parts, state).await?;
        subscriber_id(user.map(|u| u.id), params.user_id).map(Subscriber)
    }
}

fn subscriber_id(resolved: Option<i64>, requested: Option<i64>) -> Result<Option<i64>, ApiError> {
    match (resolved, requested) {
        (resolved, None) => Ok(resolved),
        (Some(id), Some(requested)) if id == requested => Ok(Some(id)),
        (Some(_), Some(_)) => Err(ApiError::Forbidden(
            "user_id does not match the authenticated user".into(),
        )),
        (None, Some(_)) => Err(ApiError::Unauthorized(format!(
            "user_id requires the {} header",
            USER_HEADER
        ))),
    }
}

pub async fn ws_handler(
    Subscriber(user_id): Subscriber,
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, user_id))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<Outbound>, user_id: Option<i64>) {
    debug!(?user_id, "websocket connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, user_id).await;
    debug!(?user_id, "websocket disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards broadcast events addressed to `user_id`, watches the client
/// side for pongs and close frames, and pings every [`PING_INTERVAL`]. If
/// no Pong arrives within [`PONG_TIMEOUT`] the loop exits.
async fn run_socket_loop<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut rx: broadcast::Receiver<Outbound>,
    user_id: Option<i64>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(?user_id, "websocket pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !event.audience.includes(user_id) {
                            continue;
                        }
                        if sender.send(Message::Text(event.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(?user_id, skipped, "websocket receiver lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helpers ────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to the given audience.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<Outbound>, audience: Audience, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(payload) => {
            let _ = tx.send(Outbound { audience, payload });
        }
        Err(e) => {
            error!(error = %e, "failed to serialize websocket message");
        }
    }
}

/// Push everything a bidding operation changed.
///
/// Request status changes are public. Application, payment, and
/// notification events only reach the customer and the providers involved.
pub fn broadcast_outcome(tx: &broadcast::Sender<Outbound>, outcome: &BiddingOutcome) {
    let request = &outcome.request;

    if outcome.request_status_changed() {
        broadcast_message(
            tx,
            Audience::All,
            &WsMessage::RequestStatusChanged {
                request_id: request.id,
                from: outcome.previous_status,
                to: request.status,
            },
        );
    }

    for application in outcome.application.iter().chain(outcome.rejected.iter()) {
        let audience = Audience::Users(vec![request.customer_id, application.provider_id]);
        let msg = if application.status == ApplicationStatus::Applied {
            WsMessage::ApplicationSubmitted {
                request_id: request.id,
                application: application.clone(),
            }
        } else {
            WsMessage::ApplicationStatusChanged {
                request_id: request.id,
                application_id: application.id,
                status: application.status,
            }
        };
        broadcast_message(tx, audience, &msg);
    }

    if let Some(payment) = &outcome.payment {
        match payment.status {
            PaymentStatus::Pending => broadcast_message(
                tx,
                Audience::user(payment.payer_id),
                &WsMessage::CommissionDue {
                    payment: payment.clone(),
                },
            ),
            PaymentStatus::Paid => broadcast_message(
                tx,
                Audience::Users(vec![payment.payer_id, request.customer_id]),
                &WsMessage::PaymentCompleted {
                    payment: payment.clone(),
                },
            ),
            PaymentStatus::Cancelled => {}
        }
    }

    broadcast_notifications(tx, &outcome.notifications);
}

pub fn broadcast_notifications(tx: &broadcast::Sender<Outbound>, notifications: &[Notification]) {
    for notification in notifications {
        broadcast_message(
            tx,
            Audience::user(notification.user_id),
            &WsMessage::Notification {
                notification: notification.clone(),
            },
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────────
