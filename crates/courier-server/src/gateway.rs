//! Socket handshake, admission and the per-connection loop.
//!
//! The credential is checked once, before the upgrade. A connection that
//! fails authentication never reaches the socket loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_shared::auth::{verify_bearer, AuthClaims};
use courier_shared::error::AuthError;
use courier_shared::protocol::{AuthSuccess, ServerEvent, ServerFrame};
use courier_shared::{Identity, Room};

use crate::error::{GatewayError, ServerError};
use crate::policy::{on_store_error, Operation};
use crate::rooms::ConnectionInfo;
use crate::session::Session;
use crate::state::AppState;

/// Turns a bearer credential into verified claims.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<AuthClaims, AuthError>;
}

/// Verifies tokens signed by the account service's Ed25519 key.
pub struct SignedTokenVerifier {
    issuer_pubkey: [u8; 32],
}

impl SignedTokenVerifier {
    pub fn new(issuer_pubkey: [u8; 32]) -> Self {
        Self { issuer_pubkey }
    }
}

#[async_trait]
impl TokenVerifier for SignedTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<AuthClaims, AuthError> {
        verify_bearer(bearer, &self.issuer_pubkey)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
}

/// Token from `?token=` or an `Authorization: Bearer` header.
pub fn extract_token(query: &HandshakeQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Verify the credential and resolve the identity. The stored profile
/// wins; without one the identity is built from the claims.
pub async fn authenticate(state: &AppState, token: Option<&str>) -> Result<Identity, GatewayError> {
    let token = token.ok_or(AuthError::MissingToken)?;
    let claims = state.verifier.verify(token).await?;

    let profile = match state.store.get_profile(&claims.user_id).await {
        Ok(profile) => profile,
        Err(e) => {
            // profile lookups always degrade
            let policy = on_store_error(Operation::ProfileLookup, &e);
            warn!(user = %claims.user_id, error = %e, ?policy, "profile lookup failed");
            None
        }
    };

    Ok(match profile {
        Some(profile) => profile,
        None => {
            let mut identity = Identity::from_claims(claims.user_id, claims.email);
            if let Some(tier) = claims.tier {
                identity.tier = tier;
            }
            identity
        }
    })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    let token = extract_token(&query, &headers);
    let identity = match authenticate(&state, token.as_deref()).await {
        Ok(identity) => identity,
        Err(GatewayError::Authentication(e)) => {
            warn!(error = %e, "handshake rejected");
            return ServerError::Unauthorized(e).into_response();
        }
        Err(e) => {
            warn!(error = %e, "handshake failed");
            return ServerError::Internal(e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| run_connection(socket, state, identity))
}

/// Register an authenticated connection: user and tier rooms, the
/// `auth:success` greeting, then presence.
pub async fn admit(
    state: &AppState,
    identity: Identity,
    tx: mpsc::UnboundedSender<ServerFrame>,
) -> ConnectionInfo {
    let info = ConnectionInfo {
        id: Uuid::new_v4(),
        identity,
    };
    let user = info.user_id().clone();

    state.rooms.register(info.id, user.clone(), tx).await;
    state.rooms.join(&info.id, Room::User(user.clone())).await;
    state.rooms.join(&info.id, Room::Tier(info.identity.tier)).await;

    state
        .rooms
        .send_to(
            &info.id,
            ServerEvent::AuthSuccess(AuthSuccess {
                user_id: user.clone(),
                tier: info.identity.tier,
                display_name: info.identity.display_name.clone(),
                photo_url: info.identity.photo_url.clone(),
                connected_at: Utc::now().timestamp_millis(),
            })
            .into(),
        )
        .await;

    state.presence.connect(info.id, &info.identity).await;
    info!(user = %user, connection = %info.id, tier = %info.identity.tier, "connection admitted");
    info
}

async fn run_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let info = admit(&state, identity, tx).await;
    let mut session = Session::new(state, info);

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Binary(_)) => {
                debug!(connection = %session.info().id, "ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(connection = %session.info().id, error = %e, "socket error");
                break;
            }
        }
    }

    session.close().await;
    // the registry dropped the sender, so the writer drains and exits
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        debug!("socket writer did not finish in time");
    }
}

/// Shared verifier for the configured issuer key.
pub fn verifier_from_key(issuer_pubkey: [u8; 32]) -> Arc<dyn TokenVerifier> {
    Arc::new(SignedTokenVerifier::new(issuer_pubkey))
}
