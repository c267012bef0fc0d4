//! Online presence.
//!
//! A user is online while at least one of their connections is open.
//! Transitions are broadcast to every connection as `presence:update`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use courier_shared::protocol::{OnlineUsers, PresenceUpdate, ServerEvent, ServerFrame};
use courier_shared::{Identity, UserId};

use crate::fanout::FanOut;
use crate::rooms::{ConnectionId, RoomRegistry};

#[derive(Clone)]
pub struct PresenceEngine {
    online: Arc<RwLock<HashMap<UserId, HashSet<ConnectionId>>>>,
    rooms: RoomRegistry,
    fanout: Arc<dyn FanOut>,
}

impl PresenceEngine {
    pub fn new(rooms: RoomRegistry, fanout: Arc<dyn FanOut>) -> Self {
        Self {
            online: Arc::new(RwLock::new(HashMap::new())),
            rooms,
            fanout,
        }
    }

    /// Register an admitted connection. The connection receives the list
    /// of online users; the first connection of a user also announces
    /// them to everybody.
    pub async fn connect(&self, connection: ConnectionId, identity: &Identity) {
        let (first, users) = {
            let mut online = self.online.write().await;
            let connections = online.entry(identity.user_id.clone()).or_default();
            let first = connections.is_empty();
            connections.insert(connection);
            let mut users: Vec<UserId> = online.keys().cloned().collect();
            users.sort();
            (first, users)
        };

        self.rooms
            .send_to(
                &connection,
                ServerFrame::Event(ServerEvent::OnlineUsers(OnlineUsers { users })),
            )
            .await;

        if first {
            info!(user = %identity.user_id, "user online");
            self.fanout
                .broadcast(
                    ServerEvent::Presence(PresenceUpdate {
                        user_id: identity.user_id.clone(),
                        online: true,
                        tier: Some(identity.tier),
                        display_name: Some(identity.display_name.clone()),
                        photo_url: Some(identity.photo_url.clone()),
                        last_seen: None,
                    }),
                    None,
                )
                .await;
        } else {
            debug!(user = %identity.user_id, connection = %connection, "additional connection");
        }
    }

    /// Forget a closed connection without announcing anything. Returns
    /// `true` if that was the user's last one; the caller then clears the
    /// user's indicators and calls [`Self::announce_offline`].
    pub async fn release(&self, connection: ConnectionId, user: &UserId) -> bool {
        let mut online = self.online.write().await;
        match online.get_mut(user) {
            Some(connections) => {
                connections.remove(&connection);
                if connections.is_empty() {
                    online.remove(user);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Broadcast `user` going offline, stamped with the current time.
    pub async fn announce_offline(&self, user: &UserId) {
        info!(user = %user, "user offline");
        self.fanout
            .broadcast(
                ServerEvent::Presence(PresenceUpdate {
                    user_id: user.clone(),
                    online: false,
                    tier: None,
                    display_name: None,
                    photo_url: None,
                    last_seen: Some(Utc::now().timestamp_millis()),
                }),
                None,
            )
            .await;
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.online.read().await.contains_key(user)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn online_count(&self) -> usize {
        self.online.read().await.len()
    }
}
