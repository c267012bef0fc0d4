//! Live connections and the rooms they are subscribed to.
//!
//! Every connection owns an unbounded channel drained by its socket
//! writer task. Rooms are sets of connection ids; emitting to several
//! rooms at once delivers to each connection at most once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::protocol::ServerFrame;
use courier_shared::{Identity, Room, UserId};

pub type ConnectionId = Uuid;

/// The authenticated side of a connection, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub identity: Identity,
}

impl ConnectionInfo {
    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }
}

struct Connection {
    user_id: UserId,
    tx: mpsc::UnboundedSender<ServerFrame>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        id: ConnectionId,
        user_id: UserId,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
    }

    /// Remove the connection from every room. Returns the rooms it was in.
    pub async fn unregister(&self, id: &ConnectionId) -> Vec<Room> {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.remove(id) else {
            return Vec::new();
        };
        for room in &conn.rooms {
            let now_empty = match inner.rooms.get_mut(room) {
                Some(members) => {
                    members.remove(id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.rooms.remove(room);
            }
        }
        debug!(connection = %id, user = %conn.user_id, rooms = conn.rooms.len(), "connection unregistered");
        conn.rooms.into_iter().collect()
    }

    /// Join a room. Joining twice is a no-op; returns whether the
    /// connection was newly added.
    pub async fn join(&self, id: &ConnectionId, room: Room) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        if !conn.rooms.insert(room.clone()) {
            return false;
        }
        let members = inner.rooms.entry(room.clone()).or_default();
        members.insert(*id);
        info!(connection = %id, room = %room, members = members.len(), "joined room");
        true
    }

    pub async fn leave(&self, id: &ConnectionId, room: &Room) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner
            .connections
            .get_mut(id)
            .is_some_and(|conn| conn.rooms.remove(room));
        if !removed {
            return false;
        }
        let now_empty = match inner.rooms.get_mut(room) {
            Some(members) => {
                members.remove(id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.rooms.remove(room);
        }
        info!(connection = %id, room = %room, "left room");
        true
    }

    #[cfg(test)]
    pub async fn is_in(&self, id: &ConnectionId, room: &Room) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(id))
    }

    /// Send to one connection. Returns `false` if it is gone.
    pub async fn send_to(&self, id: &ConnectionId, frame: ServerFrame) -> bool {
        let inner = self.inner.read().await;
        match inner.connections.get(id) {
            Some(conn) => conn.tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Deliver `frame` to the union of `rooms`, each connection once.
    pub async fn emit(&self, rooms: &[Room], frame: &ServerFrame, except: Option<&ConnectionId>) -> usize {
        let inner = self.inner.read().await;
        let mut targets: HashSet<ConnectionId> = HashSet::new();
        for room in rooms {
            if let Some(members) = inner.rooms.get(room) {
                targets.extend(members.iter().copied());
            }
        }
        if let Some(except) = except {
            targets.remove(except);
        }

        let mut delivered = 0;
        for id in &targets {
            if let Some(conn) = inner.connections.get(id) {
                if conn.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver `frame` to every connection.
    pub async fn broadcast(&self, frame: &ServerFrame, except: Option<&ConnectionId>) -> usize {
        let inner = self.inner.read().await;
        let mut delivered = 0;
        for (id, conn) in &inner.connections {
            if Some(id) == except {
                continue;
            }
            if conn.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    #[cfg(test)]
    pub async fn room_size(&self, room: &Room) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}
