//! Delivery of server events to rooms.
//!
//! [`FanOut`] is where a multi-instance backend would plug in. The
//! built-in [`LocalFanOut`] reaches the connections of this process only.

use async_trait::async_trait;

use courier_shared::protocol::{ServerEvent, ServerFrame};
use courier_shared::Room;

use crate::rooms::{ConnectionId, RoomRegistry};

#[async_trait]
pub trait FanOut: Send + Sync {
    /// Deliver to the union of `rooms`, each connection once, skipping
    /// `except`. Returns the number of local connections reached.
    async fn emit(&self, rooms: &[Room], event: ServerEvent, except: Option<ConnectionId>) -> usize;

    /// Deliver to every connection.
    async fn broadcast(&self, event: ServerEvent, except: Option<ConnectionId>) -> usize;
}

#[derive(Clone)]
pub struct LocalFanOut {
    rooms: RoomRegistry,
}

impl LocalFanOut {
    pub fn new(rooms: RoomRegistry) -> Self {
        Self { rooms }
    }
}

#[async_trait]
impl FanOut for LocalFanOut {
    async fn emit(&self, rooms: &[Room], event: ServerEvent, except: Option<ConnectionId>) -> usize {
        let frame = ServerFrame::Event(event);
        self.rooms.emit(rooms, &frame, except.as_ref()).await
    }

    async fn broadcast(&self, event: ServerEvent, except: Option<ConnectionId>) -> usize {
        let frame = ServerFrame::Event(event);
        self.rooms.broadcast(&frame, except.as_ref()).await
    }
}
