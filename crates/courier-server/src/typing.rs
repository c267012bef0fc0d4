//! Typing and recording indicators.
//!
//! One session per (indicator, user, conversation). Starting an active
//! session only resets its timer; only transitions are broadcast. Each
//! timer carries a generation number so a timer that lost the race with
//! a newer start or an explicit stop does nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use courier_shared::protocol::{RecordingUpdate, SenderInfo, ServerEvent, TypingUpdate};
use courier_shared::{ConversationId, Identity, Room, UserId};

use crate::fanout::FanOut;
use crate::rooms::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Typing,
    Recording,
}

impl Indicator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Indicator::Typing => "typing",
            Indicator::Recording => "recording",
        }
    }
}

type SessionKey = (Indicator, UserId, ConversationId);

struct Session {
    generation: u64,
    sender: SenderInfo,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionKey, Session>,
    next_generation: u64,
}

#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<Mutex<Inner>>,
    fanout: Arc<dyn FanOut>,
    typing_timeout: Duration,
    recording_timeout: Duration,
}

impl TypingTracker {
    pub fn new(fanout: Arc<dyn FanOut>, typing_timeout: Duration, recording_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            fanout,
            typing_timeout,
            recording_timeout,
        }
    }

    fn timeout(&self, indicator: Indicator) -> Duration {
        match indicator {
            Indicator::Typing => self.typing_timeout,
            Indicator::Recording => self.recording_timeout,
        }
    }

    /// Start or refresh a session. `conversation_id` must be normalized and
    /// membership already checked.
    pub async fn start(
        &self,
        indicator: Indicator,
        origin: ConnectionId,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) {
        let key = (indicator, identity.user_id.clone(), conversation_id.clone());
        let sender = SenderInfo::from(identity);

        let was_active = {
            let mut inner = self.inner.lock().await;
            inner.next_generation += 1;
            let generation = inner.next_generation;

            let tracker = self.clone();
            let timeout = self.timeout(indicator);
            let timer_key = key.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracker.expire(timer_key, generation).await;
            });

            let previous = inner.sessions.insert(
                key,
                Session {
                    generation,
                    sender: sender.clone(),
                    timer,
                },
            );
            match previous {
                Some(old) => {
                    old.timer.abort();
                    true
                }
                None => false,
            }
        };

        if !was_active {
            debug!(
                user = %identity.user_id,
                conversation = %conversation_id,
                indicator = indicator.as_str(),
                "indicator started"
            );
            self.announce(
                indicator,
                &identity.user_id,
                conversation_id,
                true,
                Some(sender),
                Some(origin),
            )
            .await;
        }
    }

    /// Explicit stop from the user. Broadcast only if a session existed.
    pub async fn stop(
        &self,
        indicator: Indicator,
        origin: ConnectionId,
        user: &UserId,
        conversation_id: &ConversationId,
    ) {
        let key = (indicator, user.clone(), conversation_id.clone());
        let removed = self.inner.lock().await.sessions.remove(&key);
        if let Some(session) = removed {
            session.timer.abort();
            self.announce(
                indicator,
                user,
                conversation_id,
                false,
                Some(session.sender),
                Some(origin),
            )
            .await;
        }
    }

    async fn expire(&self, key: SessionKey, generation: u64) {
        let removed = {
            let mut inner = self.inner.lock().await;
            let current = inner.sessions.get(&key).map(|s| s.generation);
            if current == Some(generation) {
                inner.sessions.remove(&key)
            } else {
                None
            }
        };
        if let Some(session) = removed {
            let (indicator, user, conversation_id) = key;
            debug!(
                user = %user,
                conversation = %conversation_id,
                indicator = indicator.as_str(),
                "indicator expired"
            );
            self.announce(indicator, &user, &conversation_id, false, Some(session.sender), None)
                .await;
        }
    }

    /// Stop every session of `user`, e.g. when their connection closes.
    pub async fn stop_all_for_user(&self, user: &UserId) {
        let removed: Vec<(SessionKey, Session)> = {
            let mut inner = self.inner.lock().await;
            let keys: Vec<SessionKey> = inner
                .sessions
                .keys()
                .filter(|(_, u, _)| u == user)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.sessions.remove(&k).map(|s| (k, s)))
                .collect()
        };

        for ((indicator, user, conversation_id), session) in removed {
            session.timer.abort();
            self.announce(indicator, &user, &conversation_id, false, Some(session.sender), None)
                .await;
        }
    }

    /// Users currently typing in a conversation.
    pub async fn current(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let inner = self.inner.lock().await;
        let mut users: Vec<UserId> = inner
            .sessions
            .keys()
            .filter(|(indicator, _, conv)| *indicator == Indicator::Typing && conv == conversation_id)
            .map(|(_, user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    async fn announce(
        &self,
        indicator: Indicator,
        user: &UserId,
        conversation_id: &ConversationId,
        active: bool,
        sender: Option<SenderInfo>,
        except: Option<ConnectionId>,
    ) {
        let event = match indicator {
            Indicator::Typing => ServerEvent::Typing(TypingUpdate {
                conversation_id: conversation_id.clone(),
                user_id: user.clone(),
                typing: active,
                user: sender,
            }),
            Indicator::Recording => ServerEvent::Recording(RecordingUpdate {
                conversation_id: conversation_id.clone(),
                user_id: user.clone(),
                recording: active,
                user: sender,
            }),
        };
        self.fanout
            .emit(&[Room::conversation(conversation_id)], event, except)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::LocalFanOut;
    use crate::rooms::RoomRegistry;
    use courier_shared::protocol::ServerFrame;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Harness {
        rooms: RoomRegistry,
        tracker: TypingTracker,
        conv: ConversationId,
    }

    impl Harness {
        fn new() -> Self {
            let rooms = RoomRegistry::new();
            let fanout = Arc::new(LocalFanOut::new(rooms.clone()));
            Self {
                tracker: TypingTracker::new(fanout, Duration::from_secs(10), Duration::from_secs(60)),
                rooms,
                conv: "direct_a_b".into(),
            }
        }

        async fn join(&self, user: &str) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = Uuid::new_v4();
            self.rooms.register(id, user.into(), tx).await;
            self.rooms.join(&id, Room::conversation(&self.conv)).await;
            (id, rx)
        }
    }

    fn typing_updates(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<bool> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::Event(ServerEvent::Typing(update)) = frame {
                out.push(update.typing);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_once() {
        let h = Harness::new();
        let (a, mut rx_a) = h.join("a").await;
        let (_b, mut rx_b) = h.join("b").await;
        let alice = Identity::from_claims("a".into(), None);

        h.tracker.start(Indicator::Typing, a, &alice, &h.conv).await;
        assert_eq!(typing_updates(&mut rx_b), vec![true]);
        assert!(typing_updates(&mut rx_a).is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(typing_updates(&mut rx_b), vec![false]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(typing_updates(&mut rx_b).is_empty());
        assert!(h.tracker.current(&h.conv).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_timer_without_rebroadcast() {
        let h = Harness::new();
        let (a, _rx_a) = h.join("a").await;
        let (_b, mut rx_b) = h.join("b").await;
        let alice = Identity::from_claims("a".into(), None);

        h.tracker.start(Indicator::Typing, a, &alice, &h.conv).await;
        tokio::time::sleep(Duration::from_secs(8)).await;
        h.tracker.start(Indicator::Typing, a, &alice, &h.conv).await;
        tokio::time::sleep(Duration::from_secs(8)).await;

        // 16s after the first start, but only 8s after the refresh.
        assert_eq!(typing_updates(&mut rx_b), vec![true]);
        assert_eq!(h.tracker.current(&h.conv).await, vec![UserId::from("a")]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(typing_updates(&mut rx_b), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_cancels_expiry() {
        let h = Harness::new();
        let (a, _rx_a) = h.join("a").await;
        let (_b, mut rx_b) = h.join("b").await;
        let alice = Identity::from_claims("a".into(), None);

        h.tracker.start(Indicator::Typing, a, &alice, &h.conv).await;
        h.tracker.stop(Indicator::Typing, a, &alice.user_id, &h.conv).await;
        h.tracker.stop(Indicator::Typing, a, &alice.user_id, &h.conv).await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(typing_updates(&mut rx_b), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_is_independent() {
        let h = Harness::new();
        let (a, _rx_a) = h.join("a").await;
        let (_b, mut rx_b) = h.join("b").await;
        let alice = Identity::from_claims("a".into(), None);

        h.tracker.start(Indicator::Typing, a, &alice, &h.conv).await;
        h.tracker.start(Indicator::Recording, a, &alice, &h.conv).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let mut recording = Vec::new();
        let mut typing = Vec::new();
        while let Ok(frame) = rx_b.try_recv() {
            match frame {
                ServerFrame::Event(ServerEvent::Typing(u)) => typing.push(u.typing),
                ServerFrame::Event(ServerEvent::Recording(u)) => recording.push(u.recording),
                _ => {}
            }
        }
        assert_eq!(typing, vec![true, false]);
        assert_eq!(recording, vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_for_user() {
        let h = Harness::new();
        let (a, _rx_a) = h.join("a").await;
        let (_b, mut rx_b) = h.join("b").await;
        let alice = Identity::from_claims("a".into(), None);

        h.tracker.start(Indicator::Typing, a, &alice, &h.conv).await;
        h.tracker.stop_all_for_user(&alice.user_id).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(typing_updates(&mut rx_b), vec![true, false]);
    }
}
