use std::sync::Arc;
use std::time::Instant;

use courier_store::DocumentStore;

use crate::config::ServerConfig;
use crate::fanout::{FanOut, LocalFanOut};
use crate::gateway::TokenVerifier;
use crate::membership::MembershipGate;
use crate::presence::PresenceEngine;
use crate::rate_limit::RateLimiter;
use crate::rooms::RoomRegistry;
use crate::router::MessageRouter;
use crate::typing::TypingTracker;

/// Everything a connection handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub rooms: RoomRegistry,
    pub fanout: Arc<dyn FanOut>,
    pub presence: PresenceEngine,
    pub typing: TypingTracker,
    pub gate: MembershipGate,
    pub rate_limiter: RateLimiter,
    pub router: MessageRouter,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let rooms = RoomRegistry::new();
        let fanout: Arc<dyn FanOut> = Arc::new(LocalFanOut::new(rooms.clone()));
        let presence = PresenceEngine::new(rooms.clone(), fanout.clone());
        let typing = TypingTracker::new(
            fanout.clone(),
            config.typing_timeout,
            config.recording_timeout,
        );
        let gate = MembershipGate::new(store.clone());
        let rate_limiter = RateLimiter::new(config.message_limit, config.rate_window);
        let router = MessageRouter::new(
            store.clone(),
            gate.clone(),
            rate_limiter.clone(),
            fanout.clone(),
            rooms.clone(),
        );

        Self {
            config: Arc::new(config),
            store,
            verifier,
            rooms,
            fanout,
            presence,
            typing,
            gate,
            rate_limiter,
            router,
            started_at: Instant::now(),
        }
    }
}
