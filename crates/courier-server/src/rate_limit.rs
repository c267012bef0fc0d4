use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use courier_shared::UserId;

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window message counter per user.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<UserId, Window>>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            limit,
            window,
        }
    }

    /// Count one message for `user`. Returns `false` once the user has
    /// used up the current window.
    pub async fn check(&self, user: &UserId) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        match windows.get_mut(user) {
            Some(w) if now < w.reset_at => {
                if w.count >= self.limit {
                    return false;
                }
                w.count += 1;
                true
            }
            _ => {
                windows.insert(
                    user.clone(),
                    Window {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }

    /// Drop windows that have expired.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at);
        let purged = before - windows.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = windows.len(), "purged rate windows");
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    #[cfg(test)]
    pub async fn tracked_users(&self) -> usize {
        self.windows.lock().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            courier_shared::constants::MESSAGE_LIMIT,
            Duration::from_secs(courier_shared::constants::RATE_WINDOW_SECS),
        )
    }
}
