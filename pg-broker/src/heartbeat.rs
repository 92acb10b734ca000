//! Per-session heartbeat: a single bit ("is a query in flight") set by
//! the message-handler tasks and read by a 10 s ticker, plus a
//! trailing-heartbeat rule on deactivation so the last query of a burst
//! isn't left unaccounted for.

use crate::client::GodemandClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

pub struct HeartbeatState {
    active: AtomicBool,
    last_beat: Mutex<Instant>,
    api: Arc<GodemandClient>,
    pool_id: String,
    resource_id: String,
}

impl HeartbeatState {
    pub fn new(api: Arc<GodemandClient>, pool_id: String, resource_id: String) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(false),
            last_beat: Mutex::new(Instant::now()),
            api,
            pool_id,
            resource_id,
        })
    }

    /// A client `Query`/`Parse` was seen: start counting this session as active.
    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// The server sent `ReadyForQuery`: stop counting as active, but
    /// send one last heartbeat if it's been 10s or more since the
    /// previous one, so the tail of a long-running query isn't reaped.
    pub fn deactivate(self: &Arc<Self>) {
        self.active.store(false, Ordering::SeqCst);
        let state = self.clone();
        tokio::spawn(async move {
            let mut last_beat = state.last_beat.lock().await;
            if last_beat.elapsed() >= HEARTBEAT_PERIOD {
                *last_beat = Instant::now();
                drop(last_beat);
                state.send().await;
            }
        });
    }

    async fn send(&self) {
        if let Err(err) = self.api.heartbeat(&self.pool_id, &self.resource_id).await {
            tracing::debug!(pool = %self.pool_id, resource = %self.resource_id, %err, "heartbeat to resource failed, session continues");
        }
    }

    /// Runs until `shutdown` fires or the caller aborts the task:
    /// while `active`, sends a heartbeat every 10s.
    pub async fn run_ticker(self: Arc<Self>, shutdown: shutdown::Shutdown) {
        let mut interval = tokio::time::interval(HEARTBEAT_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = interval.tick() => {}
            }
            if self.active.load(Ordering::SeqCst) {
                *self.last_beat.lock().await = Instant::now();
                self.send().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deactivate_skips_the_trailing_heartbeat_right_after_activation() {
        let state = HeartbeatState::new(Arc::new(GodemandClient::new("http://127.0.0.1:1".into())), "pg11".into(), "r-1".into());
        state.activate();
        state.deactivate();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // last_beat was freshly set at construction, well under the 10s
        // threshold, so no call should have been attempted.
        assert!(!state.active.load(Ordering::SeqCst));
    }
}
