//! Shared health state for the /health endpoint.
//! Realtime state comes from the reunion channel; race mounts are counted by
//! the race routes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;

use crate::view::LoadState;
use crate::ws::ChannelState;

pub struct HealthState {
    realtime: watch::Receiver<ChannelState>,
    /// Race views mounted since startup, including remounts.
    race_mounts: AtomicU64,
    started_at_ms: i64,
}

impl HealthState {
    pub fn new(realtime: watch::Receiver<ChannelState>) -> Self {
        Self {
            realtime,
            race_mounts: AtomicU64::new(0),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn realtime_state(&self) -> ChannelState {
        *self.realtime.borrow()
    }

    pub fn inc_race_mounts(&self) {
        self.race_mounts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn race_mounts(&self) -> u64 {
        self.race_mounts.load(Ordering::Relaxed)
    }

    pub fn uptime_s(&self) -> i64 {
        (chrono::Utc::now().timestamp_millis() - self.started_at_ms) / 1000
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub realtime: ChannelState,
    pub reunion_mounted: bool,
    pub load_state: LoadState,
    pub last_update_ms: Option<i64>,
    pub race_views: usize,
    pub race_mounts: u64,
    pub uptime_s: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_realtime_state_and_mounts() {
        let (tx, rx) = watch::channel(ChannelState::Idle);
        let health = HealthState::new(rx);
        assert_eq!(health.realtime_state(), ChannelState::Idle);

        tx.send_replace(ChannelState::Joined);
        health.inc_race_mounts();
        health.inc_race_mounts();
        assert_eq!(health.realtime_state(), ChannelState::Joined);
        assert_eq!(health.race_mounts(), 2);
        assert!(health.uptime_s() >= 0);
    }
}
