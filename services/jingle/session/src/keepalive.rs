//! Session-info pings on active sessions with RTT measurement.

use crate::session::{Session, SessionState};
use jingle_wire::Reason;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Counts consecutive unanswered pings
#[derive(Debug)]
pub struct MissedPings {
    count: u32,
    threshold: u32,
}

impl MissedPings {
    /// Create a tracker that trips after `threshold` consecutive misses
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record an answered ping
    pub fn record_success(&mut self) {
        self.count = 0;
    }

    /// Record an unanswered ping; true once the threshold is reached
    pub fn record_failure(&mut self) -> bool {
        self.count += 1;
        self.count >= self.threshold
    }

    /// Current consecutive misses
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Ping the session's peer every `interval` until the session ends
pub(crate) fn spawn(session: Weak<Session>, interval: Duration, max_missed: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        let mut missed = MissedPings::new(max_missed);

        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            if session.state() != SessionState::Active {
                break;
            }

            match session.ping().await {
                Ok(rtt) => {
                    missed.record_success();
                    debug!("Ping to {} on session {}: RTT {:?}", session.peer(), session.sid(), rtt);
                }
                Err(e) => {
                    warn!(
                        "Ping to {} on session {} failed ({} missed): {}",
                        session.peer(),
                        session.sid(),
                        missed.count() + 1,
                        e
                    );
                    if missed.record_failure() {
                        warn!("Peer {} unresponsive, ending session {}", session.peer(), session.sid());
                        session.terminate_detached(Reason::ConnectivityError);
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_trips_after_consecutive_failures() {
        let mut missed = MissedPings::new(3);
        assert!(!missed.record_failure());
        assert!(!missed.record_failure());
        assert!(missed.record_failure());
    }

    #[test]
    fn test_success_resets_count() {
        let mut missed = MissedPings::new(2);
        assert!(!missed.record_failure());
        missed.record_success();
        assert_eq!(missed.count(), 0);
        assert!(!missed.record_failure());
        assert!(missed.record_failure());
    }

    #[test]
    fn test_zero_threshold_means_one() {
        let mut missed = MissedPings::new(0);
        assert!(missed.record_failure());
    }
}
