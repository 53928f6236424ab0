//! Takeover protocol state.
//!
//! A runner started in takeover mode keeps broadcasting a
//! [`TakeoverMessage`] naming its subscription. Every other instance of that
//! subscription pauses its consumers until the broadcast's publish time plus
//! the suspend window, then resumes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Broadcast on the debug topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverMessage {
    pub suspend_subscription: String,
}

impl TakeoverMessage {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            suspend_subscription: subscription.into(),
        }
    }
}

/// Deadline (Unix ms) until which consumers stay paused, 0 when active
#[derive(Debug, Default)]
pub struct Suspension {
    until_ms: AtomicU64,
}

impl Suspension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the deadline to at least `publish_time_ms + window`; returns the
    /// resulting deadline
    pub fn extend(&self, publish_time_ms: u64, window: Duration) -> u64 {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let deadline = publish_time_ms.saturating_add(window_ms);
        let previous = self.until_ms.fetch_max(deadline, Ordering::SeqCst);
        previous.max(deadline)
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        match self.until_ms.load(Ordering::SeqCst) {
            0 => None,
            until => Some(until),
        }
    }

    pub fn is_suspended(&self, now_ms: u64) -> bool {
        self.deadline_ms().is_some_and(|until| now_ms < until)
    }

    /// Clear an expired deadline. Only one caller sees `true` per suspension;
    /// a concurrent `extend` wins over the clear.
    pub fn try_end(&self, now_ms: u64) -> bool {
        let until = self.until_ms.load(Ordering::SeqCst);
        if until == 0 || now_ms < until {
            return false;
        }
        self.until_ms
            .compare_exchange(until, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
