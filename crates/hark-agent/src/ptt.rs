//! Push-to-talk state
//!
//! One [`PttHandle`] exists per process. The key listener calls `press` and
//! `release`; everything else observes transitions through [`PttEvents`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PttState {
    Idle,
    Pressed,
}

/// Current state plus transition counters
///
/// The counters let an observer notice a press that was released again
/// before it got to look.
#[derive(Debug, Clone, Copy)]
pub struct PttSnapshot {
    pub state: PttState,
    /// When the current state was entered
    pub since: Instant,
    pub presses: u64,
    pub releases: u64,
}

/// Shared push-to-talk state
#[derive(Clone)]
pub struct PttHandle {
    tx: Arc<watch::Sender<PttSnapshot>>,
}

impl Default for PttHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PttHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PttSnapshot {
            state: PttState::Idle,
            since: Instant::now(),
            presses: 0,
            releases: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Record a key press. Repeated presses without a release are ignored.
    pub fn press(&self) -> bool {
        self.tx.send_if_modified(|snap| {
            if snap.state == PttState::Pressed {
                return false;
            }
            snap.state = PttState::Pressed;
            snap.since = Instant::now();
            snap.presses += 1;
            true
        })
    }

    /// Record a key release. A release while idle is ignored.
    pub fn release(&self) -> bool {
        self.tx.send_if_modified(|snap| {
            if snap.state == PttState::Idle {
                return false;
            }
            snap.state = PttState::Idle;
            snap.since = Instant::now();
            snap.releases += 1;
            true
        })
    }

    pub fn state(&self) -> PttState {
        self.tx.borrow().state
    }

    pub fn snapshot(&self) -> PttSnapshot {
        *self.tx.borrow()
    }

    /// Observe transitions from now on.
    pub fn subscribe(&self) -> PttEvents {
        let rx = self.tx.subscribe();
        let snap = *rx.borrow();
        PttEvents {
            rx,
            seen_presses: snap.presses,
            seen_releases: snap.releases,
        }
    }
}

/// Press/release stream for one observer
pub struct PttEvents {
    rx: watch::Receiver<PttSnapshot>,
    seen_presses: u64,
    seen_releases: u64,
}

impl PttEvents {
    /// Wait for a press not yet observed. `None` once every handle is gone.
    pub async fn pressed(&mut self) -> Option<PttSnapshot> {
        loop {
            let snap = *self.rx.borrow_and_update();
            if snap.presses > self.seen_presses {
                self.seen_presses = snap.presses;
                return Some(snap);
            }
            self.rx.changed().await.ok()?;
        }
    }

    /// Wait for a release not yet observed.
    pub async fn released(&mut self) -> Option<PttSnapshot> {
        loop {
            let snap = *self.rx.borrow_and_update();
            if snap.releases > self.seen_releases {
                self.seen_releases = snap.releases;
                return Some(snap);
            }
            self.rx.changed().await.ok()?;
        }
    }

    /// Treat every transition so far as observed.
    pub fn sync(&mut self) {
        let snap = *self.rx.borrow_and_update();
        self.seen_presses = snap.presses;
        self.seen_releases = snap.releases;
    }

    pub fn state(&self) -> PttState {
        self.rx.borrow().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_press_release_idempotent() {
        let ptt = PttHandle::new();
        assert!(ptt.press());
        assert!(!ptt.press());
        assert_eq!(ptt.state(), PttState::Pressed);
        assert!(ptt.release());
        assert!(!ptt.release());
        let snap = ptt.snapshot();
        assert_eq!((snap.presses, snap.releases), (1, 1));
    }

    #[test]
    fn test_transition_timestamps_are_monotonic() {
        let ptt = PttHandle::new();
        let t0 = ptt.snapshot().since;
        ptt.press();
        let t1 = ptt.snapshot().since;
        ptt.release();
        let t2 = ptt.snapshot().since;
        assert!(t0 <= t1 && t1 <= t2);
    }

    #[tokio::test]
    async fn test_quick_tap_is_not_lost() {
        let ptt = PttHandle::new();
        let mut events = ptt.subscribe();
        ptt.press();
        ptt.release();

        let pressed = tokio::time::timeout(Duration::from_millis(100), events.pressed())
            .await
            .unwrap();
        assert!(pressed.is_some());
        let released = tokio::time::timeout(Duration::from_millis(100), events.released())
            .await
            .unwrap();
        assert_eq!(released.unwrap().state, PttState::Idle);
    }

    #[tokio::test]
    async fn test_sync_skips_old_presses() {
        let ptt = PttHandle::new();
        let mut events = ptt.subscribe();
        ptt.press();
        ptt.release();
        events.sync();

        let waited = tokio::time::timeout(Duration::from_millis(20), events.pressed()).await;
        assert!(waited.is_err());

        ptt.press();
        assert!(events.pressed().await.is_some());
    }

    #[tokio::test]
    async fn test_press_wakes_waiting_observer() {
        let ptt = PttHandle::new();
        let mut events = ptt.subscribe();
        let waiter = tokio::spawn(async move { events.pressed().await.map(|s| s.state) });
        tokio::task::yield_now().await;
        ptt.press();
        assert_eq!(waiter.await.unwrap(), Some(PttState::Pressed));
    }
}
