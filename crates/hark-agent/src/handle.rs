//! A cloneable handle for observing and steering the turn controller.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::events::TurnEvent;
use crate::turn::TurnState;

const EVENT_CAPACITY: usize = 256;

/// A cloneable handle for the turn controller.
///
/// All fields are `Arc`-wrapped or channel handles, so cloning is cheap.
#[derive(Clone)]
pub struct TurnHandle {
    pub(crate) state: Arc<watch::Sender<TurnState>>,
    pub(crate) turn_cancel: Arc<Mutex<Option<CancellationToken>>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) events: broadcast::Sender<TurnEvent>,
}

impl TurnHandle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(TurnState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(state),
            turn_cancel: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            events,
        }
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    /// Interrupt the active turn, as a PTT press would. Returns whether a
    /// turn was active.
    pub fn interrupt(&self) -> bool {
        match self.turn_cancel.lock().as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stop the controller loop after cancelling any active turn.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until the controller enters a state matching `pred`.
    pub async fn wait_for_state(&self, pred: impl Fn(TurnState) -> bool) -> TurnState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| pred(*s)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Like [`wait_for_state`](Self::wait_for_state) with a timeout.
    /// Returns `None` on timeout.
    pub async fn wait_for_state_timeout(
        &self,
        pred: impl Fn(TurnState) -> bool,
        timeout: Duration,
    ) -> Option<TurnState> {
        tokio::time::timeout(timeout, self.wait_for_state(pred))
            .await
            .ok()
    }
}
