//! Single-publisher state subscription hub.
//!
//! The hub holds the last broadcast [`ProxyState`] and the sender side of every
//! subscription under one lock. Attaching pushes the current snapshot into the
//! new channel while holding that lock, so a subscriber sees exactly the state
//! as of attach time followed by every later event, in the same order as every
//! other subscriber.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::state::{ProxyState, Target};

/// Which kind of request an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Enable,
    Disable,
}

/// Transient progress marker. Never part of [`ProxyState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Transition {
    /// Rules towards `target` are being installed.
    Enabling { target: Target },
    /// Rules are being removed.
    Disabling,
}

/// One entry of the subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// Canonical state as of this point in the stream.
    Snapshot { state: ProxyState },
    /// A request started running.
    Progress { transition: Transition },
    /// A request failed; `state` is the unchanged canonical state.
    Failed {
        request: RequestKind,
        error: String,
        kind: String,
        state: ProxyState,
    },
}

impl StateEvent {
    /// Returns the state carried by this event, if any.
    pub fn state(&self) -> Option<&ProxyState> {
        match self {
            StateEvent::Snapshot { state } | StateEvent::Failed { state, .. } => Some(state),
            StateEvent::Progress { .. } => None,
        }
    }
}

struct HubInner {
    state: ProxyState,
    subscribers: Vec<UnboundedSender<StateEvent>>,
    closed: bool,
}

/// Fan-out point for state events.
pub struct StateHub {
    inner: Mutex<HubInner>,
}

impl StateHub {
    /// Creates a hub seeded with `initial`.
    pub fn new(initial: ProxyState) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                state: initial,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Last broadcast snapshot. Never blocks on a running request.
    pub fn current(&self) -> ProxyState {
        self.inner.lock().state
    }

    /// Attaches a new subscriber. The first event is always a snapshot of the
    /// current state. After [`close`](Self::close) the stream ends right after
    /// that snapshot.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        // rx is alive, so this cannot fail
        let _ = tx.send(StateEvent::Snapshot { state: inner.state });
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        debug!(subscribers = inner.subscribers.len(), "subscriber attached");

        Subscription { rx }
    }

    /// Broadcasts `event`. Snapshots also replace the current state.
    pub fn publish(&self, event: StateEvent) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if let StateEvent::Snapshot { state } = &event {
            inner.state = *state;
        }
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Ends every subscription stream. Later publishes are ignored.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    /// Number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Receiving end of a hub subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: UnboundedReceiver<StateEvent>,
}

impl Subscription {
    /// Waits for the next event. `None` once the hub has closed.
    pub async fn recv(&mut self) -> Option<StateEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<StateEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking variant of [`recv`](Self::recv) for plain threads. Must not be
    /// called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<StateEvent> {
        self.rx.blocking_recv()
    }
}
