//! State coordinator: single owner of the canonical proxy state.
//!
//! Requests from every surface go into one FIFO queue drained by a dedicated
//! `rule-worker` thread, so privileged mutations never overlap. The worker is
//! the only publisher of state events.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{CommandError, RequestError};
use crate::hub::{RequestKind, StateEvent, StateHub, Subscription, Transition};
use crate::rules::RuleController;
use crate::settings::SettingsStore;
use crate::state::{ControlAction, ProxyState, Target};

type Reply = oneshot::Sender<Result<ProxyState, RequestError>>;

#[derive(Debug, Clone, Copy)]
enum Operation {
    Enable(Target),
    Disable,
    Toggle,
}

enum Message {
    Request { operation: Operation, reply: Reply },
    Shutdown,
}

/// Eventual result of a queued request.
///
/// Await it from async code or call [`wait`](Self::wait) from a plain thread.
/// Dropping it stops waiting but never cancels the request.
#[derive(Debug)]
pub struct PendingRequest {
    rx: oneshot::Receiver<Result<ProxyState, RequestError>>,
}

impl PendingRequest {
    fn ready(result: Result<ProxyState, RequestError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Blocks the current thread until the request completes. Must not be
    /// called from inside an async runtime.
    pub fn wait(self) -> Result<ProxyState, RequestError> {
        self.rx.blocking_recv().unwrap_or(Err(RequestError::Cancelled))
    }
}

impl Future for PendingRequest {
    type Output = Result<ProxyState, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RequestError::Cancelled)))
    }
}

struct Shared {
    tx: mpsc::UnboundedSender<Message>,
    closing: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    hub: Arc<StateHub>,
    settings: Arc<dyn SettingsStore>,
}

/// Handle to the coordinator. Clones share one worker and one state.
#[derive(Clone)]
pub struct StateCoordinator {
    shared: Arc<Shared>,
}

impl StateCoordinator {
    /// Probes the rule table once to seed the state, then starts the worker.
    ///
    /// A complete installed rule set seeds `active` with its target. Otherwise
    /// the state is inactive and carries the saved target for display.
    pub fn start(
        controller: RuleController,
        settings: Arc<dyn SettingsStore>,
    ) -> io::Result<Self> {
        let initial = match controller.probe_target() {
            Some(target) => ProxyState::active(target),
            None => ProxyState::inactive(settings.load()),
        };
        info!(
            active = initial.active,
            target = %initial.target,
            "state coordinator starting"
        );

        let hub = Arc::new(StateHub::new(initial));
        let closing = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            controller,
            hub: Arc::clone(&hub),
            settings: Arc::clone(&settings),
            closing: Arc::clone(&closing),
        };
        let handle = thread::Builder::new()
            .name("rule-worker".into())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            shared: Arc::new(Shared {
                tx,
                closing,
                worker: Mutex::new(Some(handle)),
                hub,
                settings,
            }),
        })
    }

    /// Queues installation of the redirect rules towards `target`.
    pub fn request_enable(&self, target: Target) -> PendingRequest {
        self.enqueue(Operation::Enable(target))
    }

    /// Queues removal of the redirect rules.
    pub fn request_disable(&self) -> PendingRequest {
        self.enqueue(Operation::Disable)
    }

    /// Validates and queues a raw control action. An invalid START address
    /// fails immediately without entering the queue.
    pub fn dispatch(&self, action: ControlAction) -> PendingRequest {
        match action.target() {
            Some(Ok(target)) => self.request_enable(target),
            Some(Err(e)) => {
                warn!(error = %e, "rejected start request");
                PendingRequest::ready(Err(e))
            }
            None => self.request_disable(),
        }
    }

    /// Quick toggle: disables when active, otherwise enables towards the
    /// saved target. The direction is decided when the request reaches the
    /// worker, so back-to-back toggles alternate.
    pub fn request_toggle(&self) -> PendingRequest {
        self.enqueue(Operation::Toggle)
    }

    /// Last broadcast snapshot.
    pub fn current_state(&self) -> ProxyState {
        self.shared.hub.current()
    }

    /// Attaches to the event stream, starting with the current snapshot.
    pub fn subscribe(&self) -> Subscription {
        self.shared.hub.subscribe()
    }

    /// Target from persisted settings, used to pre-fill enable requests.
    pub fn saved_target(&self) -> Target {
        self.shared.settings.load()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Stops the worker.
    ///
    /// Blocks until the in-flight request completes. Requests still queued
    /// resolve to [`RequestError::Cancelled`] and every subscription ends.
    pub fn shutdown(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("state coordinator shutting down");
        let _ = self.shared.tx.send(Message::Shutdown);

        if let Some(handle) = self.shared.worker.lock().take() {
            if handle.join().is_err() {
                error!("rule worker panicked");
                self.shared.hub.close();
            }
        }
    }

    fn enqueue(&self, operation: Operation) -> PendingRequest {
        if self.is_closing() {
            return PendingRequest::ready(Err(RequestError::Cancelled));
        }

        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(Message::Request { reply, .. })) =
            self.shared.tx.send(Message::Request { operation, reply })
        {
            let _ = reply.send(Err(RequestError::Cancelled));
        }
        PendingRequest { rx }
    }
}

impl std::fmt::Debug for StateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCoordinator")
            .field("state", &self.current_state())
            .field("closing", &self.is_closing())
            .finish()
    }
}

struct Worker {
    controller: RuleController,
    hub: Arc<StateHub>,
    settings: Arc<dyn SettingsStore>,
    closing: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.blocking_recv() {
            match message {
                Message::Request { operation, reply } => {
                    if self.closing.load(Ordering::SeqCst) {
                        let _ = reply.send(Err(RequestError::Cancelled));
                        continue;
                    }
                    let result = self.process(operation);
                    // The requester may have stopped waiting.
                    let _ = reply.send(result);
                }
                Message::Shutdown => break,
            }
        }

        rx.close();
        let mut cancelled = 0;
        while let Ok(message) = rx.try_recv() {
            if let Message::Request { reply, .. } = message {
                let _ = reply.send(Err(RequestError::Cancelled));
                cancelled += 1;
            }
        }

        self.hub.close();
        info!(cancelled, "rule worker stopped");
    }

    fn process(&self, operation: Operation) -> Result<ProxyState, RequestError> {
        match operation {
            Operation::Enable(target) => {
                self.hub.publish(StateEvent::Progress {
                    transition: Transition::Enabling { target },
                });
                self.controller
                    .apply(&target)
                    .map_err(|e| self.fail(RequestKind::Enable, e))?;

                if let Err(e) = self.settings.save(&target) {
                    warn!(%target, error = %e, "failed to persist target");
                }
                Ok(self.commit(ProxyState::active(target)))
            }
            Operation::Disable => {
                self.hub.publish(StateEvent::Progress {
                    transition: Transition::Disabling,
                });
                self.controller
                    .clear()
                    .map_err(|e| self.fail(RequestKind::Disable, e))?;

                let target = self.hub.current().target;
                Ok(self.commit(ProxyState::inactive(target)))
            }
            Operation::Toggle => {
                let resolved = if self.hub.current().active {
                    Operation::Disable
                } else {
                    Operation::Enable(self.settings.load())
                };
                debug!(?resolved, "toggle resolved");
                self.process(resolved)
            }
        }
    }

    fn commit(&self, state: ProxyState) -> ProxyState {
        info!(active = state.active, target = %state.target, "proxy state changed");
        self.hub.publish(StateEvent::Snapshot { state });
        state
    }

    fn fail(&self, request: RequestKind, error: CommandError) -> RequestError {
        let state = self.hub.current();
        warn!(?request, error = %error, "request failed, state unchanged");
        self.hub.publish(StateEvent::Failed {
            request,
            error: error.to_string(),
            kind: error.kind().to_string(),
            state,
        });
        error.into()
    }
}
