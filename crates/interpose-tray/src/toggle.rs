//! One-tap quick toggle bound to the coordinator.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender},
    Arc,
};
use std::thread;

use interpose_core::{PendingRequest, StateCoordinator, StateEvent, Subscription, SurfaceView};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::action::TileAction;
use crate::error::{Result, TileError};
use crate::status::TileStatus;

/// Events emitted by the quick toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileEvent {
    /// The tile status changed.
    StatusChanged(TileStatus),

    /// A request failed. The tile keeps showing the prior state.
    Failed(String),

    /// The coordinator shut down; the tile no longer accepts input.
    Detached,
}

/// Quick toggle surface.
///
/// Status is folded from the coordinator's subscription stream on a
/// `quick-toggle` thread. Changes are also emitted through the channel
/// returned by [`attach`](Self::attach).
pub struct QuickToggle {
    coordinator: StateCoordinator,
    view: Arc<Mutex<SurfaceView>>,
    attached: Arc<AtomicBool>,
}

impl QuickToggle {
    /// Attaches to `coordinator`. The tile reflects the current state as soon
    /// as this returns.
    pub fn attach(coordinator: StateCoordinator) -> Result<(Self, Receiver<TileEvent>)> {
        let (event_tx, event_rx) = mpsc::channel();
        let view = Arc::new(Mutex::new(SurfaceView::new()));
        let attached = Arc::new(AtomicBool::new(true));

        let mut subscription = coordinator.subscribe();
        if let Some(event) = subscription.try_recv() {
            view.lock().apply(&event);
        }

        let listener = Listener {
            view: Arc::clone(&view),
            attached: Arc::clone(&attached),
            event_tx,
        };
        thread::Builder::new()
            .name("quick-toggle".into())
            .spawn(move || listener.run(subscription))?;

        let tile = Self {
            coordinator,
            view,
            attached,
        };
        info!(status = %tile.status(), "quick toggle attached");

        Ok((tile, event_rx))
    }

    /// Tap on the tile.
    pub fn click(&self) -> Result<PendingRequest> {
        self.handle(TileAction::Toggle)
    }

    /// Runs `action`. Rejected while a request is running or before the state
    /// is known.
    pub fn handle(&self, action: TileAction) -> Result<PendingRequest> {
        if !self.is_attached() || self.coordinator.is_closing() {
            return Err(TileError::Detached);
        }
        let status = self.status();
        if !status.accepts_input() {
            debug!(%status, action = action.id(), "ignoring tile input");
            return Err(TileError::Busy);
        }

        Ok(match action {
            TileAction::Toggle => self.coordinator.request_toggle(),
            TileAction::Enable => self
                .coordinator
                .request_enable(self.coordinator.saved_target()),
            TileAction::Disable => self.coordinator.request_disable(),
        })
    }

    pub fn status(&self) -> TileStatus {
        TileStatus::from_view(&self.view.lock())
    }

    /// Snapshot of the folded view.
    pub fn view(&self) -> SurfaceView {
        self.view.lock().clone()
    }

    pub fn label(&self) -> &'static str {
        self.status().label()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

struct Listener {
    view: Arc<Mutex<SurfaceView>>,
    attached: Arc<AtomicBool>,
    event_tx: Sender<TileEvent>,
}

impl Listener {
    fn run(self, mut subscription: Subscription) {
        let mut last = TileStatus::from_view(&self.view.lock());

        while let Some(event) = subscription.blocking_recv() {
            let status = {
                let mut view = self.view.lock();
                view.apply(&event);
                TileStatus::from_view(&view)
            };

            if let StateEvent::Failed { error, .. } = &event {
                warn!(error = %error, "tile request failed");
                let _ = self.event_tx.send(TileEvent::Failed(error.clone()));
            }
            if status != last {
                debug!(from = %last, to = %status, "tile status changed");
                last = status;
                let _ = self.event_tx.send(TileEvent::StatusChanged(status));
            }
        }

        self.attached.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(TileEvent::Detached);
        info!("quick toggle detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpose_core::testing::FakeIptables;
    use interpose_core::{MemorySettings, RuleController, Target};
    use std::time::Duration;

    fn coordinator(fake: &FakeIptables) -> StateCoordinator {
        let settings = Arc::new(MemorySettings::with_target(
            Target::parse("10.0.0.5", 8081).unwrap(),
        ));
        StateCoordinator::start(RuleController::new(Arc::new(fake.clone())), settings).unwrap()
    }

    fn wait_for(rx: &Receiver<TileEvent>, expected: TileEvent) {
        loop {
            let event = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("timed out waiting for tile event");
            if event == expected {
                return;
            }
        }
    }

    #[test]
    fn attach_shows_current_state() {
        let fake = FakeIptables::new();
        fake.preinstall(Target::parse("10.0.0.5", 8081).unwrap());
        let coordinator = coordinator(&fake);

        let (tile, _rx) = QuickToggle::attach(coordinator.clone()).unwrap();
        assert_eq!(tile.status(), TileStatus::Active);
        assert_eq!(tile.label(), "Proxy ON");
        coordinator.shutdown();
    }

    #[test]
    fn click_toggles_with_saved_target() {
        let fake = FakeIptables::new();
        let coordinator = coordinator(&fake);
        let (tile, rx) = QuickToggle::attach(coordinator.clone()).unwrap();
        assert_eq!(tile.status(), TileStatus::Inactive);

        let state = tokio_test::block_on(tile.click().unwrap()).unwrap();
        assert!(state.active);
        assert_eq!(state.target.to_string(), "10.0.0.5:8081");
        wait_for(&rx, TileEvent::StatusChanged(TileStatus::Active));

        let state = tokio_test::block_on(tile.click().unwrap()).unwrap();
        assert!(!state.active);
        wait_for(&rx, TileEvent::StatusChanged(TileStatus::Inactive));
        assert!(fake.installed_rules().is_empty());
        coordinator.shutdown();
    }

    #[test]
    fn click_while_busy_is_rejected() {
        let fake = FakeIptables::new();
        fake.set_delay(Duration::from_millis(50));
        let coordinator = coordinator(&fake);
        let (tile, rx) = QuickToggle::attach(coordinator.clone()).unwrap();

        let pending = tile.click().unwrap();
        wait_for(&rx, TileEvent::StatusChanged(TileStatus::Busy));
        assert!(matches!(tile.click(), Err(TileError::Busy)));

        assert!(pending.wait().unwrap().active);
        coordinator.shutdown();
    }

    #[test]
    fn failure_keeps_prior_status() {
        let fake = FakeIptables::new();
        let coordinator = coordinator(&fake);
        let (tile, rx) = QuickToggle::attach(coordinator.clone()).unwrap();
        fake.deny(true);

        let err = tile.click().unwrap().wait().unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
        wait_for(
            &rx,
            TileEvent::Failed("privileged access denied: su: permission denied".into()),
        );
        assert_eq!(tile.status(), TileStatus::Inactive);
        assert!(tile.view().last_error().is_some());
        coordinator.shutdown();
    }

    #[test]
    fn two_tiles_agree() {
        let fake = FakeIptables::new();
        let coordinator = coordinator(&fake);
        let (first, first_rx) = QuickToggle::attach(coordinator.clone()).unwrap();
        let (second, second_rx) = QuickToggle::attach(coordinator.clone()).unwrap();

        first.click().unwrap().wait().unwrap();
        wait_for(&first_rx, TileEvent::StatusChanged(TileStatus::Active));
        wait_for(&second_rx, TileEvent::StatusChanged(TileStatus::Active));
        assert_eq!(first.view(), second.view());
        coordinator.shutdown();
    }

    #[test]
    fn detached_after_shutdown() {
        let fake = FakeIptables::new();
        let coordinator = coordinator(&fake);
        let (tile, rx) = QuickToggle::attach(coordinator.clone()).unwrap();

        coordinator.shutdown();
        wait_for(&rx, TileEvent::Detached);
        assert!(!tile.is_attached());
        assert!(matches!(tile.click(), Err(TileError::Detached)));
    }
}
