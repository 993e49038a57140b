//! Display model shared by every control surface.
//!
//! A surface folds the subscription stream into a [`SurfaceView`] and renders
//! from it. Two surfaces that received the same events hold equal views.

use crate::hub::{StateEvent, Transition};
use crate::state::ProxyState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceView {
    state: Option<ProxyState>,
    pending: Option<Transition>,
    last_error: Option<String>,
}

impl SurfaceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event into the view.
    pub fn apply(&mut self, event: &StateEvent) {
        match event {
            StateEvent::Snapshot { state } => {
                self.state = Some(*state);
                self.pending = None;
                self.last_error = None;
            }
            StateEvent::Progress { transition } => {
                self.pending = Some(*transition);
                self.last_error = None;
            }
            StateEvent::Failed { error, state, .. } => {
                self.state = Some(*state);
                self.pending = None;
                self.last_error = Some(error.clone());
            }
        }
    }

    /// Last known canonical state. `None` until the first snapshot arrives.
    pub fn state(&self) -> Option<&ProxyState> {
        self.state.as_ref()
    }

    pub fn pending(&self) -> Option<Transition> {
        self.pending
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.state.map(|s| s.active).unwrap_or(false)
    }

    /// Status line shown in the control panel.
    pub fn status_text(&self) -> String {
        match (self.pending, &self.last_error, self.state) {
            (Some(Transition::Enabling { .. }), _, _) => "Enabling...".to_string(),
            (Some(Transition::Disabling), _, _) => "Disabling...".to_string(),
            (None, Some(error), _) => format!("Error: {}", error),
            (None, None, None) => "Checking...".to_string(),
            (None, None, Some(state)) if state.active => "Active".to_string(),
            (None, None, Some(_)) => "Inactive".to_string(),
        }
    }

    pub fn headline(&self) -> &'static str {
        if self.is_active() {
            "Proxy Enabled"
        } else {
            "Proxy Disabled"
        }
    }

    /// Label for the one-tap toggle.
    pub fn tile_label(&self) -> &'static str {
        if self.is_active() {
            "Proxy ON"
        } else {
            "Proxy OFF"
        }
    }

    /// Notification text while redirection is active.
    pub fn notification(&self) -> Option<String> {
        self.state.filter(|s| s.active).map(|s| s.describe())
    }

    /// Target fields are editable only while known to be inactive and idle.
    pub fn can_edit_target(&self) -> bool {
        self.pending.is_none() && matches!(self.state, Some(state) if !state.active)
    }

    /// The toggle accepts input once state is known and nothing is running.
    pub fn toggle_enabled(&self) -> bool {
        self.pending.is_none() && self.state.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::RequestKind;
    use crate::state::Target;

    fn target() -> Target {
        Target::parse("10.0.0.5", 8081).unwrap()
    }

    #[test]
    fn test_initial_view_is_checking() {
        let view = SurfaceView::new();
        assert_eq!(view.status_text(), "Checking...");
        assert!(!view.toggle_enabled());
        assert!(!view.can_edit_target());
    }

    #[test]
    fn test_enable_sequence() {
        let mut view = SurfaceView::new();
        view.apply(&StateEvent::Snapshot {
            state: ProxyState::inactive(target()),
        });
        assert_eq!(view.status_text(), "Inactive");
        assert!(view.can_edit_target());

        view.apply(&StateEvent::Progress {
            transition: Transition::Enabling { target: target() },
        });
        assert_eq!(view.status_text(), "Enabling...");
        assert!(!view.toggle_enabled());
        assert!(!view.can_edit_target());

        view.apply(&StateEvent::Snapshot {
            state: ProxyState::active(target()),
        });
        assert_eq!(view.status_text(), "Active");
        assert_eq!(view.headline(), "Proxy Enabled");
        assert_eq!(view.tile_label(), "Proxy ON");
        assert_eq!(
            view.notification().as_deref(),
            Some("Redirecting 80,443 \u{2192} 10.0.0.5:8081")
        );
        assert!(!view.can_edit_target());
    }

    #[test]
    fn test_failure_keeps_prior_state() {
        let mut view = SurfaceView::new();
        view.apply(&StateEvent::Snapshot {
            state: ProxyState::active(target()),
        });
        view.apply(&StateEvent::Progress {
            transition: Transition::Disabling,
        });
        view.apply(&StateEvent::Failed {
            request: RequestKind::Disable,
            error: "privileged access denied: su".into(),
            kind: "permission_denied".into(),
            state: ProxyState::active(target()),
        });

        assert!(view.is_active());
        assert_eq!(view.tile_label(), "Proxy ON");
        assert_eq!(view.status_text(), "Error: privileged access denied: su");
        assert!(view.toggle_enabled());
    }

    #[test]
    fn test_views_fed_same_events_agree() {
        let events = [
            StateEvent::Snapshot {
                state: ProxyState::inactive(target()),
            },
            StateEvent::Progress {
                transition: Transition::Enabling { target: target() },
            },
            StateEvent::Snapshot {
                state: ProxyState::active(target()),
            },
        ];
        let mut panel = SurfaceView::new();
        let mut tile = SurfaceView::new();
        for event in &events {
            panel.apply(event);
            tile.apply(event);
        }
        assert_eq!(panel, tile);
    }
}
