//! Interpose Core - redirect rules and proxy state coordination.
//!
//! This crate owns the only part of Interpose with real correctness hazards:
//!
//! - [`rules`]: installs and removes the HTTP/HTTPS redirect rule pair through a
//!   privileged shell, and probes the live rule table for ground truth
//! - [`coordinator`]: the single owner of the canonical [`ProxyState`], which
//!   serializes enable/disable requests and publishes every transition
//! - [`hub`]: the single-publisher subscription stream every control surface
//!   attaches to
//! - [`surface`]: the display model a control surface folds events into
//!
//! ## Flow
//!
//! ```text
//! Surface → StateCoordinator.request_*() → queue (FIFO) → rule worker
//!                                                            │
//!                                    RuleController.apply()/clear()
//!                                                            │
//!                                         re-list rule table, verify
//!                                                            │
//!                             StateHub.publish() → every Subscription
//! ```

pub mod coordinator;
pub mod error;
pub mod hub;
pub mod rules;
pub mod settings;
pub mod shell;
pub mod state;
pub mod surface;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use coordinator::{PendingRequest, StateCoordinator};
pub use error::{CommandError, RequestError};
pub use hub::{RequestKind, StateEvent, StateHub, Subscription, Transition};
pub use rules::{NatTable, RedirectRule, RuleController, REDIRECTED_PORTS, RULE_CHAIN};
pub use settings::{MemorySettings, SettingsError, SettingsStore};
pub use shell::{CommandShell, PrivilegedShell, ShellOutput};
pub use state::{normalize_port, ControlAction, ProxyState, Target, DEFAULT_ADDRESS, DEFAULT_PORT};
pub use surface::SurfaceView;
