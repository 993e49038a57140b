//! Interpose Tray - one-tap quick toggle.
//!
//! A [`QuickToggle`] attaches to the coordinator like any other surface: it
//! folds the subscription stream into a tile status and turns a tap into a
//! toggle request. It never talks to the rule table directly.

pub mod action;
pub mod error;
pub mod status;
pub mod toggle;

pub use action::TileAction;
pub use error::{Result, TileError};
pub use status::TileStatus;
pub use toggle::{QuickToggle, TileEvent};
