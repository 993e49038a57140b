//! Interpose - transparent HTTP/HTTPS redirect to an intercepting proxy.
//!
//! - [`daemon`]: the `serve` process owning the coordinator, the control API
//!   and the quick toggle
//! - [`client`]: the thin HTTP client used by the other subcommands

pub mod client;
pub mod daemon;

pub use client::{ApiClient, ClientError};
pub use daemon::DaemonOptions;
