//! Canonical proxy state and redirect target types.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::RequestError;

/// Intercepting endpoint address used when nothing has been saved yet.
pub const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);

/// Intercepting endpoint port used when nothing has been saved yet, and the
/// port a malformed START request is normalized to.
pub const DEFAULT_PORT: u16 = 8080;

/// Endpoint the redirect rules send HTTP/HTTPS traffic to.
///
/// The address is an IPv4 literal because it is interpolated into the
/// privileged rule commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Intercepting endpoint address.
    pub address: Ipv4Addr,
    /// Intercepting endpoint port.
    pub port: u16,
}

impl Target {
    /// Creates a target from an already-parsed address.
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// Parses a user-supplied address.
    pub fn parse(address: &str, port: u16) -> Result<Self, RequestError> {
        let address = address
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| RequestError::InvalidTarget(address.trim().to_string()))?;
        Ok(Self { address, port })
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_PORT)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The canonical "is redirection active, and to where" value.
///
/// Serializes as `{ "active": bool, "address": "a.b.c.d", "port": n }`. While
/// `active` is false the target is kept for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyState {
    /// Whether the redirect rules are installed.
    pub active: bool,
    /// Where the installed rules point (or pointed last).
    #[serde(flatten)]
    pub target: Target,
}

impl ProxyState {
    /// Redirection installed towards `target`.
    pub fn active(target: Target) -> Self {
        Self {
            active: true,
            target,
        }
    }

    /// No redirection installed; `target` is retained for display.
    pub fn inactive(target: Target) -> Self {
        Self {
            active: false,
            target,
        }
    }

    /// One-line description suitable for a status notification.
    pub fn describe(&self) -> String {
        if self.active {
            format!("Redirecting 80,443 \u{2192} {}", self.target)
        } else {
            "Redirect inactive".to_string()
        }
    }
}

/// Normalizes a raw port field: anything that is not a port in `1..=65535`
/// becomes [`DEFAULT_PORT`].
pub fn normalize_port(raw: &str) -> u16 {
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .unwrap_or(DEFAULT_PORT)
}

/// Control action as received from a surface, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Install redirection towards the given raw address/port fields.
    Start {
        /// Address text as typed.
        address: String,
        /// Port text as typed; malformed values become [`DEFAULT_PORT`].
        port: String,
    },
    /// Remove redirection.
    Stop,
}

impl ControlAction {
    /// Builds a START action from raw fields.
    pub fn start(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self::Start {
            address: address.into(),
            port: port.into(),
        }
    }

    /// Resolves the target of a START action. Returns `None` for STOP.
    pub fn target(&self) -> Option<Result<Target, RequestError>> {
        match self {
            ControlAction::Start { address, port } => {
                Some(Target::parse(address, normalize_port(port)))
            }
            ControlAction::Stop => None,
        }
    }
}
