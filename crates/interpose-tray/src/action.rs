//! Tile actions.

/// Action triggered from the tile or its long-press menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileAction {
    /// Flip the current state.
    Toggle,

    /// Enable towards the saved target.
    Enable,

    /// Disable redirection.
    Disable,
}

impl TileAction {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Toggle => "toggle",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Toggle => "Toggle Proxy",
            Self::Enable => "Enable Proxy",
            Self::Disable => "Disable Proxy",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "toggle" => Some(Self::Toggle),
            "enable" => Some(Self::Enable),
            "disable" => Some(Self::Disable),
            _ => None,
        }
    }
}
