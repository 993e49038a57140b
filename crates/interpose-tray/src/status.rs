//! Tile status types.

use interpose_core::SurfaceView;

/// Status shown on the quick toggle tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileStatus {
    /// No snapshot received yet, or the coordinator is gone.
    #[default]
    Unavailable,

    /// Redirection is installed.
    Active,

    /// Redirection is not installed.
    Inactive,

    /// A request is running.
    Busy,
}

impl TileStatus {
    /// Derives the tile status from a surface view.
    pub fn from_view(view: &SurfaceView) -> Self {
        match view.state() {
            None => Self::Unavailable,
            Some(_) if view.pending().is_some() => Self::Busy,
            Some(state) if state.active => Self::Active,
            Some(_) => Self::Inactive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "Unavailable",
            Self::Active => "Active",
            Self::Inactive => "Inactive",
            Self::Busy => "Busy",
        }
    }

    /// Label drawn on the tile.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "Proxy ON",
            _ => "Proxy OFF",
        }
    }

    pub fn tooltip(&self) -> &'static str {
        match self {
            Self::Unavailable => "Interpose - Checking...",
            Self::Active => "Interpose - Redirecting 80,443",
            Self::Inactive => "Interpose - Redirect inactive",
            Self::Busy => "Interpose - Applying...",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether a tap should be accepted.
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::Active | Self::Inactive)
    }

    pub fn icon_variant(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Busy => "busy",
        }
    }
}

impl std::fmt::Display for TileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
