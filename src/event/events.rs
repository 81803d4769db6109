use crate::audio::{error::PlayerError, progress::Progress, state::PlayerState};

/// Everything a backend reports outward. The facade republishes these
/// unchanged to the UI and to cross-window sync.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged(PlayerState),
    Progress(Progress),
    Error(PlayerError),
    /// The current track played to its end.
    Ended,
    VolumeChanged(f32),
    SpeedChanged(f32),
    InitSuccess,
    InitFailed(String),
}

impl PlayerEvent {
    pub fn is_terminal_error(&self) -> bool {
        matches!(self, PlayerEvent::Error(err) if err.is_fatal())
    }
}
