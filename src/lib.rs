pub mod audio;
pub mod event;
pub mod util;

pub use audio::{
    commands::PlayerCommand,
    config::{BackendKind, FileSettings, MemorySettings, PlayerConfig, SettingsStore},
    error::PlayerError,
    player::TrackPlayer,
    progress::Progress,
    state::PlayerState,
    track::{Track, TrackSource},
    traits::PlaybackBackend,
};
pub use event::events::PlayerEvent;
