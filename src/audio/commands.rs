use crate::audio::track::{Track, TrackSource};

#[derive(Debug, Clone)]
pub enum PlayerCommand {
    Initialize,
    Load(TrackSource, Track),
    Play,
    Pause,
    Resume,
    Stop,
    Seek(f64),
    SetVolume(f32),
    SetSpeed(f32),
    SetLoop(bool),
    SetSinkId(String),
    SetProperty(String, serde_json::Value),
    Quit,
}
