use crate::audio::{
    config::BackendKind,
    error::PlayerError,
    progress::Progress,
    state::PlayerState,
    track::{Track, TrackSource},
};
use async_trait::async_trait;

/// Contract shared by the in-process and external-process backends.
///
/// Recoverable failures do not come back through the return value: they
/// are turned into state transitions plus a `PlayerEvent::Error` on the
/// backend's event channel. Commands only return `Err` for invalid
/// arguments, for `NotReady`, and after `destroy()`.
#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Brings the backend up. Idempotent; concurrent callers share one attempt.
    async fn initialize(&self) -> Result<(), PlayerError>;

    /// Replaces the current track, superseding any load still in flight.
    async fn set_track_source(&self, source: TrackSource, track: Track);

    async fn play(&self) -> Result<(), PlayerError>;
    async fn pause(&self) -> Result<(), PlayerError>;
    async fn resume(&self) -> Result<(), PlayerError>;
    async fn seek_to(&self, seconds: f64) -> Result<(), PlayerError>;

    /// Clamped to `[0, 1]`.
    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError>;
    async fn set_speed(&self, speed: f32) -> Result<(), PlayerError>;
    async fn set_loop(&self, looping: bool) -> Result<(), PlayerError>;
    async fn set_sink_id(&self, device: &str) -> Result<(), PlayerError>;

    async fn set_property(&self, _name: &str, _value: serde_json::Value) -> Result<(), PlayerError> {
        Err(PlayerError::Unsupported("raw properties"))
    }

    /// Back to `None` with no track. Idempotent.
    async fn reset(&self) -> Result<(), PlayerError>;

    /// Releases the underlying player; `initialize()` brings it back.
    async fn quit(&self) -> Result<(), PlayerError>;

    /// Terminal. Every later command fails with `Destroyed`.
    async fn destroy(&self);

    fn state(&self) -> PlayerState;
    fn progress(&self) -> Progress;
    fn current_track(&self) -> Option<Track>;
    fn volume(&self) -> f32;
    fn speed(&self) -> f32;

    fn has_source(&self) -> bool {
        self.current_track().is_some()
    }
}

pub(crate) fn clamp_volume(volume: f32) -> Result<f32, PlayerError> {
    if volume.is_nan() {
        return Err(PlayerError::InvalidArgument("volume is NaN".to_string()));
    }
    Ok(volume.clamp(0.0, 1.0))
}

pub(crate) fn check_speed(speed: f32) -> Result<f32, PlayerError> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(PlayerError::InvalidArgument(format!(
            "speed must be positive, got {speed}"
        )));
    }
    Ok(speed)
}

pub(crate) fn check_seek(seconds: f64) -> Result<f64, PlayerError> {
    if seconds.is_nan() {
        return Err(PlayerError::InvalidArgument("seek target is NaN".to_string()));
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_clamped() {
        assert_eq!(clamp_volume(1.7).unwrap(), 1.0);
        assert_eq!(clamp_volume(-0.2).unwrap(), 0.0);
        assert_eq!(clamp_volume(0.3).unwrap(), 0.3);
        assert!(clamp_volume(f32::NAN).is_err());
    }

    #[test]
    fn speed_must_be_positive() {
        assert!(check_speed(0.0).is_err());
        assert!(check_speed(f32::INFINITY).is_err());
        assert_eq!(check_speed(1.25).unwrap(), 1.25);
    }
}
