use arc_swap::ArcSwap;
use std::sync::Arc;

/// Playback position in seconds. `duration` is `f64::INFINITY` while the
/// length is unknown or the stream is live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub current_time: f64,
    pub duration: f64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            current_time: 0.0,
            duration: f64::INFINITY,
        }
    }
}

impl Progress {
    pub fn new(current_time: f64, duration: f64) -> Self {
        Self {
            current_time: current_time.max(0.0),
            duration: normalize_duration(duration),
        }
    }

    pub fn is_live(&self) -> bool {
        self.duration.is_infinite()
    }

    /// `None` for live or unknown lengths, the way events carry it.
    pub fn finite_duration(&self) -> Option<f64> {
        self.duration.is_finite().then_some(self.duration)
    }

    pub fn clamp_seek(&self, seconds: f64) -> f64 {
        let lower = seconds.max(0.0);
        if self.duration.is_finite() {
            lower.min(self.duration)
        } else {
            lower
        }
    }
}

/// Zero, negative and non-finite lengths all mean "unknown".
pub fn normalize_duration(raw: f64) -> f64 {
    if raw.is_finite() && raw > 0.0 {
        raw
    } else {
        f64::INFINITY
    }
}

/// Latest progress snapshot of a backend. Writers replace the whole value;
/// readers never block.
#[derive(Debug)]
pub struct TrackProgress {
    current: ArcSwap<Progress>,
}

impl Default for TrackProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackProgress {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Progress::default()),
        }
    }

    pub fn get(&self) -> Progress {
        **self.current.load()
    }

    pub fn set_current_position(&self, seconds: f64) -> Progress {
        let next = Progress::new(seconds, self.get().duration);
        self.current.store(Arc::new(next));
        next
    }

    pub fn set_total_duration(&self, seconds: f64) -> Progress {
        let next = Progress::new(self.get().current_time, seconds);
        self.current.store(Arc::new(next));
        next
    }

    pub fn replace(&self, progress: Progress) {
        self.current.store(Arc::new(progress));
    }

    pub fn reset(&self) {
        self.current.store(Arc::new(Progress::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_lengths_are_infinite() {
        assert!(Progress::new(0.0, 0.0).is_live());
        assert!(Progress::new(0.0, -3.0).is_live());
        assert!(Progress::new(0.0, f64::NAN).is_live());
        assert_eq!(Progress::new(0.0, 200.0).finite_duration(), Some(200.0));
    }

    #[test]
    fn seek_clamps_to_known_length() {
        let p = Progress::new(10.0, 100.0);
        assert_eq!(p.clamp_seek(-5.0), 0.0);
        assert_eq!(p.clamp_seek(150.0), 100.0);
        assert_eq!(p.clamp_seek(42.0), 42.0);
    }

    #[test]
    fn seek_on_live_stream_is_open_ended() {
        let p = Progress::default();
        assert_eq!(p.clamp_seek(1e6), 1e6);
        assert_eq!(p.clamp_seek(-1.0), 0.0);
    }

    #[test]
    fn snapshot_keeps_other_field() {
        let progress = TrackProgress::new();
        progress.set_total_duration(180.0);
        let p = progress.set_current_position(12.5);
        assert_eq!(p, Progress::new(12.5, 180.0));
        progress.reset();
        assert_eq!(progress.get(), Progress::default());
    }
}
