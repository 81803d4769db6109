use tracing::debug;

use crate::{
    audio::{
        error::PlayerError,
        progress::{Progress, normalize_duration},
        state::{Effect, PlayerState, StateInput, transition},
    },
    event::events::PlayerEvent,
};

use super::protocol::{ProcessSignal, Property, StopReason};

/// Folds the external process's property stream into [`PlayerState`].
///
/// The process reports `pause`, `eof-reached` and `idle-active` as
/// independent flags, and reports a user stop and a natural end through
/// different channels. Only the end of stream produces `Ended`, and only
/// once per loaded file.
#[derive(Debug)]
pub struct StateReconciler {
    state: PlayerState,
    current_time: f64,
    duration: f64,
    paused: bool,
    eof: bool,
    halted: bool,
    loading: bool,
    volume: Option<f32>,
    speed: Option<f32>,
}

impl Default for StateReconciler {
    fn default() -> Self {
        Self {
            state: PlayerState::None,
            current_time: 0.0,
            duration: f64::INFINITY,
            paused: true,
            eof: false,
            halted: false,
            loading: false,
            volume: None,
            speed: None,
        }
    }
}

impl StateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn progress(&self) -> Progress {
        Progress {
            current_time: self.current_time,
            duration: self.duration,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_ended(&self) -> bool {
        self.eof
    }

    /// The process no longer holds the current file, through eof or an
    /// unexpected stop. Playing it again means loading it again.
    pub fn needs_reload(&self) -> bool {
        self.eof || self.halted
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn apply(&mut self, input: StateInput) -> Vec<PlayerEvent> {
        let t = transition(self.state, input);
        self.state = t.state;
        t.effects
            .into_iter()
            .map(|effect| match effect {
                Effect::StateChanged(next) => PlayerEvent::StateChanged(next),
                Effect::Ended => PlayerEvent::Ended,
                Effect::Error(err) => PlayerEvent::Error(err),
            })
            .collect()
    }

    /// A new file was handed to the process.
    pub fn begin_load(&mut self) -> Vec<PlayerEvent> {
        self.loading = true;
        self.eof = false;
        self.halted = false;
        self.current_time = 0.0;
        self.duration = f64::INFINITY;
        self.apply(StateInput::Loading)
    }

    /// The load a crash left pending is not coming.
    pub fn cancel_load(&mut self) {
        self.loading = false;
    }

    pub fn clear(&mut self) -> Vec<PlayerEvent> {
        self.loading = false;
        self.eof = false;
        self.halted = false;
        self.current_time = 0.0;
        self.duration = f64::INFINITY;
        self.apply(StateInput::Cleared)
    }

    /// The process died. Anything that was moving is now waiting on
    /// recovery, and the new process's flags count as part of a load until
    /// the track is back.
    pub fn on_crash(&mut self) -> Vec<PlayerEvent> {
        self.loading = true;
        self.volume = None;
        self.speed = None;
        match self.state {
            PlayerState::Playing => self.apply(StateInput::Loading),
            _ => Vec::new(),
        }
    }

    /// Records a value the host just asked for, so its echo is not re-emitted.
    pub fn note_volume(&mut self, volume: f32) {
        self.volume = Some(volume);
    }

    pub fn note_speed(&mut self, speed: f32) {
        self.speed = Some(speed);
    }

    pub fn on_signal(&mut self, signal: ProcessSignal, has_track: bool) -> Vec<PlayerEvent> {
        match signal {
            ProcessSignal::Property(property) => self.on_property(property, has_track),
            ProcessSignal::Started => {
                self.loading = false;
                if !has_track {
                    return Vec::new();
                }
                if self.paused {
                    self.apply(StateInput::Paused)
                } else {
                    self.apply(StateInput::Playing)
                }
            }
            ProcessSignal::Stopped(reason) => self.on_stopped(reason, has_track),
            // Crash handling belongs to the supervisor.
            ProcessSignal::Exited { .. } => Vec::new(),
        }
    }

    fn on_stopped(&mut self, reason: StopReason, has_track: bool) -> Vec<PlayerEvent> {
        if let StopReason::Error(message) = reason {
            debug!(message = message.as_str(), "external_file_error");
            self.loading = false;
            if !has_track {
                return Vec::new();
            }
            return self.apply(StateInput::Failed(PlayerError::EmptyResource));
        }

        // The previous file being replaced reports a stop of its own.
        if self.loading || self.eof {
            return Vec::new();
        }
        self.halted = true;
        self.apply(StateInput::Halted)
    }

    fn on_property(&mut self, property: Property, has_track: bool) -> Vec<PlayerEvent> {
        match property {
            Property::TimePos(seconds) => {
                let seconds = seconds.max(0.0);
                if !has_track || seconds == self.current_time {
                    return Vec::new();
                }
                self.current_time = seconds;
                vec![PlayerEvent::Progress(self.progress())]
            }
            Property::Duration(seconds) => {
                let duration = normalize_duration(seconds);
                if !has_track || duration == self.duration {
                    return Vec::new();
                }
                self.duration = duration;
                vec![PlayerEvent::Progress(self.progress())]
            }
            Property::Pause(paused) => {
                self.paused = paused;
                if !has_track || self.loading || self.needs_reload() {
                    return Vec::new();
                }
                if paused {
                    self.apply(StateInput::Paused)
                } else {
                    self.apply(StateInput::Playing)
                }
            }
            Property::Volume(volume) => {
                if same_level(self.volume, volume) {
                    return Vec::new();
                }
                self.volume = Some(volume);
                vec![PlayerEvent::VolumeChanged(volume)]
            }
            Property::Speed(speed) => {
                if same_level(self.speed, speed) {
                    return Vec::new();
                }
                self.speed = Some(speed);
                vec![PlayerEvent::SpeedChanged(speed)]
            }
            Property::EofReached(true) => {
                if self.eof || !has_track || self.loading {
                    return Vec::new();
                }
                self.eof = true;
                let mut events = Vec::new();
                if self.duration.is_finite() && self.current_time != self.duration {
                    self.current_time = self.duration;
                    events.push(PlayerEvent::Progress(self.progress()));
                }
                events.extend(self.apply(StateInput::EndOfStream));
                events
            }
            // Cleared only by the next load.
            Property::EofReached(false) => Vec::new(),
            Property::IdleActive(idle) => {
                if idle && !has_track {
                    self.apply(StateInput::Cleared)
                } else {
                    Vec::new()
                }
            }
        }
    }
}

/// The process rounds volume to whole percent.
fn same_level(last: Option<f32>, reported: f32) -> bool {
    last.is_some_and(|last| (last - reported).abs() < 0.005)
}
