use crate::audio::error::PlayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    None,
    Playing,
    Paused,
    Buffering,
}

/// Something that happened to the media, as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StateInput {
    /// A new source was handed to the backend.
    Loading,
    Playing,
    Paused,
    /// The media stalled waiting for data.
    Waiting,
    EndOfStream,
    Failed(PlayerError),
    /// Playback stopped without reaching the end.
    Halted,
    Cleared,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StateChanged(PlayerState),
    Ended,
    Error(PlayerError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: PlayerState,
    pub effects: Vec<Effect>,
}

/// Pure state machine shared by both backends.
///
/// `StateChanged` is only produced when the state actually changes, so
/// feeding the same input twice never yields a duplicate notification.
pub fn transition(current: PlayerState, input: StateInput) -> Transition {
    let mut effects = Vec::new();

    let next = match input {
        StateInput::Loading => PlayerState::Buffering,
        StateInput::Playing => PlayerState::Playing,
        StateInput::Paused => match current {
            PlayerState::None => PlayerState::None,
            _ => PlayerState::Paused,
        },
        StateInput::Waiting => match current {
            PlayerState::Playing => PlayerState::Buffering,
            other => other,
        },
        StateInput::EndOfStream => {
            effects.push(Effect::Ended);
            PlayerState::None
        }
        StateInput::Failed(err) => {
            effects.push(Effect::Error(err));
            PlayerState::None
        }
        StateInput::Halted | StateInput::Cleared => PlayerState::None,
    };

    if next != current {
        effects.insert(0, Effect::StateChanged(next));
    }

    Transition {
        state: next,
        effects,
    }
}
