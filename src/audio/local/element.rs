use flume::Sender;
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::audio::{error::PlayerError, track::TrackSource};

/// What a media element is asked to play.
#[derive(Debug, Clone)]
pub enum MediaInput {
    File(PathBuf),
    Remote(TrackSource),
    /// Fully fetched media, used for sources the element cannot open itself.
    Blob(Arc<[u8]>),
}

/// Native notifications of a media element. They map one to one onto
/// state transitions in the in-process backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementEvent {
    Playing,
    Pause { at_end: bool },
    Waiting,
    Error(String),
    TimeUpdate(f64),
    DurationChange(f64),
}

#[derive(Debug)]
pub(crate) enum LocalSignal {
    Element { generation: u64, event: ElementEvent },
    StreamFatal { generation: u64, message: String },
    Fetched {
        generation: u64,
        result: Result<Arc<[u8]>, PlayerError>,
    },
}

/// Handle an element uses to report its events to the owning backend.
///
/// Each event is stamped with the backend's load generation at the moment
/// it is emitted, so events still queued when the source is replaced are
/// dropped instead of landing on the next track.
#[derive(Debug, Clone)]
pub struct ElementEvents {
    tx: Sender<LocalSignal>,
    generation: Arc<AtomicU64>,
}

impl ElementEvents {
    pub(crate) fn new(tx: Sender<LocalSignal>, generation: Arc<AtomicU64>) -> Self {
        Self { tx, generation }
    }

    pub fn emit(&self, event: ElementEvent) {
        let _ = self.tx.send(LocalSignal::Element {
            generation: self.generation.load(Ordering::SeqCst),
            event,
        });
    }
}

/// A synchronous in-process player. Calls never block on I/O: loading is
/// started here and completion is reported through [`ElementEvents`].
pub trait MediaElement: Send {
    fn load(&mut self, input: MediaInput);
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError>;
    fn set_volume(&mut self, volume: f32);
    fn set_speed(&mut self, speed: f32);
    fn set_loop(&mut self, looping: bool) -> Result<(), PlayerError>;
    fn set_sink_id(&mut self, device: &str) -> Result<(), PlayerError>;
    fn unload(&mut self);
}

pub(crate) async fn fetch_bytes(
    http: &reqwest::Client,
    source: &TrackSource,
) -> Result<Arc<[u8]>, PlayerError> {
    let mut request = http.get(&source.url);
    for (name, value) in &source.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(user_agent) = &source.user_agent {
        request = request.header(reqwest::header::USER_AGENT, user_agent.as_str());
    }

    let response = request.send().await?.error_for_status()?;
    let body = response.bytes().await?;
    Ok(Arc::from(body.to_vec()))
}
