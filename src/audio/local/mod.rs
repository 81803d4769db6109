//! In-process playback: a synchronous media element whose native events are
//! mapped one to one onto [`PlayerState`] transitions.

pub mod element;
pub mod output;
pub mod segmented;

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        config::BackendKind,
        error::PlayerError,
        progress::{Progress, TrackProgress},
        state::{Effect, PlayerState, StateInput, transition},
        track::{SourceLocation, Track, TrackSource},
        traits::{PlaybackBackend, check_seek, check_speed, clamp_volume},
    },
    event::events::PlayerEvent,
    util::{
        sync::{lock, read, write},
        task::TaskManager,
    },
};

use self::{
    element::{ElementEvent, ElementEvents, LocalSignal, MediaElement, MediaInput, fetch_bytes},
    output::RodioElement,
    segmented::{SegmentedPlayer, SegmentedPlayerFactory, StreamReporter},
};

#[derive(Clone)]
pub struct InProcessOptions {
    pub segmented: Option<Arc<dyn SegmentedPlayerFactory>>,
    pub http: reqwest::Client,
    pub volume: f32,
    pub speed: f32,
    pub progress_interval: Duration,
}

impl Default for InProcessOptions {
    fn default() -> Self {
        Self {
            segmented: None,
            http: reqwest::Client::new(),
            volume: 1.0,
            speed: 1.0,
            progress_interval: Duration::from_millis(250),
        }
    }
}

struct Inner {
    element: Mutex<Box<dyn MediaElement>>,
    sub_player: Mutex<Option<Box<dyn SegmentedPlayer>>>,
    state: Mutex<PlayerState>,
    track: RwLock<Option<Track>>,
    progress: TrackProgress,
    volume: AtomicU32,
    speed: AtomicU32,
    generation: Arc<AtomicU64>,
    destroyed: AtomicBool,
    segmented: Option<Arc<dyn SegmentedPlayerFactory>>,
    http: reqwest::Client,
    signal_tx: Sender<LocalSignal>,
    event_tx: Sender<PlayerEvent>,
    tasks: Mutex<TaskManager>,
}

pub struct InProcessBackend {
    inner: Arc<Inner>,
}

impl InProcessBackend {
    /// Builds the backend around an element created by `make_element`.
    /// Must be called from within a tokio runtime.
    pub fn new<F>(
        make_element: F,
        options: InProcessOptions,
        event_tx: Sender<PlayerEvent>,
    ) -> Result<Self, PlayerError>
    where
        F: FnOnce(ElementEvents) -> Result<Box<dyn MediaElement>, PlayerError>,
    {
        let (signal_tx, signal_rx) = flume::unbounded();
        let generation = Arc::new(AtomicU64::new(0));
        let mut element = make_element(ElementEvents::new(signal_tx.clone(), generation.clone()))?;

        let volume = clamp_volume(options.volume).unwrap_or(1.0);
        let speed = check_speed(options.speed).unwrap_or(1.0);
        element.set_volume(volume);
        element.set_speed(speed);

        let inner = Arc::new(Inner {
            element: Mutex::new(element),
            sub_player: Mutex::new(None),
            state: Mutex::new(PlayerState::None),
            track: RwLock::new(None),
            progress: TrackProgress::new(),
            volume: AtomicU32::new(volume.to_bits()),
            speed: AtomicU32::new(speed.to_bits()),
            generation,
            destroyed: AtomicBool::new(false),
            segmented: options.segmented,
            http: options.http,
            signal_tx,
            event_tx,
            tasks: Mutex::new(TaskManager::new()),
        });

        let pump = tokio::spawn(Self::pump(inner.clone(), signal_rx));
        lock(&inner.tasks).spawn("pump", pump);

        Ok(Self { inner })
    }

    /// The default element: rodio on the default output device.
    pub fn with_default_output(
        options: InProcessOptions,
        event_tx: Sender<PlayerEvent>,
    ) -> Result<Self, PlayerError> {
        let http = options.http.clone();
        let tick = options.progress_interval;
        Self::new(
            move |events| {
                Ok(Box::new(RodioElement::new(events, http, tick)?) as Box<dyn MediaElement>)
            },
            options,
            event_tx,
        )
    }

    async fn pump(inner: Arc<Inner>, signal_rx: Receiver<LocalSignal>) {
        while let Ok(signal) = signal_rx.recv_async().await {
            inner.handle_signal(signal);
        }
    }
}

impl Drop for InProcessBackend {
    fn drop(&mut self) {
        lock(&self.inner.tasks).abort_all();
    }
}

impl Inner {
    fn emit(&self, event: PlayerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn apply(&self, input: StateInput) {
        let mut state = lock(&self.state);
        let t = transition(*state, input);
        *state = t.state;

        for effect in t.effects {
            match effect {
                Effect::StateChanged(next) => self.emit(PlayerEvent::StateChanged(next)),
                Effect::Ended => self.emit(PlayerEvent::Ended),
                Effect::Error(err) => self.emit(PlayerEvent::Error(err)),
            }
        }
    }

    fn has_track(&self) -> bool {
        read(&self.track).is_some()
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn speed(&self) -> f32 {
        f32::from_bits(self.speed.load(Ordering::Relaxed))
    }

    fn ensure_alive(&self) -> Result<(), PlayerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(PlayerError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn handle_signal(&self, signal: LocalSignal) {
        match signal {
            LocalSignal::Element { generation, event } => {
                if generation != self.generation.load(Ordering::SeqCst) {
                    debug!(generation, ?event, "stale_element_event");
                    return;
                }
                self.on_element_event(event);
            }
            LocalSignal::StreamFatal {
                generation,
                message,
            } => {
                if generation != self.generation.load(Ordering::SeqCst) {
                    return;
                }
                warn!(generation, message = message.as_str(), "segmented_player_fatal");
                self.teardown_sub_player();
                lock(&self.element).unload();
                self.apply(StateInput::Failed(PlayerError::Decode(message)));
            }
            LocalSignal::Fetched { generation, result } => {
                if generation != self.generation.load(Ordering::SeqCst) {
                    debug!(generation, "blob_fetch_superseded");
                    return;
                }
                match result {
                    Ok(data) => self.load_into_element(MediaInput::Blob(data)),
                    Err(e) => {
                        warn!(generation, error = %e, "blob_fetch_failed");
                        self.apply(StateInput::Failed(PlayerError::EmptyResource));
                    }
                }
            }
        }
    }

    fn on_element_event(&self, event: ElementEvent) {
        if !self.has_track() {
            return;
        }

        match event {
            ElementEvent::Playing => self.apply(StateInput::Playing),
            ElementEvent::Pause { at_end: false } => self.apply(StateInput::Paused),
            ElementEvent::Pause { at_end: true } => {
                let progress = self.progress.get();
                if let Some(duration) = progress.finite_duration() {
                    self.emit(PlayerEvent::Progress(self.progress.set_current_position(duration)));
                }
                self.apply(StateInput::EndOfStream);
            }
            ElementEvent::Waiting => self.apply(StateInput::Waiting),
            ElementEvent::Error(message) => {
                warn!(message = message.as_str(), "media_element_error");
                self.teardown_sub_player();
                self.apply(StateInput::Failed(PlayerError::EmptyResource));
            }
            ElementEvent::TimeUpdate(seconds) => {
                let previous = self.progress.get();
                let next = self.progress.set_current_position(seconds);
                if next != previous {
                    self.emit(PlayerEvent::Progress(next));
                }
            }
            ElementEvent::DurationChange(seconds) => {
                let previous = self.progress.get();
                let next = self.progress.set_total_duration(seconds);
                if next != previous {
                    self.emit(PlayerEvent::Progress(next));
                }
            }
        }
    }

    fn teardown_sub_player(&self) {
        if let Some(mut sub_player) = lock(&self.sub_player).take() {
            sub_player.destroy();
        }
    }

    fn load_into_element(&self, input: MediaInput) {
        let mut element = lock(&self.element);
        element.load(input);
        // Elements drop their rate on load.
        element.set_volume(self.volume());
        element.set_speed(self.speed());
    }

    /// Cancels everything tied to the current source. Returns the new
    /// generation. Whatever the teardown itself emits still carries the old one.
    fn supersede(&self) -> u64 {
        lock(&self.tasks).abort("fetch");
        self.teardown_sub_player();
        lock(&self.element).unload();
        self.progress.reset();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn start_segmented(&self, generation: u64, source: &TrackSource) {
        let Some(factory) = self.segmented.clone() else {
            self.apply(StateInput::Failed(PlayerError::UnsupportedResource(
                source.url.clone(),
            )));
            return;
        };

        let reporter = StreamReporter::new(generation, self.signal_tx.clone());
        let mut sub_player = match factory.create(source, reporter) {
            Ok(sub_player) => sub_player,
            Err(e) => {
                self.apply(StateInput::Failed(e));
                return;
            }
        };

        let attached = {
            let mut element = lock(&self.element);
            let attached = sub_player.attach(element.as_mut());
            element.set_volume(self.volume());
            element.set_speed(self.speed());
            attached
        };

        match attached {
            Ok(()) => *lock(&self.sub_player) = Some(sub_player),
            Err(e) => {
                sub_player.destroy();
                self.apply(StateInput::Failed(e));
            }
        }
    }

    fn start_fetch(&self, generation: u64, source: TrackSource) {
        let http = self.http.clone();
        let signal_tx = self.signal_tx.clone();
        let task = tokio::spawn(async move {
            let result = fetch_bytes(&http, &source).await;
            let _ = signal_tx.send(LocalSignal::Fetched { generation, result });
        });
        lock(&self.tasks).spawn("fetch", task);
    }
}

#[async_trait]
impl PlaybackBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn initialize(&self) -> Result<(), PlayerError> {
        self.inner.ensure_alive()
    }

    async fn set_track_source(&self, source: TrackSource, track: Track) {
        let inner = &self.inner;
        if let Err(e) = inner.ensure_alive() {
            inner.emit(PlayerEvent::Error(e));
            return;
        }

        let generation = inner.supersede();

        if source.is_empty() {
            *write(&inner.track) = None;
            inner.apply(StateInput::Failed(PlayerError::EmptyResource));
            return;
        }

        info!(generation, id = track.id.as_str(), "in_process_load");
        *write(&inner.track) = Some(track);
        inner.apply(StateInput::Loading);

        if source.is_segmented() {
            inner.start_segmented(generation, &source);
            return;
        }

        if let Some(authorized) = source.split_credentials() {
            inner.start_fetch(generation, authorized);
            return;
        }

        let input = match source.location() {
            SourceLocation::Local(path) => MediaInput::File(path),
            SourceLocation::Remote(_) => MediaInput::Remote(source),
        };
        inner.load_into_element(input);
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.inner.ensure_alive()?;
        if !self.inner.has_track() {
            self.inner.emit(PlayerEvent::Error(PlayerError::EmptyResource));
            return Ok(());
        }
        lock(&self.inner.element).play();
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        self.inner.ensure_alive()?;
        if !self.inner.has_track() {
            self.inner.emit(PlayerEvent::Error(PlayerError::EmptyResource));
            return Ok(());
        }
        lock(&self.inner.element).pause();
        Ok(())
    }

    async fn resume(&self) -> Result<(), PlayerError> {
        self.play().await
    }

    async fn seek_to(&self, seconds: f64) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let seconds = check_seek(seconds)?;
        if !inner.has_track() {
            inner.emit(PlayerEvent::Error(PlayerError::EmptyResource));
            return Ok(());
        }

        let target = inner.progress.get().clamp_seek(seconds);
        if let Err(e) = lock(&inner.element).seek(target) {
            inner.emit(PlayerEvent::Error(e));
            return Ok(());
        }
        inner.emit(PlayerEvent::Progress(inner.progress.set_current_position(target)));
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        self.inner.ensure_alive()?;
        let volume = clamp_volume(volume)?;
        self.inner.volume.store(volume.to_bits(), Ordering::Relaxed);
        lock(&self.inner.element).set_volume(volume);
        self.inner.emit(PlayerEvent::VolumeChanged(volume));
        Ok(())
    }

    async fn set_speed(&self, speed: f32) -> Result<(), PlayerError> {
        self.inner.ensure_alive()?;
        let speed = check_speed(speed)?;
        self.inner.speed.store(speed.to_bits(), Ordering::Relaxed);
        lock(&self.inner.element).set_speed(speed);
        self.inner.emit(PlayerEvent::SpeedChanged(speed));
        Ok(())
    }

    async fn set_loop(&self, looping: bool) -> Result<(), PlayerError> {
        self.inner.ensure_alive()?;
        lock(&self.inner.element).set_loop(looping)
    }

    async fn set_sink_id(&self, device: &str) -> Result<(), PlayerError> {
        self.inner.ensure_alive()?;
        lock(&self.inner.element).set_sink_id(device)
    }

    async fn reset(&self) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.supersede();
        *write(&inner.track) = None;
        inner.apply(StateInput::Cleared);
        Ok(())
    }

    async fn quit(&self) -> Result<(), PlayerError> {
        self.reset().await
    }

    async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.supersede();
        *write(&inner.track) = None;
        inner.apply(StateInput::Cleared);
        lock(&inner.tasks).abort_all();
        info!("in_process_destroyed");
    }

    fn state(&self) -> PlayerState {
        *lock(&self.inner.state)
    }

    fn progress(&self) -> Progress {
        self.inner.progress.get()
    }

    fn current_track(&self) -> Option<Track> {
        read(&self.inner.track).clone()
    }

    fn volume(&self) -> f32 {
        self.inner.volume()
    }

    fn speed(&self) -> f32 {
        self.inner.speed()
    }
}
