//! Scripted stand-ins for the media element and the external process.

#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use trackplayer::{
    PlayerError, PlayerEvent, PlayerState,
    audio::{
        config::{ExternalConfig, RetryPolicy},
        external::{
            ExternalProcessBackend,
            protocol::{ProcessSignal, Property, Request, StopReason},
            supervisor::{LaunchOptions, MediaProcess, ProcessLauncher, SignalSink},
        },
        local::{
            InProcessBackend, InProcessOptions,
            element::{ElementEvent, ElementEvents, MediaElement, MediaInput},
            segmented::{SegmentedPlayer, SegmentedPlayerFactory, StreamReporter},
        },
        track::TrackSource,
    },
};

pub const WAIT: Duration = Duration::from_secs(1);

// ---- events ----

pub async fn next_event(rx: &flume::Receiver<PlayerEvent>) -> PlayerEvent {
    tokio::time::timeout(WAIT, rx.recv_async())
        .await
        .expect("no event within timeout")
        .expect("event channel closed")
}

/// Collects events until `done` matches one, which is included.
pub async fn events_until(
    rx: &flume::Receiver<PlayerEvent>,
    done: impl Fn(&PlayerEvent) -> bool,
) -> Vec<PlayerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let stop = done(&event);
        seen.push(event);
        if stop {
            return seen;
        }
    }
}

/// Everything that arrives within `window`.
pub async fn drain(rx: &flume::Receiver<PlayerEvent>, window: Duration) -> Vec<PlayerEvent> {
    tokio::time::sleep(window).await;
    rx.try_iter().collect()
}

pub fn states(events: &[PlayerEvent]) -> Vec<PlayerState> {
    events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within timeout");
}

// ---- in-process ----

#[derive(Debug, Clone, PartialEq)]
pub enum ElementCall {
    Load(String),
    Play,
    Pause,
    Seek(f64),
    Volume(f32),
    Speed(f32),
    Loop(bool),
    SinkId(String),
    Unload,
}

/// Test-side handle on a [`FakeElement`]: sees its calls and drives its events.
#[derive(Clone, Default)]
pub struct ElementScript {
    calls: Arc<Mutex<Vec<ElementCall>>>,
    events: Arc<Mutex<Option<ElementEvents>>>,
}

impl ElementScript {
    pub fn calls(&self) -> Vec<ElementCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn emit(&self, event: ElementEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.emit(event);
        }
    }

    pub fn factory(
        script: ElementScript,
    ) -> impl FnOnce(ElementEvents) -> Result<Box<dyn MediaElement>, PlayerError> {
        move |events| {
            *script.events.lock().unwrap() = Some(events.clone());
            Ok(Box::new(FakeElement {
                script,
                events,
                loaded: false,
            }) as Box<dyn MediaElement>)
        }
    }
}

/// Reports `Playing` / `Pause` right away once something is loaded.
pub struct FakeElement {
    script: ElementScript,
    events: ElementEvents,
    loaded: bool,
}

impl FakeElement {
    fn record(&self, call: ElementCall) {
        self.script.calls.lock().unwrap().push(call);
    }
}

impl MediaElement for FakeElement {
    fn load(&mut self, input: MediaInput) {
        let what = match input {
            MediaInput::File(path) => path.display().to_string(),
            MediaInput::Remote(source) => source.url,
            MediaInput::Blob(data) => format!("blob:{}", data.len()),
        };
        self.record(ElementCall::Load(what));
        self.loaded = true;
    }

    fn play(&mut self) {
        self.record(ElementCall::Play);
        if self.loaded {
            self.events.emit(ElementEvent::Playing);
        }
    }

    fn pause(&mut self) {
        self.record(ElementCall::Pause);
        if self.loaded {
            self.events.emit(ElementEvent::Pause { at_end: false });
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
        self.record(ElementCall::Seek(seconds));
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.record(ElementCall::Volume(volume));
    }

    fn set_speed(&mut self, speed: f32) {
        self.record(ElementCall::Speed(speed));
    }

    fn set_loop(&mut self, looping: bool) -> Result<(), PlayerError> {
        self.record(ElementCall::Loop(looping));
        Ok(())
    }

    fn set_sink_id(&mut self, device: &str) -> Result<(), PlayerError> {
        self.record(ElementCall::SinkId(device.to_string()));
        Ok(())
    }

    fn unload(&mut self) {
        self.record(ElementCall::Unload);
        self.loaded = false;
    }
}

pub struct FakeSubPlayer {
    destroyed: Arc<AtomicU32>,
}

impl SegmentedPlayer for FakeSubPlayer {
    fn attach(&mut self, element: &mut dyn MediaElement) -> Result<(), PlayerError> {
        element.load(MediaInput::Remote(TrackSource::new("segmented")));
        Ok(())
    }

    fn destroy(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out sub-players and keeps every reporter it gave them.
#[derive(Default)]
pub struct FakeSegmentedFactory {
    pub reporters: Mutex<Vec<StreamReporter>>,
    pub destroyed: Arc<AtomicU32>,
}

impl SegmentedPlayerFactory for FakeSegmentedFactory {
    fn create(
        &self,
        _source: &TrackSource,
        reporter: StreamReporter,
    ) -> Result<Box<dyn SegmentedPlayer>, PlayerError> {
        self.reporters.lock().unwrap().push(reporter);
        Ok(Box::new(FakeSubPlayer {
            destroyed: self.destroyed.clone(),
        }))
    }
}

pub fn in_process(
    options: InProcessOptions,
) -> (InProcessBackend, ElementScript, flume::Receiver<PlayerEvent>) {
    let (tx, rx) = flume::unbounded();
    let script = ElementScript::default();
    let backend = InProcessBackend::new(ElementScript::factory(script.clone()), options, tx).unwrap();
    (backend, script, rx)
}

// ---- external ----

/// An executable file that passes binary validation. Keep the directory alive.
pub fn fake_binary() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv");
    std::fs::write(&path, "#!/bin/sh\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    (dir, path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Healthy,
    Fail,
    Hang,
}

pub struct FakeLauncher {
    mode: Mutex<LaunchMode>,
    launches: AtomicU32,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeLauncher {
    pub fn new(mode: LaunchMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            launches: AtomicU32::new(0),
            processes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: LaunchMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn process(&self) -> Arc<FakeProcess> {
        self.processes
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no process launched")
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(
        &self,
        _options: &LaunchOptions,
        signals: SignalSink,
    ) -> Result<Arc<dyn MediaProcess>, PlayerError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            LaunchMode::Fail => Err(PlayerError::InitFailed("scripted failure".to_string())),
            LaunchMode::Hang => std::future::pending().await,
            LaunchMode::Healthy => {
                let process = Arc::new(FakeProcess::new(signals));
                self.processes.lock().unwrap().push(process.clone());
                Ok(process)
            }
        }
    }
}

/// Answers requests the way mpv would, reporting property changes back.
pub struct FakeProcess {
    signals: SignalSink,
    requests: Mutex<Vec<Request>>,
    paused: AtomicBool,
    dead: AtomicBool,
    pub duration: f64,
}

impl FakeProcess {
    fn new(signals: SignalSink) -> Self {
        Self {
            signals,
            requests: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            duration: 180.0,
        }
    }

    pub fn emit(&self, signal: ProcessSignal) {
        self.signals.send(signal);
    }

    pub fn property(&self, property: Property) {
        self.emit(ProcessSignal::Property(property));
    }

    pub fn crash(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.emit(ProcessSignal::Exited { code: Some(1) });
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn received(&self, request: &Request) -> bool {
        self.requests.lock().unwrap().contains(request)
    }

    fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) != paused {
            self.property(Property::Pause(paused));
        }
    }
}

#[async_trait]
impl MediaProcess for FakeProcess {
    async fn request(&self, request: Request) -> Result<Value, PlayerError> {
        if self.is_dead() {
            return Err(PlayerError::Ipc("connection closed".to_string()));
        }
        self.requests.lock().unwrap().push(request.clone());

        match request {
            Request::SetProperty { name, value } => match name.as_str() {
                "pause" => self.set_paused(value.as_bool().unwrap_or(false)),
                "volume" => self.property(Property::Volume(
                    (value.as_f64().unwrap_or(100.0) / 100.0) as f32,
                )),
                "speed" => self.property(Property::Speed(value.as_f64().unwrap_or(1.0) as f32)),
                _ => {}
            },
            Request::ObserveProperty { name, .. } => match name.as_str() {
                "pause" => self.property(Property::Pause(self.paused.load(Ordering::SeqCst))),
                "idle-active" => self.property(Property::IdleActive(true)),
                _ => {}
            },
            Request::LoadFile { .. } => {
                self.property(Property::IdleActive(false));
                self.emit(ProcessSignal::Started);
                self.property(Property::Duration(self.duration));
                self.property(Property::TimePos(0.0));
            }
            Request::Seek { seconds } => self.property(Property::TimePos(seconds)),
            Request::Stop => self.emit(ProcessSignal::Stopped(StopReason::Stop)),
            Request::GetProperty { name } if name == "duration" => {
                return Ok(json!(self.duration));
            }
            Request::GetProperty { .. } | Request::Quit => {}
        }
        Ok(Value::Null)
    }

    async fn terminate(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms: 10,
        max_delay_ms: 40,
        stable_after_ms: 60_000,
    }
}

pub fn external_config(binary: Option<PathBuf>) -> ExternalConfig {
    ExternalConfig {
        binary_path: binary,
        extra_args: Vec::new(),
        init_timeout_ms: 500,
        ipc_timeout_ms: 200,
    }
}

pub fn external(
    launcher: Arc<FakeLauncher>,
    binary: Option<PathBuf>,
    max_retries: u32,
) -> (ExternalProcessBackend, flume::Receiver<PlayerEvent>) {
    let (tx, rx) = flume::unbounded();
    let backend = ExternalProcessBackend::new(
        external_config(binary),
        fast_retry(max_retries),
        launcher,
        1.0,
        1.0,
        tx,
    );
    (backend, rx)
}
