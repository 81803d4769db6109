use std::sync::{Arc, Mutex, RwLock};

use flume::{Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{
        commands::PlayerCommand,
        config::{BackendKind, PlayerConfig, SettingsStore},
        error::PlayerError,
        external::ExternalProcessBackend,
        local::{InProcessBackend, InProcessOptions},
        progress::Progress,
        state::PlayerState,
        track::{Track, TrackSource},
        traits::PlaybackBackend,
    },
    event::events::PlayerEvent,
    util::{
        sync::{lock, read, write},
        task::TaskManager,
    },
};

const EVENT_CAPACITY: usize = 256;

/// Single entry point for the rest of the application.
///
/// Holds exactly one backend, forwards commands to it and republishes its
/// events unchanged to every subscriber. Volume and speed changes are
/// written back to the settings store on the way through.
pub struct TrackPlayer {
    backend: RwLock<Arc<dyn PlaybackBackend>>,
    config: PlayerConfig,
    event_tx: Sender<PlayerEvent>,
    broadcast: broadcast::Sender<PlayerEvent>,
    tasks: Mutex<TaskManager>,
}

fn build_backend(
    kind: BackendKind,
    config: &PlayerConfig,
    event_tx: Sender<PlayerEvent>,
) -> Result<Arc<dyn PlaybackBackend>, PlayerError> {
    let backend: Arc<dyn PlaybackBackend> = match kind {
        BackendKind::InProcess => Arc::new(InProcessBackend::with_default_output(
            InProcessOptions {
                volume: config.volume,
                speed: config.speed,
                progress_interval: config.progress_interval(),
                ..InProcessOptions::default()
            },
            event_tx,
        )?),
        BackendKind::ExternalProcess => Arc::new(ExternalProcessBackend::with_mpv(
            config.external.clone(),
            config.retry.clone(),
            config.volume,
            config.speed,
            event_tx,
        )),
    };
    Ok(backend)
}

impl TrackPlayer {
    /// Builds the backend `config.backend` names. Must be called from
    /// within a tokio runtime.
    pub fn new(config: PlayerConfig, settings: Arc<dyn SettingsStore>) -> Result<Self, PlayerError> {
        let kind = config.backend;
        Self::with_backend(config.clone(), settings, |event_tx| {
            build_backend(kind, &config, event_tx)
        })
    }

    /// Wraps a backend built by `make`, which receives the channel the
    /// backend must report its events on.
    pub fn with_backend<F>(
        config: PlayerConfig,
        settings: Arc<dyn SettingsStore>,
        make: F,
    ) -> Result<Self, PlayerError>
    where
        F: FnOnce(Sender<PlayerEvent>) -> Result<Arc<dyn PlaybackBackend>, PlayerError>,
    {
        let (event_tx, event_rx) = flume::unbounded();
        let (broadcast, _) = broadcast::channel(EVENT_CAPACITY);
        let backend = make(event_tx.clone())?;
        info!(backend = ?backend.kind(), "track_player_created");

        let mut tasks = TaskManager::new();
        tasks.spawn(
            "relay",
            tokio::spawn(relay(event_rx, broadcast.clone(), settings)),
        );

        Ok(Self {
            backend: RwLock::new(backend),
            config,
            event_tx,
            broadcast,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.broadcast.subscribe()
    }

    pub fn backend(&self) -> Arc<dyn PlaybackBackend> {
        read(&self.backend).clone()
    }

    pub fn kind(&self) -> BackendKind {
        self.backend().kind()
    }

    /// Replaces the active backend. Only allowed once the current one has
    /// no track, i.e. after `reset()`.
    pub async fn switch_backend(&self, kind: BackendKind) -> Result<(), PlayerError> {
        let current = self.backend();
        if current.has_source() {
            return Err(PlayerError::InvalidArgument(
                "reset the player before switching backends".to_string(),
            ));
        }
        if current.kind() == kind {
            return Ok(());
        }

        let next = build_backend(kind, &self.config, self.event_tx.clone())?;
        current.destroy().await;
        *write(&self.backend) = next;
        info!(backend = ?kind, "backend_switched");
        Ok(())
    }

    pub async fn handle_command(&self, command: PlayerCommand) -> Result<(), PlayerError> {
        match command {
            PlayerCommand::Initialize => self.initialize().await,
            PlayerCommand::Load(source, track) => {
                self.load(source, track).await;
                Ok(())
            }
            PlayerCommand::Play => self.play().await,
            PlayerCommand::Pause => self.pause().await,
            PlayerCommand::Resume => self.resume().await,
            PlayerCommand::Stop => self.stop().await,
            PlayerCommand::Seek(seconds) => self.seek(seconds).await,
            PlayerCommand::SetVolume(volume) => self.set_volume(volume).await,
            PlayerCommand::SetSpeed(speed) => self.set_speed(speed).await,
            PlayerCommand::SetLoop(looping) => self.backend().set_loop(looping).await,
            PlayerCommand::SetSinkId(device) => self.backend().set_sink_id(&device).await,
            PlayerCommand::SetProperty(name, value) => self.set_property(&name, value).await,
            PlayerCommand::Quit => self.quit().await,
        }
    }

    pub async fn initialize(&self) -> Result<(), PlayerError> {
        self.backend().initialize().await
    }

    pub async fn load(&self, source: TrackSource, track: Track) {
        self.backend().set_track_source(source, track).await;
    }

    pub async fn play(&self) -> Result<(), PlayerError> {
        self.backend().play().await
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.backend().pause().await
    }

    pub async fn resume(&self) -> Result<(), PlayerError> {
        self.backend().resume().await
    }

    /// Stopping drops the track: both backends come back to `None`.
    pub async fn stop(&self) -> Result<(), PlayerError> {
        self.backend().reset().await
    }

    pub async fn reset(&self) -> Result<(), PlayerError> {
        self.backend().reset().await
    }

    pub async fn seek(&self, seconds: f64) -> Result<(), PlayerError> {
        self.backend().seek_to(seconds).await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        self.backend().set_volume(volume).await
    }

    pub async fn set_speed(&self, speed: f32) -> Result<(), PlayerError> {
        self.backend().set_speed(speed).await
    }

    pub async fn set_property(&self, name: &str, value: serde_json::Value) -> Result<(), PlayerError> {
        self.backend().set_property(name, value).await
    }

    pub async fn quit(&self) -> Result<(), PlayerError> {
        self.backend().quit().await
    }

    pub async fn destroy(&self) {
        self.backend().destroy().await;
    }

    pub fn state(&self) -> PlayerState {
        self.backend().state()
    }

    pub fn progress(&self) -> Progress {
        self.backend().progress()
    }

    pub fn current_track(&self) -> Option<Track> {
        self.backend().current_track()
    }

    /// `None` while the length is unknown or the stream is live.
    pub fn get_duration(&self) -> Option<f64> {
        self.progress().finite_duration()
    }

    pub fn get_current_time(&self) -> f64 {
        self.progress().current_time
    }

    pub fn volume(&self) -> f32 {
        self.backend().volume()
    }

    pub fn speed(&self) -> f32 {
        self.backend().speed()
    }
}

impl Drop for TrackPlayer {
    fn drop(&mut self) {
        lock(&self.tasks).abort_all();
    }
}

async fn relay(
    event_rx: Receiver<PlayerEvent>,
    broadcast: broadcast::Sender<PlayerEvent>,
    settings: Arc<dyn SettingsStore>,
) {
    while let Ok(event) = event_rx.recv_async().await {
        let persisted = match &event {
            PlayerEvent::VolumeChanged(volume) => settings.persist_volume(*volume),
            PlayerEvent::SpeedChanged(speed) => settings.persist_speed(*speed),
            _ => Ok(()),
        };
        if let Err(e) = persisted {
            warn!(error = %e, "settings_persist_failed");
        }
        // No subscribers is fine.
        let _ = broadcast.send(event);
    }
}
