//! Playback delegated to a supervised external player process.
//!
//! Commands wait on a [`ReadinessGate`] until the process is up. Property
//! changes coming back from the process are folded into a
//! [`PlayerState`] by the [`StateReconciler`]. An unexpected exit is
//! restarted with backoff and the previous track is restored at its last
//! position.

pub mod gate;
pub mod ipc;
pub mod mpv;
pub mod protocol;
pub mod reconciler;
pub mod supervisor;

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use flume::{Receiver, Sender};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        config::{BackendKind, ExternalConfig, RetryPolicy},
        error::PlayerError,
        progress::Progress,
        state::{PlayerState, StateInput},
        track::{Track, TrackSource},
        traits::{PlaybackBackend, check_seek, check_speed, clamp_volume},
    },
    event::events::PlayerEvent,
    util::{
        sync::{lock, read, write},
        task::TaskManager,
    },
};

use self::{
    gate::{GatePhase, ReadinessGate},
    mpv::MpvLauncher,
    protocol::{OBSERVED_PROPERTIES, ProcessSignal, Request},
    reconciler::StateReconciler,
    supervisor::{CrashDecision, ProcessLauncher, ProcessSupervisor},
};

/// What to bring back after a crash.
#[derive(Debug, Clone)]
struct Snapshot {
    source: Option<TrackSource>,
    position: f64,
    resume: bool,
    ended: bool,
}

struct Inner {
    supervisor: ProcessSupervisor,
    gate: ReadinessGate,
    reconciler: Mutex<StateReconciler>,
    track: RwLock<Option<(Track, TrackSource)>>,
    volume: AtomicU32,
    speed: AtomicU32,
    looping: AtomicBool,
    pending_seek: Mutex<Option<f64>>,
    quitting: AtomicBool,
    quit_epoch: watch::Sender<u64>,
    destroyed: AtomicBool,
    event_tx: Sender<PlayerEvent>,
    tasks: Mutex<TaskManager>,
}

pub struct ExternalProcessBackend {
    inner: Arc<Inner>,
}

impl ExternalProcessBackend {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ExternalConfig,
        policy: RetryPolicy,
        launcher: Arc<dyn ProcessLauncher>,
        volume: f32,
        speed: f32,
        event_tx: Sender<PlayerEvent>,
    ) -> Self {
        let (signal_tx, signal_rx) = flume::unbounded();
        let volume = clamp_volume(volume).unwrap_or(1.0);
        let speed = check_speed(speed).unwrap_or(1.0);

        let inner = Arc::new(Inner {
            supervisor: ProcessSupervisor::new(launcher, config, policy, signal_tx),
            gate: ReadinessGate::new(),
            reconciler: Mutex::new(StateReconciler::new()),
            track: RwLock::new(None),
            volume: AtomicU32::new(volume.to_bits()),
            speed: AtomicU32::new(speed.to_bits()),
            looping: AtomicBool::new(false),
            pending_seek: Mutex::new(None),
            quitting: AtomicBool::new(false),
            quit_epoch: watch::channel(0).0,
            destroyed: AtomicBool::new(false),
            event_tx,
            tasks: Mutex::new(TaskManager::new()),
        });

        let pump = tokio::spawn(Inner::pump(inner.clone(), signal_rx));
        lock(&inner.tasks).spawn("pump", pump);

        Self { inner }
    }

    pub fn with_mpv(
        config: ExternalConfig,
        policy: RetryPolicy,
        volume: f32,
        speed: f32,
        event_tx: Sender<PlayerEvent>,
    ) -> Self {
        Self::new(config, policy, Arc::new(MpvLauncher), volume, speed, event_tx)
    }

    /// Reads a raw property from the running process.
    pub async fn get_property(&self, name: &str) -> Result<Value, PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.wait_ready().await?;
        inner
            .send(Request::GetProperty {
                name: name.to_string(),
            })
            .await
    }

    pub fn gate_phase(&self) -> GatePhase {
        self.inner.gate.phase()
    }

    pub fn restart_attempts(&self) -> u32 {
        self.inner.supervisor.retries()
    }
}

impl Drop for ExternalProcessBackend {
    fn drop(&mut self) {
        lock(&self.inner.tasks).abort_all();
    }
}

impl Inner {
    fn emit(&self, event: PlayerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Runs `f` on the reconciler and publishes what it produced. Events
    /// leave while the lock is held so they keep their order.
    fn reconcile(&self, f: impl FnOnce(&mut StateReconciler) -> Vec<PlayerEvent>) {
        let mut reconciler = lock(&self.reconciler);
        for event in f(&mut reconciler) {
            self.emit(event);
        }
    }

    fn has_track(&self) -> bool {
        read(&self.track).is_some()
    }

    fn source(&self) -> Option<TrackSource> {
        read(&self.track).as_ref().map(|(_, source)| source.clone())
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn speed(&self) -> f32 {
        f32::from_bits(self.speed.load(Ordering::Relaxed))
    }

    fn epoch(&self) -> u64 {
        *self.quit_epoch.borrow()
    }

    fn ensure_alive(&self) -> Result<(), PlayerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(PlayerError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn init_timeout(&self) -> Duration {
        self.supervisor.config().init_timeout()
    }

    /// Waits for the gate, bounded by the init timeout.
    async fn wait_ready(&self) -> Result<(), PlayerError> {
        tokio::time::timeout(self.init_timeout(), self.gate.wait())
            .await
            .map_err(|_| PlayerError::NotReady)?
    }

    async fn send(&self, request: Request) -> Result<Value, PlayerError> {
        let process = self.supervisor.process().ok_or(PlayerError::NotReady)?;
        process.request(request).await
    }

    /// Sends a command whose failure is reported as an event, not returned.
    async fn command(&self, request: Request) {
        if let Err(e) = self.send(request).await {
            warn!(error = %e, "external_command_failed");
            // A dead process is reported by recovery instead.
            if self.gate.is_open() {
                self.emit(PlayerEvent::Error(e));
            }
        }
    }

    /// Sends a setting the process also receives on every start. Without a
    /// live process the stored value is enough.
    async fn push_setting(&self, request: Request) {
        if self.gate.in_flight() {
            let _ = self.gate.wait_settled().await;
        }
        if self.gate.is_open() {
            self.command(request).await;
        }
    }

    async fn pump(self: Arc<Self>, signal_rx: Receiver<(u64, ProcessSignal)>) {
        while let Ok((generation, signal)) = signal_rx.recv_async().await {
            if self.quitting.load(Ordering::SeqCst) {
                continue;
            }

            match signal {
                ProcessSignal::Exited { code } => self.on_exit(generation, code),
                signal => {
                    if !self.supervisor.is_current(generation) {
                        debug!(generation, "stale_process_signal");
                        continue;
                    }
                    let started = signal == ProcessSignal::Started;
                    let has_track = self.has_track();
                    self.reconcile(|r| r.on_signal(signal, has_track));
                    if started {
                        self.flush_pending_seek();
                    }
                }
            }
        }
    }

    fn flush_pending_seek(self: &Arc<Self>) {
        let Some(seconds) = lock(&self.pending_seek).take() else {
            return;
        };
        let inner = self.clone();
        let task = tokio::spawn(async move {
            inner.command(Request::Seek { seconds }).await;
        });
        lock(&self.tasks).spawn("seek", task);
    }

    fn on_exit(self: &Arc<Self>, generation: u64, code: Option<i32>) {
        // An exit during startup fails that attempt; the attempt accounts for it.
        if !self.gate.is_open() {
            self.supervisor.forget(generation);
            return;
        }

        let decision = self.supervisor.on_exit(generation);
        if decision == CrashDecision::Ignore {
            return;
        }
        warn!(generation, ?code, "external_process_exited");

        let snapshot = {
            let reconciler = lock(&self.reconciler);
            Snapshot {
                source: self.source(),
                position: reconciler.progress().current_time,
                resume: matches!(
                    reconciler.state(),
                    PlayerState::Playing | PlayerState::Buffering
                ) && !reconciler.paused(),
                ended: reconciler.needs_reload(),
            }
        };
        self.gate.reset();
        self.reconcile(|r| r.on_crash());

        match decision {
            CrashDecision::Retry { attempt, delay } => {
                let task = tokio::spawn(self.clone().recover(snapshot, attempt, delay));
                lock(&self.tasks).spawn("recovery", task);
            }
            CrashDecision::Exhausted(max) => self.give_up(max),
            CrashDecision::Ignore => {}
        }
    }

    async fn recover(self: Arc<Self>, snapshot: Snapshot, mut attempt: u32, mut delay: Duration) {
        let epoch = self.epoch();
        loop {
            self.emit(PlayerEvent::Error(PlayerError::ProcessCrashed { attempt }));
            info!(attempt, delay_ms = delay.as_millis() as u64, "external_restart_scheduled");
            tokio::time::sleep(delay).await;
            if self.epoch() != epoch {
                return;
            }

            let outcome = if self.gate.try_begin() {
                self.attempt_init(true).await
            } else {
                self.gate.wait_settled().await
            };

            match outcome {
                Ok(()) => {
                    self.restore(snapshot).await;
                    return;
                }
                Err(e) if e.is_config_error() || e == PlayerError::NotReady => {
                    warn!(error = %e, "external_restart_abandoned");
                    self.gate.reject(e);
                    *write(&self.track) = None;
                    self.reconcile(|r| r.clear());
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "external_restart_failed");
                    match self.supervisor.register_failed_restart() {
                        CrashDecision::Retry {
                            attempt: next,
                            delay: next_delay,
                        } => {
                            // Still recovering: commands keep waiting.
                            self.gate.rearm();
                            attempt = next;
                            delay = next_delay;
                        }
                        CrashDecision::Exhausted(max) => {
                            self.give_up(max);
                            return;
                        }
                        CrashDecision::Ignore => {
                            self.gate.reject(PlayerError::NotReady);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn restore(&self, snapshot: Snapshot) {
        let Some(source) = snapshot.source else {
            return;
        };
        // Only reload if nothing replaced the track while restarting.
        if self.source().as_ref() != Some(&source) {
            return;
        }
        // Nothing was playing: keep the track for the next `play()`.
        if snapshot.ended {
            lock(&self.reconciler).cancel_load();
            return;
        }

        let seek = (snapshot.position > 0.0).then_some(snapshot.position);
        info!(position = snapshot.position, resume = snapshot.resume, "external_restore");
        if let Err(e) = self.load_source(&source, snapshot.resume, seek).await {
            warn!(error = %e, "external_restore_failed");
            self.reconcile(|r| r.apply(StateInput::Failed(PlayerError::EmptyResource)));
        }
    }

    fn give_up(&self, max: u32) {
        error!(max, "external_restart_exhausted");
        self.gate.reject(PlayerError::RetriesExhausted(max));
        *write(&self.track) = None;
        *lock(&self.pending_seek) = None;
        self.reconcile(|r| {
            let mut events = r.clear();
            events.extend(r.apply(StateInput::Failed(PlayerError::RetriesExhausted(max))));
            events
        });
    }

    async fn initialize(&self) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        if self.gate.is_open() {
            return Ok(());
        }
        let rejected = matches!(self.gate.phase(), GatePhase::Rejected(_));
        if !self.gate.try_begin() {
            return match self.gate.wait_settled().await {
                // A failed restart with another one scheduled.
                Err(_) if self.gate.phase() == GatePhase::Pending => self.wait_ready().await,
                outcome => outcome,
            };
        }
        if rejected {
            self.supervisor.reset_retries();
        }
        self.attempt_init(false).await
    }

    /// Runs one bring-up. The caller must hold the gate slot. A failed
    /// `recovering` attempt leaves the gate pending for the caller to settle.
    async fn attempt_init(&self, recovering: bool) -> Result<(), PlayerError> {
        let mut quit_rx = self.quit_epoch.subscribe();
        let epoch = *quit_rx.borrow_and_update();
        let timeout = self.init_timeout();
        let outcome = tokio::select! {
            biased;
            _ = quit_rx.changed() => Err(PlayerError::NotReady),
            outcome = tokio::time::timeout(timeout, self.bring_up()) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(PlayerError::InitTimeout(timeout.as_millis() as u64)),
            },
        };

        if self.epoch() != epoch || self.destroyed.load(Ordering::SeqCst) {
            // `quit` already freed the slot; a newer attempt may hold it.
            if !self.gate.in_flight() && !self.gate.is_open() {
                self.supervisor.shutdown().await;
            }
            return Err(PlayerError::NotReady);
        }

        match outcome {
            Ok(()) => {
                self.supervisor.mark_ready();
                self.gate.complete(Ok(()));
                info!("external_ready");
                self.emit(PlayerEvent::InitSuccess);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "external_init_failed");
                self.supervisor.shutdown().await;
                if recovering {
                    self.gate.release();
                } else {
                    self.gate.complete(Err(e.clone()));
                }
                self.emit(PlayerEvent::InitFailed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<(), PlayerError> {
        let process = self.supervisor.spawn().await?;

        let volume = self.volume();
        let speed = self.speed();
        {
            let mut reconciler = lock(&self.reconciler);
            reconciler.note_volume(volume);
            reconciler.note_speed(speed);
        }
        process.request(Request::set_volume(volume)).await?;
        process.request(Request::set_speed(speed)).await?;
        process
            .request(Request::set_loop(self.looping.load(Ordering::SeqCst)))
            .await?;

        for (id, name) in (1u64..).zip(OBSERVED_PROPERTIES) {
            process
                .request(Request::ObserveProperty {
                    id,
                    name: name.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    /// Hands `source` to the process, paused unless `autoplay`.
    async fn load_source(
        &self,
        source: &TrackSource,
        autoplay: bool,
        seek: Option<f64>,
    ) -> Result<(), PlayerError> {
        let process = self.supervisor.process().ok_or(PlayerError::NotReady)?;
        {
            let mut reconciler = lock(&self.reconciler);
            *lock(&self.pending_seek) = seek;
            for event in reconciler.begin_load() {
                self.emit(event);
            }
        }

        process.request(Request::set_headers(&source.headers)).await?;
        if let Some(user_agent) = &source.user_agent {
            process.request(Request::set_user_agent(user_agent)).await?;
        }
        process.request(Request::set_pause(!autoplay)).await?;
        process
            .request(Request::LoadFile {
                url: source.url.clone(),
            })
            .await?;
        Ok(())
    }

    fn clear_track(&self) {
        *write(&self.track) = None;
        *lock(&self.pending_seek) = None;
        self.reconcile(|r| r.clear());
    }
}

#[async_trait]
impl PlaybackBackend for ExternalProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ExternalProcess
    }

    async fn initialize(&self) -> Result<(), PlayerError> {
        self.inner.initialize().await
    }

    async fn set_track_source(&self, source: TrackSource, track: Track) {
        let inner = &self.inner;
        if let Err(e) = inner.ensure_alive() {
            inner.emit(PlayerEvent::Error(e));
            return;
        }

        if source.is_empty() {
            inner.clear_track();
            if inner.gate.is_open() {
                let _ = inner.send(Request::Stop).await;
            }
            inner.reconcile(|r| r.apply(StateInput::Failed(PlayerError::EmptyResource)));
            return;
        }

        if let Err(e) = inner.initialize().await {
            debug!(error = %e, "external_load_without_process");
            inner.clear_track();
            inner.reconcile(|r| r.apply(StateInput::Failed(PlayerError::EmptyResource)));
            return;
        }

        info!(id = track.id.as_str(), "external_load");
        *write(&inner.track) = Some((track, source.clone()));
        if let Err(e) = inner.load_source(&source, false, None).await {
            warn!(error = %e, "external_load_failed");
            inner.reconcile(|r| r.apply(StateInput::Failed(PlayerError::EmptyResource)));
        }
    }

    async fn play(&self) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.wait_ready().await?;

        let Some(source) = inner.source() else {
            inner.emit(PlayerEvent::Error(PlayerError::EmptyResource));
            return Ok(());
        };

        let reload = lock(&inner.reconciler).needs_reload();
        if reload {
            if let Err(e) = inner.load_source(&source, true, None).await {
                warn!(error = %e, "external_replay_failed");
                inner.reconcile(|r| r.apply(StateInput::Failed(PlayerError::EmptyResource)));
            }
            return Ok(());
        }

        inner.command(Request::set_pause(false)).await;
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.wait_ready().await?;
        if !inner.has_track() {
            inner.emit(PlayerEvent::Error(PlayerError::EmptyResource));
            return Ok(());
        }
        inner.command(Request::set_pause(true)).await;
        Ok(())
    }

    async fn resume(&self) -> Result<(), PlayerError> {
        self.play().await
    }

    async fn seek_to(&self, seconds: f64) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let seconds = check_seek(seconds)?;
        inner.wait_ready().await?;
        if !inner.has_track() {
            inner.emit(PlayerEvent::Error(PlayerError::EmptyResource));
            return Ok(());
        }

        let target = {
            let reconciler = lock(&inner.reconciler);
            let target = reconciler.progress().clamp_seek(seconds);
            if reconciler.is_loading() {
                *lock(&inner.pending_seek) = Some(target);
                None
            } else {
                Some(target)
            }
        };

        match target {
            Some(seconds) => inner.command(Request::Seek { seconds }).await,
            None => debug!(seconds, "seek_deferred_until_loaded"),
        }
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let volume = clamp_volume(volume)?;
        inner.volume.store(volume.to_bits(), Ordering::Relaxed);
        lock(&inner.reconciler).note_volume(volume);
        inner.emit(PlayerEvent::VolumeChanged(volume));
        inner.push_setting(Request::set_volume(volume)).await;
        Ok(())
    }

    async fn set_speed(&self, speed: f32) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let speed = check_speed(speed)?;
        inner.speed.store(speed.to_bits(), Ordering::Relaxed);
        lock(&inner.reconciler).note_speed(speed);
        inner.emit(PlayerEvent::SpeedChanged(speed));
        inner.push_setting(Request::set_speed(speed)).await;
        Ok(())
    }

    async fn set_loop(&self, looping: bool) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.looping.store(looping, Ordering::SeqCst);
        inner.push_setting(Request::set_loop(looping)).await;
        Ok(())
    }

    async fn set_sink_id(&self, device: &str) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.wait_ready().await?;
        inner.command(Request::set_audio_device(device)).await;
        Ok(())
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.wait_ready().await?;
        inner.send(Request::set(name, value)).await.map(|_| ())
    }

    async fn reset(&self) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.clear_track();
        if inner.gate.is_open() {
            let _ = inner.send(Request::Stop).await;
        }
        Ok(())
    }

    async fn quit(&self) -> Result<(), PlayerError> {
        let inner = &self.inner;
        inner.ensure_alive()?;

        inner.quitting.store(true, Ordering::SeqCst);
        inner.quit_epoch.send_modify(|epoch| *epoch += 1);
        {
            let mut tasks = lock(&inner.tasks);
            tasks.abort("recovery");
            tasks.abort("seek");
        }
        inner.gate.abandon(PlayerError::NotReady);
        inner.supervisor.shutdown().await;
        inner.clear_track();
        inner.quitting.store(false, Ordering::SeqCst);
        info!("external_quit");
        Ok(())
    }

    async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.quit().await;
        inner.destroyed.store(true, Ordering::SeqCst);
        inner.gate.reject(PlayerError::Destroyed);
        lock(&inner.tasks).abort_all();
        info!("external_destroyed");
    }

    fn state(&self) -> PlayerState {
        lock(&self.inner.reconciler).state()
    }

    fn progress(&self) -> Progress {
        lock(&self.inner.reconciler).progress()
    }

    fn current_track(&self) -> Option<Track> {
        read(&self.inner.track).as_ref().map(|(track, _)| track.clone())
    }

    fn volume(&self) -> f32 {
        self.inner.volume()
    }

    fn speed(&self) -> f32 {
        self.inner.speed()
    }
}
