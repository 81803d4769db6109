use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use flume::Sender;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        config::{ExternalConfig, RetryPolicy},
        error::PlayerError,
    },
    util::sync::lock,
};

use super::protocol::{ProcessSignal, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Starting,
    Ready,
    Crashed,
    Quitting,
    Stopped,
}

/// A running external player the host can talk to.
#[async_trait]
pub trait MediaProcess: Send + Sync {
    async fn request(&self, request: Request) -> Result<Value, PlayerError>;

    /// Asks the process to quit, then makes sure it is gone.
    async fn terminate(&self);
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
    pub ipc_timeout: Duration,
}

/// Starts external players. Everything a process reports, its exit
/// included, goes through the given [`SignalSink`].
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        options: &LaunchOptions,
        signals: SignalSink,
    ) -> Result<Arc<dyn MediaProcess>, PlayerError>;
}

/// Signal channel stamped with the generation of the process it belongs to.
#[derive(Debug, Clone)]
pub struct SignalSink {
    generation: u64,
    tx: Sender<(u64, ProcessSignal)>,
}

impl SignalSink {
    pub(crate) fn new(generation: u64, tx: Sender<(u64, ProcessSignal)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&self, signal: ProcessSignal) {
        let _ = self.tx.send((self.generation, signal));
    }
}

pub fn validate_binary(path: Option<&Path>) -> Result<PathBuf, PlayerError> {
    let Some(path) = path else {
        return Err(PlayerError::BinaryNotConfigured);
    };

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return Err(PlayerError::BinaryNotFound(path.to_path_buf())),
    };
    if !metadata.is_file() {
        return Err(PlayerError::BinaryNotExecutable(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(PlayerError::BinaryNotExecutable(path.to_path_buf()));
        }
    }

    Ok(path.to_path_buf())
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrashDecision {
    /// The exit belongs to a process that was already replaced or shut down.
    Ignore,
    Retry { attempt: u32, delay: Duration },
    Exhausted(u32),
}

struct ProcessHandle {
    generation: u64,
    process: Arc<dyn MediaProcess>,
    launched_at: Instant,
}

/// Owns the external process: spawning, shutdown, and the crash budget.
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    config: ExternalConfig,
    policy: RetryPolicy,
    signal_tx: Sender<(u64, ProcessSignal)>,
    handle: Mutex<Option<ProcessHandle>>,
    lifecycle: Mutex<Lifecycle>,
    generation: AtomicU64,
    retries: AtomicU32,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        config: ExternalConfig,
        policy: RetryPolicy,
        signal_tx: Sender<(u64, ProcessSignal)>,
    ) -> Self {
        Self {
            launcher,
            config,
            policy,
            signal_tx,
            handle: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            generation: AtomicU64::new(0),
            retries: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ExternalConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        *lock(&self.lifecycle) = next;
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Starts a fresh process, quitting the previous one first.
    pub async fn spawn(&self) -> Result<Arc<dyn MediaProcess>, PlayerError> {
        self.shutdown().await;

        let binary = validate_binary(self.config.binary_path.as_deref())?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_lifecycle(Lifecycle::Starting);

        let options = LaunchOptions {
            binary,
            extra_args: self.config.extra_args.clone(),
            ipc_timeout: self.config.ipc_timeout(),
        };
        let sink = SignalSink::new(generation, self.signal_tx.clone());

        let process = match self.launcher.launch(&options, sink).await {
            Ok(process) => process,
            Err(e) => {
                self.set_lifecycle(Lifecycle::Stopped);
                return Err(e);
            }
        };

        info!(generation, binary = %options.binary.display(), "external_process_spawned");
        *lock(&self.handle) = Some(ProcessHandle {
            generation,
            process: process.clone(),
            launched_at: Instant::now(),
        });
        Ok(process)
    }

    pub fn process(&self) -> Option<Arc<dyn MediaProcess>> {
        lock(&self.handle).as_ref().map(|h| h.process.clone())
    }

    pub fn mark_ready(&self) {
        self.set_lifecycle(Lifecycle::Ready);
    }

    pub async fn shutdown(&self) {
        let Some(handle) = lock(&self.handle).take() else {
            return;
        };
        self.set_lifecycle(Lifecycle::Quitting);
        debug!(generation = handle.generation, "external_process_shutdown");
        handle.process.terminate().await;
        self.set_lifecycle(Lifecycle::Stopped);
    }

    /// Whether a signal stamped with `generation` comes from the live process.
    pub fn is_current(&self, generation: u64) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|h| h.generation == generation)
    }

    /// Accounts for an unexpected exit and decides whether to restart.
    pub fn on_exit(&self, generation: u64) -> CrashDecision {
        let handle = {
            let mut slot = lock(&self.handle);
            match slot.as_ref() {
                Some(h) if h.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return CrashDecision::Ignore;
        };

        self.set_lifecycle(Lifecycle::Crashed);
        if handle.launched_at.elapsed() >= self.policy.stable_after() {
            self.retries.store(0, Ordering::SeqCst);
        }
        warn!(generation, "external_process_crashed");
        self.next_attempt()
    }

    /// Drops a process that exited before it was ready, without charging
    /// the crash budget.
    pub fn forget(&self, generation: u64) {
        let mut slot = lock(&self.handle);
        if slot.as_ref().is_some_and(|h| h.generation == generation) {
            slot.take();
            self.set_lifecycle(Lifecycle::Crashed);
        }
    }

    /// A restart attempt failed before the process came up.
    pub fn register_failed_restart(&self) -> CrashDecision {
        self.next_attempt()
    }

    fn next_attempt(&self) -> CrashDecision {
        let attempt = self.retries.load(Ordering::SeqCst) + 1;
        if attempt > self.policy.max_retries {
            return CrashDecision::Exhausted(self.policy.max_retries);
        }
        self.retries.store(attempt, Ordering::SeqCst);
        CrashDecision::Retry {
            attempt,
            delay: self.policy.backoff(attempt),
        }
    }

    pub fn reset_retries(&self) {
        self.retries.store(0, Ordering::SeqCst);
    }
}
