use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};
use tracing::{info, warn};

use crate::audio::error::PlayerError;
use crate::util::{log::PROJECT_DIRS, sync::lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    InProcess,
    ExternalProcess,
}

impl std::str::FromStr for BackendKind {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-process" => Ok(BackendKind::InProcess),
            "external-process" | "mpv" => Ok(BackendKind::ExternalProcess),
            other => Err(PlayerError::InvalidArgument(format!(
                "unknown backend `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub binary_path: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub init_timeout_ms: u64,
    pub ipc_timeout_ms: u64,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            extra_args: Vec::new(),
            init_timeout_ms: 15_000,
            ipc_timeout_ms: 5_000,
        }
    }
}

impl ExternalConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// A process that stayed up this long no longer counts as a quick crash.
    pub stable_after_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            stable_after_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before restart number `attempt` (1-based): `base * attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms.saturating_mul(attempt.max(1) as u64);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub backend: BackendKind,
    pub external: ExternalConfig,
    pub retry: RetryPolicy,
    pub volume: f32,
    pub speed: f32,
    pub progress_interval_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            external: ExternalConfig::default(),
            retry: RetryPolicy::default(),
            volume: 1.0,
            speed: 1.0,
            progress_interval_ms: 250,
        }
    }
}

impl PlayerConfig {
    pub fn from_toml(raw: &str) -> Result<Self, PlayerError> {
        toml::from_str(raw).map_err(|e| PlayerError::InvalidArgument(e.to_string()))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(10))
    }
}

/// App settings the player reads on startup and writes back on change.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> PlayerConfig;
    fn persist_volume(&self, volume: f32) -> Result<(), PlayerError>;
    fn persist_speed(&self, speed: f32) -> Result<(), PlayerError>;
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    config: Mutex<PlayerConfig>,
}

impl MemorySettings {
    pub fn new(config: PlayerConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self) -> PlayerConfig {
        lock(&self.config).clone()
    }

    fn persist_volume(&self, volume: f32) -> Result<(), PlayerError> {
        lock(&self.config).volume = volume;
        Ok(())
    }

    fn persist_speed(&self, speed: f32) -> Result<(), PlayerError> {
        lock(&self.config).speed = speed;
        Ok(())
    }
}

/// TOML-file backed settings.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    cached: Mutex<PlayerConfig>,
}

impl FileSettings {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = match std::fs::read_to_string(&path) {
            Ok(raw) => PlayerConfig::from_toml(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "settings_parse_failed");
                PlayerConfig::default()
            }),
            Err(_) => {
                info!(path = %path.display(), "settings_missing_using_defaults");
                PlayerConfig::default()
            }
        };

        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        PROJECT_DIRS
            .as_ref()
            .map(|dirs| dirs.config_local_dir().join("config.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut PlayerConfig)) -> Result<(), PlayerError> {
        let mut cached = lock(&self.cached);
        apply(&mut cached);
        let raw = toml::to_string_pretty(&*cached)
            .map_err(|e| PlayerError::InvalidArgument(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn load(&self) -> PlayerConfig {
        lock(&self.cached).clone()
    }

    fn persist_volume(&self, volume: f32) -> Result<(), PlayerError> {
        self.update(|c| c.volume = volume)
    }

    fn persist_speed(&self, speed: f32) -> Result<(), PlayerError> {
        self.update(|c| c.speed = speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml() {
        let config = PlayerConfig::from_toml(
            r#"
            backend = "external-process"
            volume = 0.4

            [external]
            binary_path = "/usr/bin/mpv"
            extra_args = ["--audio-display=no"]

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::ExternalProcess);
        assert_eq!(config.volume, 0.4);
        assert_eq!(config.speed, 1.0);
        assert_eq!(
            config.external.binary_path.as_deref(),
            Some(Path::new("/usr/bin/mpv"))
        );
        assert_eq!(config.external.init_timeout_ms, 15_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 2_500,
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_500));
        assert_eq!(policy.backoff(9), Duration::from_millis(2_500));
    }

    #[test]
    fn file_settings_round_trip_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let settings = FileSettings::open(&path);
        assert_eq!(settings.load().volume, 1.0);
        settings.persist_volume(0.25).unwrap();
        settings.persist_speed(1.5).unwrap();

        let reopened = FileSettings::open(&path);
        assert_eq!(reopened.load().volume, 0.25);
        assert_eq!(reopened.load().speed, 1.5);
    }

    #[test]
    fn backend_names() {
        assert_eq!(
            "external-process".parse::<BackendKind>().unwrap(),
            BackendKind::ExternalProcess
        );
        assert_eq!("in-process".parse::<BackendKind>().unwrap(), BackendKind::InProcess);
        assert!("vlc".parse::<BackendKind>().is_err());
    }
}
