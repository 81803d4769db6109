//! Launches mpv in idle mode and drives it over its JSON IPC socket.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    process::{Child, Command},
    sync::oneshot,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    audio::error::PlayerError,
    util::{sync::lock, task::TaskManager},
};

use super::{
    ipc::IpcClient,
    protocol::{ProcessSignal, Request},
    supervisor::{LaunchOptions, MediaProcess, ProcessLauncher, SignalSink},
};

const CONNECT_POLL: Duration = Duration::from_millis(50);
const QUIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone, Copy)]
pub struct MpvLauncher;

fn socket_path() -> PathBuf {
    let name = format!("trackplayer-{}", Uuid::new_v4().simple());
    if cfg!(windows) {
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    } else {
        std::env::temp_dir().join(format!("{name}.sock"))
    }
}

fn launch_args(socket: &Path, extra_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "--idle=yes".to_string(),
        "--no-video".to_string(),
        "--no-terminal".to_string(),
        format!("--input-ipc-server={}", socket.display()),
    ];
    args.extend(extra_args.iter().cloned());
    args
}

#[cfg(unix)]
async fn open_socket(path: &Path) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn open_socket(
    path: &Path,
) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

#[async_trait]
impl ProcessLauncher for MpvLauncher {
    async fn launch(
        &self,
        options: &LaunchOptions,
        signals: SignalSink,
    ) -> Result<Arc<dyn MediaProcess>, PlayerError> {
        let socket = socket_path();
        let mut child = Command::new(&options.binary)
            .args(launch_args(&socket, &options.extra_args))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlayerError::InitFailed(format!("spawn failed: {e}")))?;

        // The socket only appears once mpv has parsed its options.
        let deadline = Instant::now() + options.ipc_timeout;
        let stream = loop {
            match open_socket(&socket).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(PlayerError::InitFailed(format!(
                            "mpv exited during startup: {status}"
                        )));
                    }
                    if Instant::now() >= deadline {
                        return Err(PlayerError::InitFailed(format!(
                            "ipc socket never became available: {e}"
                        )));
                    }
                    tokio::time::sleep(CONNECT_POLL).await;
                }
            }
        };
        info!(
            generation = signals.generation(),
            socket = %socket.display(),
            "mpv_connected"
        );

        let (signal_tx, signal_rx) = flume::unbounded();
        let client = IpcClient::spawn(stream, signal_tx, options.ipc_timeout);
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut tasks = TaskManager::new();
        let sink = signals.clone();
        tasks.spawn(
            "forward",
            tokio::spawn(async move {
                while let Ok(signal) = signal_rx.recv_async().await {
                    sink.send(signal);
                }
            }),
        );
        tasks.spawn("watch", tokio::spawn(watch_child(child, kill_rx, signals)));

        Ok(Arc::new(MpvProcess {
            client,
            socket,
            kill: Mutex::new(Some(kill_tx)),
            _tasks: tasks,
        }))
    }
}

async fn watch_child(mut child: Child, kill_rx: oneshot::Receiver<()>, signals: SignalSink) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    match exited {
        Some(status) => {
            let code = status.ok().and_then(|s| s.code());
            debug!(generation = signals.generation(), ?code, "mpv_exited");
            signals.send(ProcessSignal::Exited { code });
        }
        None => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "mpv_kill_failed");
            }
        }
    }
}

struct MpvProcess {
    client: IpcClient,
    socket: PathBuf,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    _tasks: TaskManager,
}

#[async_trait]
impl MediaProcess for MpvProcess {
    async fn request(&self, request: Request) -> Result<Value, PlayerError> {
        self.client.request(&request).await
    }

    async fn terminate(&self) {
        if !self.client.is_closed() {
            let _ = tokio::time::timeout(QUIT_GRACE, self.client.request(&Request::Quit)).await;
        }
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_args_enable_ipc() {
        let socket = PathBuf::from("/tmp/trackplayer-test.sock");
        let args = launch_args(&socket, &["--ao=null".to_string()]);
        assert_eq!(
            args,
            vec![
                "--idle=yes",
                "--no-video",
                "--no-terminal",
                "--input-ipc-server=/tmp/trackplayer-test.sock",
                "--ao=null",
            ]
        );
    }

    #[test]
    fn socket_paths_are_unique() {
        assert_ne!(socket_path(), socket_path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_fails_to_launch() {
        let (tx, _rx) = flume::unbounded();
        let options = LaunchOptions {
            binary: PathBuf::from("/definitely/not/here/mpv"),
            extra_args: Vec::new(),
            ipc_timeout: Duration::from_millis(100),
        };
        let result = MpvLauncher.launch(&options, SignalSink::new(1, tx)).await;
        assert!(matches!(result, Err(PlayerError::InitFailed(_))));
    }
}
