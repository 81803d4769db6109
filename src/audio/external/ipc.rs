use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use flume::Sender;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{trace, warn};

use crate::{audio::error::PlayerError, util::sync::lock};

use super::protocol::{Message, ProcessSignal, Request, decode};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Request/response client over a line-oriented JSON connection.
/// Unsolicited events are decoded and forwarded to `signals`.
pub struct IpcClient {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl IpcClient {
    pub fn spawn<S>(stream: S, signals: Sender<ProcessSignal>, timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Pending = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(Self::read_loop(
            BufReader::new(read_half),
            pending.clone(),
            closed.clone(),
            signals,
        ));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            timeout,
            reader,
        }
    }

    async fn read_loop<R>(
        reader: BufReader<R>,
        pending: Pending,
        closed: Arc<AtomicBool>,
        signals: Sender<ProcessSignal>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "ipc_read_failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match decode(&line) {
                Ok(Message::Response { request_id, result }) => {
                    if let Some(reply) = lock(&pending).remove(&request_id) {
                        let _ = reply.send(result);
                    }
                }
                Ok(Message::Signal(signal)) => {
                    let _ = signals.send(signal);
                }
                Ok(Message::Ignored) => {}
                Err(e) => trace!(error = %e, line = line.as_str(), "ipc_undecodable_line"),
            }
        }

        closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every waiting request.
        lock(&pending).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn request(&self, request: &Request) -> Result<Value, PlayerError> {
        if self.is_closed() {
            return Err(PlayerError::Ipc("connection closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let line = request.encode(id);
        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(PlayerError::Ipc(message)),
            Ok(Err(_)) => Err(PlayerError::Ipc("connection closed".to_string())),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(PlayerError::Ipc(format!(
                    "no reply within {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
