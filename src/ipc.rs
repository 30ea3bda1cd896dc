//! Line-delimited JSON request/response channel between the controller and
//! the engine. Every request carries an `id` that the engine echoes back, so
//! a reply that arrives after its caller gave up is recognised and dropped.

use std::{
    collections::HashMap,
    io::{self, BufRead, BufReader, Read, Write},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::configuration::EngineConfig;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    SetConfig { config: EngineConfig },
    Start,
    Stop,
    HealthCheck,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetConfig { .. } => "set_config",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::HealthCheck => "health_check",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficStats {
    pub uplink: u64,
    pub downlink: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TrafficStats>,
}

impl Reply {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            stats: None,
        }
    }

    pub fn with_stats(stats: TrafficStats) -> Self {
        Self {
            ok: true,
            error: None,
            stats: Some(stats),
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "no error detail provided".into())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    #[serde(flatten)]
    pub reply: Reply,
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },
    #[error("engine channel closed")]
    Disconnected,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

type Pending = Arc<Mutex<HashMap<u64, mpsc::Sender<Reply>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client end of the channel. Reads and writes happen on dedicated threads so
/// a stalled engine can only ever cost a caller its own timeout.
pub struct IpcClient {
    outgoing: Option<mpsc::Sender<String>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl IpcClient {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let pending: Pending = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let (outgoing, queue) = mpsc::channel();

        thread::spawn(move || write_loop(writer, queue));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        thread::spawn(move || read_loop(reader, reader_pending, reader_closed));

        Self {
            outgoing: Some(outgoing),
            pending,
            closed,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn call(&self, command: Command, timeout: Duration) -> Result<Reply, IpcError> {
        let name = command.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request { id, command })?;

        let (sender, receiver) = mpsc::channel();
        lock(&self.pending).insert(id, sender);
        if self.closed.load(Ordering::SeqCst) {
            self.forget(id);
            return Err(IpcError::Disconnected);
        }

        let sent = self
            .outgoing
            .as_ref()
            .is_some_and(|outgoing| outgoing.send(line).is_ok());
        if !sent {
            self.forget(id);
            return Err(IpcError::Disconnected);
        }

        log::trace!("[ipc] -> {name} id={id}");
        match receiver.recv_timeout(timeout) {
            Ok(reply) => {
                log::trace!("[ipc] <- {name} id={id} ok={}", reply.ok);
                Ok(reply)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.forget(id);
                Err(IpcError::Timeout {
                    command: name,
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(IpcError::Disconnected),
        }
    }

    /// Stops accepting requests; the engine sees end-of-input once queued
    /// lines are written.
    pub fn close(&mut self) {
        self.outgoing.take();
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.outgoing.is_none() || self.closed.load(Ordering::SeqCst)
    }

    fn forget(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }
}

fn write_loop<W: Write>(mut writer: W, queue: mpsc::Receiver<String>) {
    for line in queue {
        if let Err(error) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            log::debug!("[ipc] write to engine failed: {error}");
            break;
        }
    }
}

fn read_loop<R: Read>(reader: R, pending: Pending, closed: Arc<AtomicBool>) {
    for line in BufReader::new(reader).lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                log::trace!("[ipc] reader ended: {error}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Response>(&line) {
            Ok(response) => match lock(&pending).remove(&response.id) {
                Some(waiter) => {
                    let _ = waiter.send(response.reply);
                }
                None => log::debug!("[ipc] discarding late response id={}", response.id),
            },
            Err(error) => log::debug!("[ipc] ignoring non-protocol line ({error}): {line}"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    lock(&pending).clear();
}

/// Engine side of the channel: answers each request with the handler's reply
/// until the controller closes its end.
pub fn serve<R, W, F>(reader: R, mut writer: W, mut handler: F) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    F: FnMut(Command) -> Reply,
{
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("[ipc] malformed request ({error}): {line}");
                continue;
            }
        };

        let reply = handler(request.command);
        serde_json::to_writer(&mut writer, &Response {
            id: request.id,
            reply,
        })?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    Ok(())
}
