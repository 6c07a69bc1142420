//! Per-process transport context.
//!
//! A context binds at most one destination id (a Unix socket listener feeding
//! one bounded inbound queue) and keeps a cache of outbound senders, one per
//! destination it has talked to.
//!
//! ## Outbound modes
//!
//! - **Immediate**: `connect` dials the destination right away. A missing
//!   listener makes a non-waiting send return `false`.
//! - **Enqueue**: messages queue in memory while the destination is absent and
//!   the writer task keeps redialing, so nothing is lost to a peer that starts
//!   late.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pipeline_config_and_utils::{Config, Paths};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{IpcError, IpcResult};
use crate::frame::{read_frame, write_frame};

/// Delay between dial attempts to an absent destination.
const RECONNECT_DELAY: Duration = Duration::from_millis(10);

/// Read chunk size for inbound connections.
const READ_CHUNK: usize = 64 * 1024;

/// Transport settings for one context.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Directory holding `<id>.sock` files.
    pub socket_dir: PathBuf,
    /// Capacity of the inbound queue and of each outbound queue.
    pub hwm: usize,
    pub max_message_size: usize,
    /// Queue outbound messages while the destination is absent.
    pub enqueue: bool,
}

impl IpcConfig {
    pub fn from_config(config: &Config, paths: &Paths) -> Self {
        Self {
            socket_dir: paths.ipc_dir(),
            hwm: config.ipc_hwm,
            max_message_size: config.max_message_size,
            enqueue: config.enqueue_sends,
        }
    }

    pub fn socket_path(&self, id: u64) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", id))
    }
}

/// Remove stale `*.sock` files left by earlier runs. Creates the directory if
/// missing. Returns the number of files removed.
pub fn purge_socket_dir(dir: &Path) -> IpcResult<usize> {
    std::fs::create_dir_all(dir)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "sock") {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!(dir = %dir.display(), removed = removed, "Purged stale sockets");
    }
    Ok(removed)
}

struct Inbound {
    id: u64,
    path: PathBuf,
    rx: mpsc::Receiver<Vec<u8>>,
    /// Message taken off the queue by `poll` and not yet returned by `recv`.
    peeked: Option<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

struct Outbound {
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Explicit transport state for one process.
pub struct IpcContext {
    config: IpcConfig,
    inbound: Option<Inbound>,
    outbound: HashMap<u64, Outbound>,
    shut_down: bool,
}

impl IpcContext {
    pub fn new(config: IpcConfig) -> Self {
        Self {
            config,
            inbound: None,
            outbound: HashMap::new(),
            shut_down: false,
        }
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Destination id this context is bound to.
    pub fn bound_id(&self) -> Option<u64> {
        self.inbound.as_ref().map(|inbound| inbound.id)
    }

    fn check_open(&self) -> IpcResult<()> {
        if self.shut_down {
            return Err(IpcError::Shutdown);
        }
        Ok(())
    }

    /// Listen on `<socket_dir>/<id>.sock`. A context binds once.
    pub async fn bind(&mut self, id: u64) -> IpcResult<()> {
        self.check_open()?;
        if let Some(inbound) = &self.inbound {
            error!(bound = inbound.id, requested = id, "IPC context bound twice");
            return Err(IpcError::AlreadyBound(inbound.id));
        }

        let path = self.config.socket_path(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| IpcError::Socket(format!("bind {} failed: {}", path.display(), e)))?;
        info!(id = id, path = %path.display(), "IPC endpoint bound");

        let (tx, rx) = mpsc::channel(self.config.hwm);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            tx,
            self.config.max_message_size,
            shutdown_rx,
        ));

        self.inbound = Some(Inbound {
            id,
            path,
            rx,
            peeked: None,
            shutdown_tx,
            accept_task,
        });
        Ok(())
    }

    /// Create the cached sender for `id` if there is none yet.
    pub async fn connect(&mut self, id: u64) -> IpcResult<()> {
        self.check_open()?;
        if let Some(outbound) = self.outbound.get(&id) {
            if !outbound.tx.is_closed() {
                return Ok(());
            }
            self.outbound.remove(&id);
        }

        let path = self.config.socket_path(id);
        let stream = if self.config.enqueue {
            None
        } else {
            match UnixStream::connect(&path).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!(id = id, error = %e, "Destination not listening");
                    return Err(IpcError::PeerUnavailable(id));
                }
            }
        };

        let (tx, rx) = mpsc::channel(self.config.hwm);
        let task = tokio::spawn(write_loop(id, path, rx, stream, self.config.enqueue));
        self.outbound.insert(id, Outbound { tx, task });

        debug!(id = id, enqueue = self.config.enqueue, "Connected to destination");
        Ok(())
    }

    /// Send one message to `id`, connecting on first use.
    ///
    /// Returns `Ok(false)` when the message cannot be accepted right away and
    /// `wait` is false. With `wait` the call blocks until it is accepted.
    pub async fn send(&mut self, id: u64, buf: Vec<u8>, wait: bool) -> IpcResult<bool> {
        self.check_open()?;
        if buf.len() > self.config.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size: buf.len(),
                max: self.config.max_message_size,
            });
        }

        let mut buf = buf;
        loop {
            match self.connect(id).await {
                Ok(()) => {}
                Err(IpcError::PeerUnavailable(_)) if !wait => return Ok(false),
                Err(IpcError::PeerUnavailable(_)) => {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let Some(outbound) = self.outbound.get(&id) else {
                continue;
            };

            if wait {
                match outbound.tx.send(buf).await {
                    Ok(()) => return Ok(true),
                    Err(mpsc::error::SendError(returned)) => buf = returned,
                }
            } else {
                match outbound.tx.try_send(buf) {
                    Ok(()) => return Ok(true),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(id = id, "Outbound queue full");
                        return Ok(false);
                    }
                    Err(mpsc::error::TrySendError::Closed(returned)) => buf = returned,
                }
            }

            // The writer task gave up on a lost connection; dial again.
            self.outbound.remove(&id);
        }
    }

    /// Whether a message is ready. `Some(Duration::ZERO)` never blocks,
    /// `None` blocks until one arrives.
    pub async fn poll(&mut self, timeout: Option<Duration>) -> IpcResult<bool> {
        self.check_open()?;
        let inbound = self.inbound.as_mut().ok_or(IpcError::NotBound)?;
        if inbound.peeked.is_some() {
            return Ok(true);
        }

        inbound.peeked = next_message(&mut inbound.rx, timeout).await?;
        Ok(inbound.peeked.is_some())
    }

    /// Receive one message. `Ok(None)` means the timeout elapsed.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> IpcResult<Option<Vec<u8>>> {
        self.check_open()?;
        let inbound = self.inbound.as_mut().ok_or(IpcError::NotBound)?;
        if let Some(message) = inbound.peeked.take() {
            return Ok(Some(message));
        }
        next_message(&mut inbound.rx, timeout).await
    }

    /// Tear down the listener and every cached sender. Queued outbound
    /// messages are dropped.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(inbound) = self.inbound.take() {
            let _ = inbound.shutdown_tx.send(true);
            inbound.accept_task.abort();
            if let Err(e) = std::fs::remove_file(&inbound.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %inbound.path.display(), error = %e, "Failed to remove socket");
                }
            }
            info!(id = inbound.id, "IPC endpoint closed");
        }

        let mut dropped = 0;
        for (_, outbound) in self.outbound.drain() {
            dropped += outbound.tx.max_capacity() - outbound.tx.capacity();
            outbound.task.abort();
        }
        if dropped > 0 {
            warn!(dropped = dropped, "Dropped undelivered messages on shutdown");
        }
    }
}

impl Drop for IpcContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn next_message(
    rx: &mut mpsc::Receiver<Vec<u8>>,
    timeout: Option<Duration>,
) -> IpcResult<Option<Vec<u8>>> {
    let message = match timeout {
        Some(timeout) if timeout.is_zero() => match rx.try_recv() {
            Ok(message) => Some(message),
            Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => None,
        },
        Some(timeout) => match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(message) => message,
            Err(_) => return Ok(None),
        },
        None => rx.recv().await,
    };

    // The accept loop holds a sender for as long as the endpoint is bound.
    message.map(Some).ok_or(IpcError::Shutdown)
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<Vec<u8>>,
    max_message_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _)) => {
                        let tx = tx.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = read_connection(stream, tx, max_message_size, shutdown_rx).await {
                                warn!(error = %e, "Inbound connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Accept loop stopping");
                break;
            }
        }
    }
}

/// Forward every frame of one connection to the inbound queue.
async fn read_connection(
    mut stream: UnixStream,
    tx: mpsc::Sender<Vec<u8>>,
    max_message_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) -> IpcResult<()> {
    let mut read_buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    debug!("Sender connected");

    loop {
        while let Some((frame, consumed)) = read_frame(&read_buf, max_message_size)? {
            let message = frame.to_vec();
            read_buf.drain(..consumed);
            if tx.send(message).await.is_err() {
                return Ok(());
            }
        }

        tokio::select! {
            read = stream.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    if !read_buf.is_empty() {
                        return Err(IpcError::Protocol(format!(
                            "connection closed inside a frame ({} bytes pending)",
                            read_buf.len()
                        )));
                    }
                    debug!("Sender disconnected");
                    return Ok(());
                }
                read_buf.extend_from_slice(&chunk[..n]);
            }
            _ = shutdown_rx.changed() => return Ok(()),
        }
    }
}

/// Deliver queued messages to one destination.
async fn write_loop(
    id: u64,
    path: PathBuf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut stream: Option<UnixStream>,
    enqueue: bool,
) {
    while let Some(message) = rx.recv().await {
        loop {
            if stream.is_none() {
                match UnixStream::connect(&path).await {
                    Ok(connected) => {
                        debug!(id = id, "Dialed destination");
                        stream = Some(connected);
                    }
                    Err(_) if enqueue => {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                    Err(e) => {
                        warn!(id = id, error = %e, "Destination gone, closing sender");
                        return;
                    }
                }
            }
            let Some(connected) = stream.as_mut() else {
                continue;
            };

            match write_frame(connected, &message).await {
                Ok(()) => break,
                Err(e) => {
                    stream = None;
                    if !enqueue {
                        warn!(id = id, error = %e, "Send failed, closing sender");
                        return;
                    }
                    debug!(id = id, error = %e, "Send failed, redialing");
                }
            }
        }
    }
}
