//! Subcommand implementations.

use anyhow::{Context, Result};
use microbatch::{AckTable, Microbatch, MicrobatchKind};
use pipeline_config_and_utils::{Config, Paths};
use pipeline_ipc::{purge_socket_dir, IpcConfig, IpcContext};
use serde::Serialize;
use stream_buffer::{shm_name_for_buffer, StreamBuffer, StreamBufferConfig};
use tracing::{info, warn};

/// Create the shared state for one pipeline and keep it alive.
///
/// Both regions are unlinked when this process exits.
pub async fn init_buffer(config: &Config, id: &str) -> Result<()> {
    let buffer = StreamBuffer::create(id, StreamBufferConfig::from(config))
        .with_context(|| format!("creating stream buffer {}", id))?;
    let table = AckTable::create(id, config.ack_table_capacity)
        .with_context(|| format!("creating acknowledgment table {}", id))?;

    info!(
        buffer = %id,
        shm = %shm_name_for_buffer(id),
        capacity = buffer.capacity(),
        ack_records = table.capacity(),
        "Pipeline state ready, press Ctrl-C to release"
    );
    tokio::signal::ctrl_c().await?;

    info!(buffer = %id, "Releasing pipeline state");
    buffer.shutdown();
    Ok(())
}

pub fn inspect_buffer(config: &Config, id: &str) -> Result<()> {
    let buffer = StreamBuffer::open(id, StreamBufferConfig::from(config))
        .with_context(|| format!("opening stream buffer {}", id))?;
    println!("{}", serde_json::to_string_pretty(&buffer.stats())?);
    Ok(())
}

pub fn purge_sockets(paths: &Paths) -> Result<()> {
    let removed = purge_socket_dir(&paths.ipc_dir())?;
    println!("Removed {} stale socket(s) from {}", removed, paths.ipc_dir().display());
    Ok(())
}

pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[derive(Serialize)]
struct ReceivedBatch {
    received_at: String,
    size: usize,
    kind: &'static str,
    ntups: usize,
    nbytes: usize,
    queries: Vec<usize>,
    acks: usize,
}

/// Act as a destination and describe each micro-batch as a JSON line.
pub async fn recv(config: &Config, paths: &Paths, id: u64, count: Option<usize>) -> Result<()> {
    let mut ctx = IpcContext::new(IpcConfig::from_config(config, paths));
    ctx.bind(id).await?;
    info!(id = id, socket = %ctx.config().socket_path(id).display(), "Listening");

    let mut seen = 0;
    while count.map_or(true, |count| seen < count) {
        let buf = tokio::select! {
            received = ctx.recv(None) => received?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(buf) = buf else {
            continue;
        };
        seen += 1;

        let batch = match Microbatch::unpack(&buf) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(size = buf.len(), error = %e, "Dropping malformed micro-batch");
                continue;
            }
        };
        let line = ReceivedBatch {
            received_at: chrono::Utc::now().to_rfc3339(),
            size: buf.len(),
            kind: match batch.kind() {
                MicrobatchKind::Tuples => "tuples",
                MicrobatchKind::Flush => "flush",
            },
            ntups: batch.ntups(),
            nbytes: batch.nbytes(),
            queries: batch.queries().iter().collect(),
            acks: batch.acks().len(),
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    ctx.shutdown();
    Ok(())
}
