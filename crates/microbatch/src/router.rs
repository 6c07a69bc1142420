//! Push side of the micro-batch transport.
//!
//! Destination ids follow the process layout: workers come first, then
//! combiners.
//!
//! ```text
//! id:   0 .. num_workers-1 | num_workers .. num_workers+num_combiners-1
//!       workers            | combiners
//! ```
//!
//! Writers may block on a worker because nothing ever writes back to them.
//! Workers and combiners send without blocking first, so two processes
//! writing to each other cannot wait on one another forever; a refused send
//! is retried with a bounded wait.

use std::time::Duration;

use async_trait::async_trait;
use pipeline_config_and_utils::Config;
use pipeline_ipc::IpcContext;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::codec::MicrobatchBuilder;
use crate::error::{MicrobatchError, MicrobatchResult};

/// Where packed micro-batches go.
#[async_trait]
pub trait MessageSink: Send {
    /// Hand `buf` to destination `id`. Without `wait`, `Ok(false)` means the
    /// destination cannot take it right now.
    async fn send(&mut self, id: u64, buf: Vec<u8>, wait: bool) -> MicrobatchResult<bool>;
}

#[async_trait]
impl MessageSink for IpcContext {
    async fn send(&mut self, id: u64, buf: Vec<u8>, wait: bool) -> MicrobatchResult<bool> {
        Ok(IpcContext::send(self, id, buf, wait).await?)
    }
}

/// The sending process, as far as routing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderRole {
    /// A client inserting into a stream.
    Writer,
    Worker,
    /// Combiners shard their output over workers by group.
    Combiner { group_id: u64 },
}

/// Number of workers and combiners behind the destination ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub num_workers: usize,
    pub num_combiners: usize,
}

impl Topology {
    pub fn from_config(config: &Config) -> Self {
        Self {
            num_workers: config.num_workers,
            num_combiners: config.num_combiners,
        }
    }

    pub fn worker_id(&self, worker: usize) -> MicrobatchResult<u64> {
        if worker >= self.num_workers {
            return Err(MicrobatchError::Routing(format!(
                "worker {} out of range, {} workers",
                worker, self.num_workers
            )));
        }
        Ok(worker as u64)
    }

    pub fn combiner_id(&self, combiner: usize) -> MicrobatchResult<u64> {
        if combiner >= self.num_combiners {
            return Err(MicrobatchError::Routing(format!(
                "combiner {} out of range, {} combiners",
                combiner, self.num_combiners
            )));
        }
        Ok((self.num_workers + combiner) as u64)
    }
}

/// A chosen destination and how to send to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub id: u64,
    pub blocking: bool,
}

/// Routes and sends micro-batches for one process.
#[derive(Debug, Clone)]
pub struct MicrobatchSender {
    topology: Topology,
    role: SenderRole,
    fallback_wait: Duration,
}

impl MicrobatchSender {
    pub fn new(topology: Topology, role: SenderRole, fallback_wait: Duration) -> Self {
        Self {
            topology,
            role,
            fallback_wait,
        }
    }

    pub fn from_config(config: &Config, role: SenderRole) -> Self {
        Self::new(
            Topology::from_config(config),
            role,
            config.send_fallback_wait(),
        )
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn role(&self) -> SenderRole {
        self.role
    }

    /// Pick the worker for the next batch.
    ///
    /// An explicit worker is sent to blocking. Otherwise a combiner uses
    /// `group_id % num_workers` so one group's updates stay in order, a
    /// worker picks at random without blocking, and a writer picks at random
    /// and blocks.
    pub fn route_to_worker(&self, worker: Option<usize>) -> MicrobatchResult<Route> {
        if let Some(worker) = worker {
            return Ok(Route {
                id: self.topology.worker_id(worker)?,
                blocking: true,
            });
        }
        if self.topology.num_workers == 0 {
            return Err(MicrobatchError::Routing("no workers".to_string()));
        }

        let n = self.topology.num_workers;
        let (worker, blocking) = match self.role {
            SenderRole::Combiner { group_id } => ((group_id % n as u64) as usize, false),
            SenderRole::Worker => (rand::thread_rng().gen_range(0..n), false),
            SenderRole::Writer => (rand::thread_rng().gen_range(0..n), true),
        };
        Ok(Route {
            id: self.topology.worker_id(worker)?,
            blocking,
        })
    }

    /// Combiners are always sent to without blocking first.
    pub fn route_to_combiner(&self, combiner: usize) -> MicrobatchResult<Route> {
        Ok(Route {
            id: self.topology.combiner_id(combiner)?,
            blocking: false,
        })
    }

    /// Send the builder's batch to a worker and clear the builder once it
    /// went out. Returns whether it was sent.
    pub async fn send_to_worker<S>(
        &self,
        sink: &mut S,
        builder: &mut MicrobatchBuilder,
        worker: Option<usize>,
    ) -> MicrobatchResult<bool>
    where
        S: MessageSink + ?Sized,
    {
        let route = self.route_to_worker(worker)?;
        self.send_and_clear(sink, builder, route).await
    }

    pub async fn send_to_combiner<S>(
        &self,
        sink: &mut S,
        builder: &mut MicrobatchBuilder,
        combiner: usize,
    ) -> MicrobatchResult<bool>
    where
        S: MessageSink + ?Sized,
    {
        let route = self.route_to_combiner(combiner)?;
        self.send_and_clear(sink, builder, route).await
    }

    async fn send_and_clear<S>(
        &self,
        sink: &mut S,
        builder: &mut MicrobatchBuilder,
        route: Route,
    ) -> MicrobatchResult<bool>
    where
        S: MessageSink + ?Sized,
    {
        let sent = self.send(sink, builder, route).await?;
        if sent {
            builder.clear();
        }
        Ok(sent)
    }

    /// Send one batch along `route`. The builder is left untouched.
    ///
    /// A blocking route waits until the destination accepts. A non-blocking
    /// route tries once, then waits at most the fallback wait; `Ok(false)`
    /// means the batch was not sent.
    pub async fn send<S>(
        &self,
        sink: &mut S,
        builder: &MicrobatchBuilder,
        route: Route,
    ) -> MicrobatchResult<bool>
    where
        S: MessageSink + ?Sized,
    {
        trace!(
            id = route.id,
            blocking = route.blocking,
            ntups = builder.ntups(),
            "Sending micro-batch"
        );
        if route.blocking {
            return sink.send(route.id, builder.pack(), true).await;
        }
        if sink.send(route.id, builder.pack(), false).await? {
            return Ok(true);
        }

        debug!(
            id = route.id,
            wait_ms = self.fallback_wait.as_millis() as u64,
            "Destination busy, retrying with a bounded wait"
        );
        let retry = sink.send(route.id, builder.pack(), true);
        match tokio::time::timeout(self.fallback_wait, retry).await {
            Ok(sent) => sent,
            Err(_) => {
                warn!(
                    id = route.id,
                    ntups = builder.ntups(),
                    "Micro-batch not accepted within the fallback wait"
                );
                Ok(false)
            }
        }
    }
}
