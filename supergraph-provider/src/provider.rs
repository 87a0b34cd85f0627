//! Fallback-aware supergraph provider.
//!
//! At startup the primary source (uplink) and the fallback resolver run
//! concurrently. The uplink document wins when uplink answers; otherwise the
//! stand-by document from the fallback is served. A failing fallback is fatal
//! even when uplink answered.
//!
//! After startup a single worker task polls uplink and hands every new
//! supergraph to the host. Polls never overlap, and shutdown is delivered to
//! the worker between polls, so no update reaches the host after
//! [`CleanupHandle::cleanup`] returns.

use crate::fallback::{FallbackError, FallbackResolver};
use crate::metrics_defs::{FALLBACK_USED, POLL_FAILURE, SUPERGRAPH_UPDATED};
use crate::types::SchemaDocument;
use crate::uplink::{FetchError, FetchOutcome, SupergraphSource};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderPhase {
    Uninitialized,
    Initializing,
    Polling,
    Stopped,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("supergraph health check failed: {0}")]
pub struct HealthCheckError(pub String);

/// Consumer of the supergraph, typically the gateway.
#[async_trait]
pub trait SupergraphHost: Send + Sync {
    /// Called once with the initial supergraph, before polling starts.
    async fn initial(&self, _document: &SchemaDocument) {}

    /// Called for every new supergraph after the initial one.
    async fn update(&self, document: SchemaDocument);

    /// Consulted before `update` when subgraph health checks are enabled.
    async fn health_check(&self, _document: &SchemaDocument) -> Result<(), HealthCheckError> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderOptions {
    pub poll_interval: Duration,
    pub subgraph_health_check: bool,
}

impl ProviderOptions {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
}

impl Default for ProviderOptions {
    fn default() -> Self {
        ProviderOptions {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            subgraph_health_check: false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("fallback supergraph unavailable: {0}")]
    FatalStartup(#[source] FallbackError),

    #[error("provider was already initialized")]
    AlreadyInitialized,
}

#[derive(thiserror::Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    HealthCheck(#[from] HealthCheckError),

    #[error("provider is stopped")]
    Stopped,
}

impl PollError {
    fn reason(&self) -> &'static str {
        match self {
            PollError::Fetch(_) => "fetch",
            PollError::HealthCheck(_) => "health_check",
            PollError::Stopped => "stopped",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    /// The host received a new supergraph with this id.
    Updated(String),
    Unchanged,
}

#[derive(Debug)]
pub enum Command {
    // Poll now instead of waiting for the next tick. The worker replies once
    // the poll settled.
    Refresh(oneshot::Sender<Result<PollOutcome, PollError>>),
    // Exit the poll loop.
    Shutdown,
}

/// Polling keeps running when `cleanup` is dropped; only
/// [`CleanupHandle::cleanup`] stops it.
#[must_use]
pub struct Initialized {
    pub document: SchemaDocument,
    pub cleanup: CleanupHandle,
}

pub struct SupergraphProvider {
    source: Arc<dyn SupergraphSource>,
    fallback: Arc<dyn FallbackResolver>,
    options: ProviderOptions,
    phase: Arc<RwLock<ProviderPhase>>,
}

impl SupergraphProvider {
    pub fn new(
        source: Arc<dyn SupergraphSource>,
        fallback: Arc<dyn FallbackResolver>,
        options: ProviderOptions,
    ) -> Self {
        SupergraphProvider {
            source,
            fallback,
            options,
            phase: Arc::new(RwLock::new(ProviderPhase::Uninitialized)),
        }
    }

    pub fn phase(&self) -> ProviderPhase {
        *self.phase.read()
    }

    /// Obtains the initial supergraph and starts polling.
    pub async fn initialize(
        &self,
        host: Arc<dyn SupergraphHost>,
    ) -> Result<Initialized, ProviderError> {
        {
            let mut phase = self.phase.write();
            if *phase != ProviderPhase::Uninitialized {
                return Err(ProviderError::AlreadyInitialized);
            }
            *phase = ProviderPhase::Initializing;
        }

        let (standby, primary) = tokio::join!(self.fallback.resolve(), self.source.fetch(None));

        let standby = match standby {
            Ok(document) => document,
            Err(err) => {
                tracing::error!(error = %err, "fallback supergraph unavailable, refusing to start");
                *self.phase.write() = ProviderPhase::Stopped;
                return Err(ProviderError::FatalStartup(err));
            }
        };

        let mut last_uplink_id = None;
        let mut earliest_fetch = None;
        let document = match primary {
            Ok(outcome) => {
                earliest_fetch = outcome.min_delay().map(|delay| Instant::now() + delay);
                match outcome {
                    FetchOutcome::Updated { document, .. } => {
                        tracing::info!(id = %document.id, "loaded supergraph from uplink");
                        last_uplink_id = Some(document.id.clone());
                        document
                    }
                    FetchOutcome::Unchanged { id, .. } => {
                        tracing::warn!(%id, "uplink reported no supergraph, serving fallback");
                        counter!(FALLBACK_USED).increment(1);
                        standby
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, id = %standby.id, "uplink unavailable, serving fallback supergraph");
                counter!(FALLBACK_USED).increment(1);
                standby
            }
        };

        host.initial(&document).await;

        let (tx, rx) = mpsc::channel::<Command>(16);
        let worker = PollWorker {
            source: self.source.clone(),
            host,
            options: self.options.clone(),
            phase: self.phase.clone(),
            last_served: document.clone(),
            last_uplink_id,
            earliest_fetch,
        };

        *self.phase.write() = ProviderPhase::Polling;
        let handle = tokio::spawn(worker.run(rx));

        Ok(Initialized {
            document,
            cleanup: CleanupHandle {
                inner: Arc::new(CleanupInner {
                    tx,
                    worker: Mutex::new(Some(handle)),
                    phase: self.phase.clone(),
                }),
            },
        })
    }
}

struct CleanupInner {
    tx: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    phase: Arc<RwLock<ProviderPhase>>,
}

/// Controls the background poll loop.
#[derive(Clone)]
pub struct CleanupHandle {
    inner: Arc<CleanupInner>,
}

impl CleanupHandle {
    /// Stops polling. Waits for an in-flight poll to settle first. Calling it
    /// again, or concurrently, returns once the first call completed.
    pub async fn cleanup(&self) {
        let mut worker = self.inner.worker.lock().await;
        let Some(handle) = worker.take() else {
            return;
        };

        let _ = self.inner.tx.send(Command::Shutdown).await;
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "supergraph poll worker failed");
        }

        *self.inner.phase.write() = ProviderPhase::Stopped;
        tracing::info!("supergraph polling stopped");
    }

    /// Polls immediately. Serialized with scheduled polls.
    pub async fn refresh(&self) -> Result<PollOutcome, PollError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Refresh(tx))
            .await
            .map_err(|_| PollError::Stopped)?;
        rx.await.map_err(|_| PollError::Stopped)?
    }

    pub fn phase(&self) -> ProviderPhase {
        *self.inner.phase.read()
    }
}

struct PollWorker {
    source: Arc<dyn SupergraphSource>,
    host: Arc<dyn SupergraphHost>,
    options: ProviderOptions,
    phase: Arc<RwLock<ProviderPhase>>,
    last_served: SchemaDocument,
    // Only ids handed out by uplink; fallback ids mean nothing to it.
    last_uplink_id: Option<String>,
    earliest_fetch: Option<Instant>,
}

impl PollWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut next_poll = self.next_poll();
        // Dropping every handle closes the channel but does not stop polling.
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;

                command = rx.recv(), if commands_open => match command {
                    Some(Command::Refresh(reply)) => {
                        let result = self.poll().await;
                        next_poll = self.next_poll();
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) => break,
                    None => {
                        tracing::debug!("all cleanup handles dropped, polling continues");
                        commands_open = false;
                    }
                },
                _ = tokio::time::sleep_until(next_poll) => {
                    let _ = self.poll().await;
                    next_poll = self.next_poll();
                }
            }
        }

        *self.phase.write() = ProviderPhase::Stopped;
    }

    fn next_poll(&self) -> Instant {
        let next = Instant::now() + self.options.poll_interval;
        match self.earliest_fetch {
            Some(earliest) => next.max(earliest),
            None => next,
        }
    }

    async fn poll(&mut self) -> Result<PollOutcome, PollError> {
        let result = self.try_poll().await;
        match &result {
            Ok(PollOutcome::Updated(id)) => {
                counter!(SUPERGRAPH_UPDATED).increment(1);
                tracing::info!(%id, "supergraph updated");
            }
            Ok(PollOutcome::Unchanged) => tracing::debug!("supergraph unchanged"),
            Err(err) => {
                counter!(POLL_FAILURE, "reason" => err.reason()).increment(1);
                tracing::warn!(error = %err, "supergraph poll failed");
            }
        }
        result
    }

    async fn try_poll(&mut self) -> Result<PollOutcome, PollError> {
        let outcome = self.source.fetch(self.last_uplink_id.as_deref()).await?;
        self.earliest_fetch = outcome.min_delay().map(|delay| Instant::now() + delay);

        let document = match outcome {
            FetchOutcome::Unchanged { id, .. } => {
                self.last_uplink_id = Some(id);
                return Ok(PollOutcome::Unchanged);
            }
            FetchOutcome::Updated { document, .. } => document,
        };

        if document.same_sdl(&self.last_served) {
            self.last_uplink_id = Some(document.id);
            return Ok(PollOutcome::Unchanged);
        }

        // A rejected document is not remembered, so the next poll asks for it
        // again.
        if self.options.subgraph_health_check {
            self.host.health_check(&document).await?;
        }

        let id = document.id.clone();
        self.last_uplink_id = Some(id.clone());
        self.last_served = document.clone();
        self.host.update(document).await;

        Ok(PollOutcome::Updated(id))
    }
}
