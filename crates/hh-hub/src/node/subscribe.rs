//! Consumer nodes: `stdsub`, `subpipe` and `subdzen`.
//!
//! All three share [`run_subscriber`], which pulls records off a subscribe
//! socket, decodes them and hands each event to a [`Sink`]. Only the sink
//! differs between node kinds.

use anyhow::anyhow;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hh_types::event::{decode, Event};

use crate::format::{EventState, Format};
use crate::node::{Lifecycle, NodeState};
use crate::process::{self, ProcessError, Renderer};
use crate::transport::Receiver;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// This event was not delivered; the sink can take the next one.
    #[error("{0:#}")]
    Recoverable(anyhow::Error),
    /// The output is gone. The node faults.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

/// Where a subscriber puts the events it receives.
#[async_trait]
pub trait Sink: Send {
    async fn deliver(&mut self, event: Event) -> Result<(), DeliveryError>;

    /// Release the output. Called once, on both clean and faulting exits.
    async fn close(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub delivered: u64,
    pub malformed: u64,
    /// Events the sink rejected without faulting.
    pub failed: u64,
}

/// Receive until shutdown, feeding `sink`.
///
/// `receiver` and `sink` must already be set up; the node moves to
/// `Connected` on entry. Decode failures and recoverable sink failures are
/// logged and skipped. A fatal sink failure or a closed socket moves the
/// node to `Faulting` and is returned as the error.
pub async fn run_subscriber<S>(
    lifecycle: &mut Lifecycle,
    receiver: &mut Receiver,
    sink: &mut S,
    shutdown: &CancellationToken,
) -> anyhow::Result<ReceiveStats>
where
    S: Sink + ?Sized,
{
    lifecycle.advance(NodeState::Connected);
    lifecycle.advance(NodeState::Receiving);

    let mut stats = ReceiveStats::default();
    let outcome = loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            record = receiver.recv() => record,
        };
        let Some(record) = record else {
            break Err(anyhow!("subscribe socket closed"));
        };
        let event = match decode(&record) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping undecodable record: {e}");
                stats.malformed += 1;
                continue;
            }
        };
        match sink.deliver(event).await {
            Ok(()) => stats.delivered += 1,
            Err(DeliveryError::Recoverable(e)) => {
                warn!("Event not delivered: {e:#}");
                stats.failed += 1;
            }
            Err(DeliveryError::Fatal(e)) => break Err(e),
        }
    };

    lifecycle.advance(match outcome {
        Ok(()) => NodeState::Closing,
        Err(_) => NodeState::Faulting,
    });
    sink.close().await;
    info!(
        node = lifecycle.node(),
        "{} delivered, {} malformed, {} failed", stats.delivered, stats.malformed, stats.failed
    );
    outcome.map(|()| stats)
}

// ─── stdsub ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintFormat {
    /// The event's wire line.
    #[default]
    Wire,
    /// One JSON object per line.
    Json,
}

/// Writes each event as a line on `out`.
pub struct PrintSink<W> {
    out: W,
    format: PrintFormat,
}

impl<W> PrintSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W, format: PrintFormat) -> Self {
        Self { out, format }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W> Sink for PrintSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&mut self, event: Event) -> Result<(), DeliveryError> {
        let mut line = match self.format {
            PrintFormat::Wire => event.to_string(),
            PrintFormat::Json => serde_json::to_string(&event)
                .map_err(|e| DeliveryError::Recoverable(e.into()))?,
        };
        line.push('\n');
        let write = async {
            self.out.write_all(line.as_bytes()).await?;
            self.out.flush().await
        };
        write
            .await
            .map_err(|e| DeliveryError::Fatal(anyhow!("output closed: {e}")))
    }

    async fn close(&mut self) {
        if let Err(e) = self.out.flush().await {
            debug!("Final flush failed: {e}");
        }
    }
}

// ─── subpipe ──────────────────────────────────────────────────────────────────

/// Runs `argv` once per event with the formatted state on its stdin.
pub struct PipeSink {
    argv: Vec<String>,
    format: Box<dyn Format>,
    state: EventState,
}

impl PipeSink {
    pub fn new<I, S>(argv: I, format: Box<dyn Format>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            format,
            state: EventState::new(),
        }
    }
}

#[async_trait]
impl Sink for PipeSink {
    async fn deliver(&mut self, event: Event) -> Result<(), DeliveryError> {
        self.state.apply(event);
        let text = self
            .format
            .render(&self.state)
            .map_err(|e| DeliveryError::Recoverable(e.into()))?;
        process::run_with_input(&self.argv, &text)
            .await
            .map_err(|e| DeliveryError::Recoverable(e.into()))
    }
}

// ─── subdzen ──────────────────────────────────────────────────────────────────

/// Folds events into an [`EventState`] and feeds one line per update to a
/// long-lived renderer.
pub struct DzenSink {
    renderer: Option<Renderer>,
    format: Box<dyn Format>,
    state: EventState,
}

impl DzenSink {
    /// Start the renderer. Failing here is a startup error.
    pub fn spawn(renderer_command: &str, format: Box<dyn Format>) -> Result<Self, ProcessError> {
        Ok(Self::new(Renderer::spawn(renderer_command)?, format))
    }

    pub fn new(renderer: Renderer, format: Box<dyn Format>) -> Self {
        Self {
            renderer: Some(renderer),
            format,
            state: EventState::new(),
        }
    }

    pub fn state(&self) -> &EventState {
        &self.state
    }
}

#[async_trait]
impl Sink for DzenSink {
    async fn deliver(&mut self, event: Event) -> Result<(), DeliveryError> {
        self.state.apply(event);
        let line = self
            .format
            .render(&self.state)
            .map_err(|e| DeliveryError::Recoverable(e.into()))?;

        let renderer = self
            .renderer
            .as_mut()
            .ok_or_else(|| DeliveryError::Fatal(anyhow!("renderer already stopped")))?;
        if renderer.has_exited() {
            return Err(DeliveryError::Fatal(anyhow!("renderer exited")));
        }
        renderer
            .write_line(&line)
            .await
            .map_err(|e| DeliveryError::Fatal(e.into()))
    }

    async fn close(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            renderer.shutdown().await;
        }
    }
}
