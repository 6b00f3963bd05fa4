//! The envelope a work item travels the pipeline in, and the in-band ping
//! probe used to check a stage's liveness without running its command.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::StructuredError;

/// One item in flight through a pipeline. Carries its own cancellation and
/// deadline rather than relying on the surrounding task's, since a single
/// pipeline instance multiplexes many unrelated items through the same
/// worker pools.
#[derive(Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
    /// Write-once: the first stage to fail sets this and every later stage
    /// leaves it untouched, short-circuiting straight to the pipeline's
    /// output instead of running its own command.
    pub error: Option<StructuredError>,
    /// When set, this item's outcome (success or failure) is delivered here
    /// instead of the stage's normal next hop or the pipeline's default
    /// output. Delivery blocks like any other hop - this is not the
    /// best-effort tap.
    pub output_override: Option<async_channel::Sender<WorkItem<T>>>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            deadline: None,
            cancellation: CancellationToken::new(),
            error: None,
            output_override: None,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn with_output_override(mut self, sender: async_channel::Sender<WorkItem<T>>) -> Self {
        self.output_override = Some(sender);
        self
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.cancellation.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// A liveness probe injected into a pipeline's input channel. Every
/// non-terminal stage that dequeues one forwards it to the next stage's
/// inbound untouched, without ever calling its own command; the terminal
/// stage tags it "pong" by routing it to its output (or the probe's own
/// override) instead of forwarding it further.
pub struct PingProbe<T> {
    pub output_override: Option<async_channel::Sender<WorkItem<T>>>,
}

impl<T> PingProbe<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self { output_override: None }
    }

    #[must_use]
    pub fn with_output_override(mut self, sender: async_channel::Sender<WorkItem<T>>) -> Self {
        self.output_override = Some(sender);
        self
    }
}

impl<T> Default for PingProbe<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// What actually travels on a pipeline's rendezvous channels: either real
/// work, or a ping that bypasses stage commands entirely.
pub enum WorkItem<T> {
    Work(Envelope<T>),
    Ping(PingProbe<T>),
}
