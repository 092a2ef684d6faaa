//! Minimal host event loop and packet sink.
//!
//! Acquisition code never spawns tasks or blocks the runtime. Instead it
//! registers a [`PollHandler`] with an [`EventLoop`] together with a
//! [`PollSource`] describing how often to call it. The loop calls each
//! handler in turn, one callback at a time, until every source has been
//! removed, a handler fails, or the loop is cancelled.
//!
//! Data produced by a handler leaves through a [`PacketSink`].
//!
//! ```
//! use benchlib_core::session::{Control, EventLoop, PollHandler, PollSource};
//! use benchlib_core::Result;
//! use std::time::Duration;
//!
//! struct Countdown(u32);
//!
//! #[async_trait::async_trait]
//! impl PollHandler for Countdown {
//!     async fn poll(&mut self) -> Result<Control> {
//!         self.0 -= 1;
//!         Ok(if self.0 == 0 { Control::Remove } else { Control::Continue })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let mut event_loop = EventLoop::new();
//! event_loop.source_add(PollSource::timer(Duration::from_millis(1)), Box::new(Countdown(3)));
//! event_loop.run().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::packet::Packet;

/// What a registered source waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    /// Incoming data on a descriptor-like link.
    Input,
    /// Nothing; the source is a pure timer (RPC links, GPIB).
    None,
}

/// Registration parameters for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSource {
    pub events: PollEvents,
    /// Interval between callbacks.
    pub timeout: Duration,
}

impl PollSource {
    pub fn input(timeout: Duration) -> Self {
        PollSource {
            events: PollEvents::Input,
            timeout,
        }
    }

    pub fn timer(timeout: Duration) -> Self {
        PollSource {
            events: PollEvents::None,
            timeout,
        }
    }
}

/// What the loop should do with a source after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep polling.
    Continue,
    /// Unregister the source.
    Remove,
}

/// A callback registered with an [`EventLoop`].
#[async_trait]
pub trait PollHandler: Send {
    /// Called once per poll interval.
    ///
    /// Returning an error removes the source and stops the loop with that
    /// error.
    async fn poll(&mut self) -> Result<Control>;

    /// Called when the loop is cancelled while this source is registered.
    async fn cancel(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opaque handle to a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

struct Registered<'a> {
    id: SourceId,
    source: PollSource,
    due: Instant,
    handler: Box<dyn PollHandler + 'a>,
}

/// Single-task, timer-driven event loop.
///
/// Sources are polled in due order. Other sources advance between, never
/// during, a callback.
pub struct EventLoop<'a> {
    sources: Vec<Registered<'a>>,
    next_id: u64,
    cancel: CancellationToken,
}

impl<'a> EventLoop<'a> {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Create a loop that stops when `cancel` is triggered.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        EventLoop {
            sources: Vec::new(),
            next_id: 0,
            cancel,
        }
    }

    /// A token that cancels this loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a handler. The first callback fires after one `timeout`.
    pub fn source_add(&mut self, source: PollSource, handler: Box<dyn PollHandler + 'a>) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;

        tracing::debug!(
            source = id.0,
            events = ?source.events,
            timeout_ms = source.timeout.as_millis(),
            "Adding poll source"
        );

        self.sources.push(Registered {
            id,
            source,
            due: Instant::now() + source.timeout,
            handler,
        });
        id
    }

    /// Unregister a handler.
    pub fn source_remove(&mut self, id: SourceId) -> Result<()> {
        let idx = self
            .sources
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown poll source {}", id.0)))?;
        self.sources.remove(idx);
        tracing::debug!(source = id.0, "Removed poll source");
        Ok(())
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Run until all sources are removed, a handler fails, or the loop is
    /// cancelled.
    ///
    /// On cancellation every remaining handler gets its
    /// [`cancel`](PollHandler::cancel) callback and is unregistered.
    pub async fn run(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();

        loop {
            let Some(idx) = self.next_due() else {
                return Ok(());
            };

            let due = self.sources[idx].due;
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep_until(due) => false,
            };

            if cancelled {
                tracing::debug!(sources = self.sources.len(), "Event loop cancelled");
                let mut first_err = None;
                for mut registered in self.sources.drain(..) {
                    if let Err(e) = registered.handler.cancel().await {
                        tracing::warn!(source = registered.id.0, error = %e, "Cancel callback failed");
                        first_err.get_or_insert(e);
                    }
                }
                return match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }

            let registered = &mut self.sources[idx];
            match registered.handler.poll().await {
                Ok(Control::Continue) => {
                    registered.due = Instant::now() + registered.source.timeout;
                }
                Ok(Control::Remove) => {
                    let id = registered.id;
                    self.sources.remove(idx);
                    tracing::debug!(source = id.0, "Poll source finished");
                }
                Err(e) => {
                    let id = registered.id;
                    self.sources.remove(idx);
                    tracing::error!(source = id.0, error = %e, "Poll source failed");
                    return Err(e);
                }
            }
        }
    }

    fn next_due(&self) -> Option<usize> {
        self.sources
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.due)
            .map(|(idx, _)| idx)
    }
}

impl Default for EventLoop<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination for emitted packets.
pub trait PacketSink: Send {
    fn send_packet(&mut self, packet: Packet) -> Result<()>;
}

impl PacketSink for Vec<Packet> {
    fn send_packet(&mut self, packet: Packet) -> Result<()> {
        self.push(packet);
        Ok(())
    }
}

impl PacketSink for tokio::sync::mpsc::UnboundedSender<Packet> {
    fn send_packet(&mut self, packet: Packet) -> Result<()> {
        self.send(packet).map_err(|_| Error::StreamClosed)
    }
}
