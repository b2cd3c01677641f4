//! Replay of recorded control events.
//!
//! A [`Replayer`] walks a recording in order, rescales touch coordinates from
//! the resolution they were captured against to the current one, reproduces
//! the original gaps between events and hands each event to an
//! [`EventSink`]. Replay is a single task and can be cancelled at any wait.
//!
//! Entries that carry an element locator are never replayed as raw
//! coordinates: they go to an [`ElementExecutor`] when one is configured and
//! are skipped otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::element::Size;
use crate::protocol::ControlEvent;
use crate::recording::StoredEntry;

/// Failure to deliver one replayed event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Supplies the resolution events are rescaled to.
///
/// `None` means the resolution is not known yet; events are then dispatched
/// with their recorded coordinates.
pub trait ResolutionProvider: Send + Sync {
    fn current_resolution(&self) -> Option<Size>;
}

impl<F> ResolutionProvider for F
where
    F: Fn() -> Option<Size> + Send + Sync,
{
    fn current_resolution(&self) -> Option<Size> {
        self()
    }
}

/// A fixed resolution.
impl ResolutionProvider for Size {
    fn current_resolution(&self) -> Option<Size> {
        Some(*self)
    }
}

/// Receives replayed events. Dispatch must not record the event again.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, event: &ControlEvent) -> Result<(), DispatchError>;
}

/// Replays entries that carry an element locator instead of coordinates.
#[async_trait]
pub trait ElementExecutor: Send + Sync {
    async fn execute(&self, locator: &str, event: &ControlEvent) -> Result<(), DispatchError>;
}

/// Outcome of one replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Events handed to the sink successfully.
    pub dispatched: usize,
    /// Locator entries handed to the executor successfully.
    pub executed: usize,
    /// Entries whose message could not be decoded.
    pub skipped_malformed: usize,
    /// Locator entries skipped for lack of an executor.
    pub skipped_locator: usize,
    /// Sink or executor failures.
    pub failed: usize,
    pub cancelled: bool,
}

/// Replays recorded entries through an [`EventSink`].
#[derive(Clone)]
pub struct Replayer {
    sink: Arc<dyn EventSink>,
    resolution: Arc<dyn ResolutionProvider>,
    executor: Option<Arc<dyn ElementExecutor>>,
}

impl Replayer {
    pub fn new(sink: Arc<dyn EventSink>, resolution: Arc<dyn ResolutionProvider>) -> Self {
        Self {
            sink,
            resolution,
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ElementExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Rescales a touch to the current resolution.
    ///
    /// The stored entry is never modified; this works on the replay copy.
    fn rescale(&self, event: &mut ControlEvent) {
        let Some(target) = self.resolution.current_resolution() else {
            return;
        };
        let Some(touch) = event.as_touch_mut() else {
            return;
        };
        let Some(position) = touch.position else {
            return;
        };
        match position.rescaled(target) {
            Some(scaled) => touch.position = Some(scaled),
            None => warn!(
                reference = %position.screen_size,
                "recorded reference resolution is empty; replaying unscaled"
            ),
        }
    }

    /// Replays `entries` in order until done or `cancel` fires.
    pub async fn run(&self, entries: &[StoredEntry], cancel: &CancellationToken) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        let mut previous_time = 0u64;
        info!(count = entries.len(), "replay started");

        for (index, stored) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let entry = match stored.decode() {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(index, error = %e, "skipping undecodable entry");
                    summary.skipped_malformed += 1;
                    continue;
                }
            };

            let locator = entry.event.locator().map(str::to_owned);
            if locator.is_some() && self.executor.is_none() {
                info!(index, "skipping element-targeted entry; no executor configured");
                summary.skipped_locator += 1;
                continue;
            }

            let mut event = entry.event;
            if locator.is_none() {
                self.rescale(&mut event);
            }

            let gap = Duration::from_millis(entry.offset_millis.saturating_sub(previous_time));
            if !gap.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(gap) => {}
                }
            }
            previous_time = entry.offset_millis;

            let outcome = match (&locator, &self.executor) {
                (Some(locator), Some(executor)) => executor.execute(locator, &event).await,
                _ => self.sink.dispatch(&event).await,
            };
            match outcome {
                Ok(()) if locator.is_some() => summary.executed += 1,
                Ok(()) => summary.dispatched += 1,
                Err(e) => {
                    warn!(index, error = %e, "replayed event was not delivered");
                    summary.failed += 1;
                }
            }
            debug!(index, kind = event.kind().name(), "replayed entry");
        }

        info!(?summary, "replay finished");
        summary
    }

    /// Runs the replay on its own task.
    pub fn spawn(self, entries: Vec<StoredEntry>) -> ReplayHandle {
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        let join_handle = tokio::spawn(async move { self.run(&entries, &token_clone).await });

        ReplayHandle {
            cancel_token,
            join_handle,
        }
    }
}

/// Handle to a replay running on its own task.
pub struct ReplayHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<ReplaySummary>,
}

impl ReplayHandle {
    /// Stops the replay and waits for it to finish.
    pub async fn stop(self) -> Option<ReplaySummary> {
        self.cancel_token.cancel();
        self.join_handle.await.ok()
    }

    /// Cancels the replay without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// A token that cancels this replay, for use from another task.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Waits for the replay to run to completion.
    pub async fn wait(self) -> Option<ReplaySummary> {
        self.join_handle.await.ok()
    }

    /// Returns whether the replay is still running.
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}
