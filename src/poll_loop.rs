use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::client::ReportApi;
use crate::config::FAILURE_SURFACE_THRESHOLD;
use crate::error::SyncError;
use crate::events::{EventLevel, EventSource};
use crate::fetcher::TreeFetcher;
use crate::state::{PollPhase, SharedState};

/// Exponential retry delay: `initial`, doubled after every failure,
/// capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new tree was stored.
    Updated,
    /// The server had nothing new.
    Unchanged,
    /// Another poll was in flight, or an abort is pending.
    Skipped,
    Failed,
    /// The session has ended; no further polls will run.
    Stopped,
}

/// Clears the single-flight flag even if the tick is cancelled mid-fetch.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps the shared tree in step with the server, one poll at a time.
pub struct PollLoop<A> {
    api: Arc<A>,
    state: SharedState,
    in_flight: AtomicBool,
}

impl<A: ReportApi> PollLoop<A> {
    pub fn new(api: Arc<A>, state: SharedState) -> Self {
        Self {
            api,
            state,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Poll until the session ends. After a success the next poll starts
    /// one `poll_interval` after this one completed; after a failure it
    /// waits for the current backoff delay instead.
    pub async fn run(&self) {
        let config = &self.state.config;
        let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        let mut stop_rx = self.state.tree.stop_signal();
        info!(interval = ?config.poll_interval, "Poll loop started");

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let delay = match self.tick().await {
                TickOutcome::Stopped => break,
                TickOutcome::Failed => backoff.next_delay(),
                TickOutcome::Updated | TickOutcome::Unchanged => {
                    backoff.reset();
                    config.poll_interval
                }
                TickOutcome::Skipped => config.poll_interval,
            };

            tokio::select! {
                _ = sleep(delay) => {},
                _ = self.state.refresh_notify.notified() => {
                    debug!("Immediate refresh requested");
                },
                _ = stop_rx.changed() => {},
            }
        }

        self.state.poll.write().await.phase = PollPhase::Stopped;
        info!("Poll loop stopped");
    }

    /// Run one poll unless one is already in flight.
    pub async fn tick(&self) -> TickOutcome {
        if self.state.tree.is_ended().await {
            return TickOutcome::Stopped;
        }
        if self.state.control.read().await.aborting {
            debug!("Abort pending, skipping poll");
            return TickOutcome::Skipped;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Poll already in flight, skipping");
            return TickOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        self.poll_once().await
    }

    async fn poll_once(&self) -> TickOutcome {
        self.state.poll.write().await.phase = PollPhase::Fetching;

        let base = self.state.tree.snapshot().await;
        let fetcher = TreeFetcher::new(self.api.as_ref());
        let result = match fetcher.fetch(base.root.as_ref()).await {
            Ok(tree) => self.state.tree.commit_fetch(&base, tree).await,
            Err(e) => Err(e),
        };

        let root = match result {
            Ok(root) => root,
            Err(SyncError::SessionEnded) => {
                debug!("Session ended during poll, result discarded");
                return TickOutcome::Stopped;
            }
            Err(e) => {
                self.record_failure(&e).await;
                return TickOutcome::Failed;
            }
        };

        let recovered_after = {
            let mut poll = self.state.poll.write().await;
            let failures = poll.consecutive_failures;
            poll.phase = PollPhase::Idle;
            poll.cycles += 1;
            poll.consecutive_failures = 0;
            poll.last_error = None;
            poll.last_success_at = Some(Utc::now());
            failures
        };
        if recovered_after >= FAILURE_SURFACE_THRESHOLD {
            info!("Backend reachable again after {} failed polls", recovered_after);
            self.state
                .events
                .emit(
                    EventSource::Poll,
                    EventLevel::Info,
                    format!("Backend reachable again after {} failed polls", recovered_after),
                )
                .await;
        }

        let settled = root
            .fields
            .runtime_status
            .as_ref()
            .is_some_and(|status| status.is_settled());
        if settled {
            let mut flags = self.state.control.write().await;
            let after_reset = flags
                .reset_revision
                .is_some_and(|revision| base.revision >= revision);
            if flags.resetting && after_reset {
                flags.resetting = false;
                flags.reset_revision = None;
                drop(flags);
                self.state
                    .events
                    .emit(EventSource::Control, EventLevel::Info, "Report reset complete")
                    .await;
            }
        }

        let unchanged = base
            .root
            .as_ref()
            .is_some_and(|prev| Arc::ptr_eq(prev, &root));
        if unchanged {
            TickOutcome::Unchanged
        } else {
            info!("Report tree updated");
            TickOutcome::Updated
        }
    }

    /// Failures are logged quietly until they persist, then surfaced.
    async fn record_failure(&self, err: &SyncError) {
        let failures = {
            let mut poll = self.state.poll.write().await;
            poll.phase = PollPhase::Backoff;
            poll.consecutive_failures += 1;
            poll.last_error = Some(err.to_string());
            poll.consecutive_failures
        };

        let level = if failures >= FAILURE_SURFACE_THRESHOLD {
            warn!("Poll failed ({} in a row): {}", failures, err);
            EventLevel::Warn
        } else {
            debug!("Poll failed ({} in a row): {}", failures, err);
            EventLevel::Debug
        };
        self.state
            .events
            .emit_error(EventSource::Poll, level, err)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![500, 1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000, 60000]
        );
    }

    #[test]
    fn test_backoff_reset_after_success() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_initial_above_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
