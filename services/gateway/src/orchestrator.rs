//! Retrieval orchestrator
//!
//! Races the three retrieval channels for one submission. The tap channel
//! starts immediately; the poller starts when no first byte arrives within
//! T1; the harvest fallback starts when no terminal arrives within T2. If
//! every channel started so far has already failed, the next one starts
//! immediately instead of waiting out its timer.
//!
//! First terminal wins: later results are discarded and partial fragments
//! from different channels are never stitched into one response. A hard
//! per-request ceiling yields a terminal `Timeout` for the classifier.
//! Cancellation aborts every channel task and the driver submission without
//! touching pool state.

use std::sync::Arc;
use std::time::Duration;

use driver::{Driver, FailureKind, SubmissionHandle};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channels::{
    ChannelEvent, ChannelId, HarvestChannel, PollChannel, RetrievalChannel, TapChannel,
};

/// Escalation timers for one request.
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    /// T1: tap first-byte deadline before the poller starts.
    pub first_byte: Duration,
    /// T2: terminal deadline before the harvest fallback starts.
    pub escalation: Duration,
    /// Hard per-request ceiling.
    pub request_ceiling: Duration,
}

/// How one retrieval ended, when it did not produce text.
#[derive(Debug, PartialEq, Eq)]
pub enum RetrievalError {
    /// Every channel failed, or the request ceiling elapsed.
    Failed(FailureKind),
    /// The client went away; pool state must stay untouched.
    Cancelled,
}

/// Per-channel progress record, request-scoped: created when the race
/// starts, logged when it ends, then discarded.
#[derive(Default)]
struct Attempt {
    started: bool,
    failed: bool,
    buffered: String,
    first_byte_at: Option<Instant>,
    terminal_at: Option<Instant>,
}

impl Attempt {
    fn status(&self) -> &'static str {
        if !self.started {
            "idle"
        } else if self.failed {
            "failed"
        } else if self.terminal_at.is_some() {
            "terminal"
        } else if !self.buffered.is_empty() {
            "partial"
        } else {
            "pending"
        }
    }
}

pub struct Orchestrator {
    tap: Arc<dyn RetrievalChannel>,
    poll: Arc<dyn RetrievalChannel>,
    harvest: Arc<dyn RetrievalChannel>,
    driver: Arc<dyn Driver>,
    timers: Timers,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn Driver>,
        tap: Arc<intercept::TapRegistry>,
        poll_interval: Duration,
        timers: Timers,
    ) -> Self {
        Self {
            tap: Arc::new(TapChannel::new(tap)),
            poll: Arc::new(PollChannel::new(driver.clone(), poll_interval)),
            harvest: Arc::new(HarvestChannel::new(driver.clone())),
            driver,
            timers,
        }
    }

    /// Race the channels to a terminal result for `handle`.
    pub async fn retrieve(
        &self,
        handle: SubmissionHandle,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<String, RetrievalError> {
        let started_at = Instant::now();
        let (tx, mut rx) = mpsc::channel::<ChannelEvent>(64);
        let mut tasks = JoinSet::new();

        let mut tap = Attempt::default();
        let mut poll = Attempt::default();
        let mut harvest = Attempt::default();

        tap.started = true;
        tasks.spawn(self.tap.clone().run(handle.clone(), tx.clone()));

        let t1 = tokio::time::sleep(self.timers.first_byte);
        let t2 = tokio::time::sleep(self.timers.escalation);
        let ceiling = tokio::time::sleep(self.timers.request_ceiling);
        tokio::pin!(t1, t2, ceiling);

        let mut last_failure = FailureKind::Unknown;
        let mut cancel_open = true;

        let outcome = loop {
            tokio::select! {
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow() => break Err(RetrievalError::Cancelled),
                        Ok(()) => {}
                        // Sender gone; cancellation can no longer arrive.
                        Err(_) => cancel_open = false,
                    }
                }
                _ = &mut ceiling => {
                    warn!(request_id = %handle.id, "request ceiling elapsed");
                    break Err(RetrievalError::Failed(FailureKind::Timeout));
                }
                _ = &mut t1, if !poll.started && tap.first_byte_at.is_none() => {
                    debug!(request_id = %handle.id, "no first byte within T1, starting poller");
                    poll.started = true;
                    tasks.spawn(self.poll.clone().run(handle.clone(), tx.clone()));
                }
                _ = &mut t2, if !harvest.started => {
                    debug!(request_id = %handle.id, "no terminal within T2, starting harvest");
                    harvest.started = true;
                    tasks.spawn(self.harvest.clone().run(handle.clone(), tx.clone()));
                }
                // `tx` stays alive in this scope, so recv() cannot yield None.
                Some(event) = rx.recv() => match event {
                    ChannelEvent::FirstByte { channel } => {
                        let attempt = match channel {
                            ChannelId::Tap => &mut tap,
                            ChannelId::Poll => &mut poll,
                            ChannelId::Harvest => &mut harvest,
                        };
                        attempt.first_byte_at = Some(Instant::now());
                        metrics::histogram!(
                            "retrieval_first_byte_seconds",
                            "channel" => channel.label()
                        )
                        .record(started_at.elapsed().as_secs_f64());
                    }
                    ChannelEvent::Partial { channel, text } => {
                        let attempt = match channel {
                            ChannelId::Tap => &mut tap,
                            ChannelId::Poll => &mut poll,
                            ChannelId::Harvest => &mut harvest,
                        };
                        attempt.buffered.push_str(&text);
                    }
                    ChannelEvent::Terminal { channel, text } => {
                        let attempt = match channel {
                            ChannelId::Tap => &mut tap,
                            ChannelId::Poll => &mut poll,
                            ChannelId::Harvest => &mut harvest,
                        };
                        attempt.terminal_at = Some(Instant::now());
                        break Ok((channel, text));
                    }
                    ChannelEvent::Failed { channel, kind } => {
                        debug!(
                            request_id = %handle.id,
                            channel = channel.label(),
                            kind = kind.label(),
                            "retrieval channel failed"
                        );
                        match channel {
                            ChannelId::Tap => tap.failed = true,
                            ChannelId::Poll => poll.failed = true,
                            ChannelId::Harvest => harvest.failed = true,
                        }
                        // Driver-classified kinds beat the tap's vague ones.
                        if kind != FailureKind::Unknown || last_failure == FailureKind::Unknown {
                            last_failure = kind;
                        }

                        let all_started_failed = (!tap.started || tap.failed)
                            && (!poll.started || poll.failed)
                            && (!harvest.started || harvest.failed);
                        if all_started_failed {
                            if !poll.started {
                                poll.started = true;
                                tasks.spawn(self.poll.clone().run(handle.clone(), tx.clone()));
                            } else if !harvest.started {
                                harvest.started = true;
                                tasks.spawn(self.harvest.clone().run(handle.clone(), tx.clone()));
                            } else {
                                break Err(RetrievalError::Failed(last_failure));
                            }
                        }
                    }
                },
            }
        };

        tasks.abort_all();

        debug!(
            request_id = %handle.id,
            tap = tap.status(),
            poll = poll.status(),
            harvest = harvest.status(),
            tap_buffered = tap.buffered.len(),
            "retrieval race ended"
        );

        match outcome {
            Ok((winner, text)) => {
                let elapsed = started_at.elapsed();
                info!(
                    request_id = %handle.id,
                    winner = winner.label(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "retrieval complete"
                );
                metrics::counter!("retrieval_wins_total", "channel" => winner.label()).increment(1);
                metrics::histogram!("retrieval_duration_seconds")
                    .record(elapsed.as_secs_f64());
                Ok(text)
            }
            Err(RetrievalError::Cancelled) => {
                info!(request_id = %handle.id, "retrieval cancelled by client");
                metrics::counter!("retrieval_cancelled_total").increment(1);
                if let Err(e) = self.driver.abort(&handle).await {
                    warn!(request_id = %handle.id, error = %e, "driver abort failed");
                }
                Err(RetrievalError::Cancelled)
            }
            Err(RetrievalError::Failed(kind)) => {
                metrics::counter!("retrieval_failures_total", "kind" => kind.label()).increment(1);
                Err(RetrievalError::Failed(kind))
            }
        }
    }
}
