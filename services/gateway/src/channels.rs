//! Retrieval channels
//!
//! Three independent ways to obtain the terminal response for one in-flight
//! submission, racing under the orchestrator:
//!
//! - tap: assembles decrypted frames from the interception proxy — lowest
//!   latency, fails if interception never engaged or the connection drops
//! - poll: polls the driver's status side channel, harvesting once done
//! - harvest: waits for driver completion outright — the slow, robust fallback
//!
//! Channels report progress as events on a shared stream; they never decide
//! the race themselves.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use driver::{Driver, FailureKind, SubmissionHandle, SubmissionStatus, classify_message};
use intercept::{StreamFrame, TapRegistry};
use tokio::sync::mpsc;
use tracing::debug;

/// Identifies which channel produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    Tap,
    Poll,
    Harvest,
}

impl ChannelId {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelId::Tap => "tap",
            ChannelId::Poll => "poll",
            ChannelId::Harvest => "harvest",
        }
    }
}

/// Progress events emitted into the orchestrator's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    FirstByte { channel: ChannelId },
    Partial { channel: ChannelId, text: String },
    Terminal { channel: ChannelId, text: String },
    Failed { channel: ChannelId, kind: FailureKind },
}

/// One way of retrieving the response for a submission.
///
/// `run` owns the channel's whole lifecycle for one request; the orchestrator
/// aborts the task when the race is decided or the request is cancelled.
pub trait RetrievalChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn run(
        self: Arc<Self>,
        handle: SubmissionHandle,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Channel A: decrypted frames from the interception proxy.
pub struct TapChannel {
    tap: Arc<TapRegistry>,
}

impl TapChannel {
    pub fn new(tap: Arc<TapRegistry>) -> Self {
        Self { tap }
    }
}

impl RetrievalChannel for TapChannel {
    fn id(&self) -> ChannelId {
        ChannelId::Tap
    }

    fn run(
        self: Arc<Self>,
        handle: SubmissionHandle,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut rx = self.tap.register(&handle.id, &handle.host).await;
            let mut assembled = String::new();
            let mut first_byte = false;

            loop {
                match rx.recv().await {
                    Some(StreamFrame::Data(bytes)) => {
                        if !first_byte {
                            first_byte = true;
                            let _ = events
                                .send(ChannelEvent::FirstByte {
                                    channel: ChannelId::Tap,
                                })
                                .await;
                        }
                        let chunk = String::from_utf8_lossy(&bytes).into_owned();
                        assembled.push_str(&chunk);
                        let _ = events
                            .send(ChannelEvent::Partial {
                                channel: ChannelId::Tap,
                                text: chunk,
                            })
                            .await;
                    }
                    Some(StreamFrame::Closed) => {
                        let event = if assembled.is_empty() {
                            // Stream ended before interception produced
                            // anything usable.
                            ChannelEvent::Failed {
                                channel: ChannelId::Tap,
                                kind: FailureKind::Unknown,
                            }
                        } else {
                            ChannelEvent::Terminal {
                                channel: ChannelId::Tap,
                                text: assembled,
                            }
                        };
                        let _ = events.send(event).await;
                        break;
                    }
                    Some(StreamFrame::Aborted) => {
                        let _ = events
                            .send(ChannelEvent::Failed {
                                channel: ChannelId::Tap,
                                kind: FailureKind::BackendError,
                            })
                            .await;
                        break;
                    }
                    // Tap slot was replaced or torn down under us.
                    None => {
                        let _ = events
                            .send(ChannelEvent::Failed {
                                channel: ChannelId::Tap,
                                kind: FailureKind::Unknown,
                            })
                            .await;
                        break;
                    }
                }
            }
            self.tap.unregister(&handle.id).await;
        })
    }
}

/// Channel B: driver status polling.
pub struct PollChannel {
    driver: Arc<dyn Driver>,
    interval: Duration,
}

impl PollChannel {
    pub fn new(driver: Arc<dyn Driver>, interval: Duration) -> Self {
        Self { driver, interval }
    }
}

impl RetrievalChannel for PollChannel {
    fn id(&self) -> ChannelId {
        ChannelId::Poll
    }

    fn run(
        self: Arc<Self>,
        handle: SubmissionHandle,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                match self.driver.poll_status(&handle).await {
                    Ok(SubmissionStatus::Pending) => continue,
                    Ok(SubmissionStatus::Done) => {
                        let event = match self.driver.harvest_final_text(&handle).await {
                            Ok(text) => {
                                let _ = events
                                    .send(ChannelEvent::FirstByte {
                                        channel: ChannelId::Poll,
                                    })
                                    .await;
                                ChannelEvent::Terminal {
                                    channel: ChannelId::Poll,
                                    text,
                                }
                            }
                            Err(e) => ChannelEvent::Failed {
                                channel: ChannelId::Poll,
                                kind: e.kind(),
                            },
                        };
                        let _ = events.send(event).await;
                        break;
                    }
                    Ok(SubmissionStatus::Error(message)) => {
                        debug!(request_id = %handle.id, message, "poll channel saw backend error");
                        let _ = events
                            .send(ChannelEvent::Failed {
                                channel: ChannelId::Poll,
                                kind: classify_message(&message),
                            })
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = events
                            .send(ChannelEvent::Failed {
                                channel: ChannelId::Poll,
                                kind: e.kind(),
                            })
                            .await;
                        break;
                    }
                }
            }
        })
    }
}

/// Channel C: wait out the driver and harvest the final text.
pub struct HarvestChannel {
    driver: Arc<dyn Driver>,
}

impl HarvestChannel {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }
}

impl RetrievalChannel for HarvestChannel {
    fn id(&self) -> ChannelId {
        ChannelId::Harvest
    }

    fn run(
        self: Arc<Self>,
        handle: SubmissionHandle,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let event = match self.driver.harvest_final_text(&handle).await {
                Ok(text) => {
                    let _ = events
                        .send(ChannelEvent::FirstByte {
                            channel: ChannelId::Harvest,
                        })
                        .await;
                    ChannelEvent::Terminal {
                        channel: ChannelId::Harvest,
                        text,
                    }
                }
                Err(e) => ChannelEvent::Failed {
                    channel: ChannelId::Harvest,
                    kind: e.kind(),
                },
            };
            let _ = events.send(event).await;
        })
    }
}
