//! C6 `StreamMux`: per-execution publish/subscribe fan-out of stdout,
//! stderr, and status frames. Implemented as a single actor task that owns
//! the ring buffer and subscriber registry, so a writer and many readers
//! never meet over a shared lock (spec.md §9 design note).

use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::frame::{Frame, FramePayload, StatusValue};

/// Default bound on a subscriber's outgoing channel before it is dropped
/// for lagging (spec.md §4.6).
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Default ring size, independent of the subscriber buffer — bounded to
/// roughly match the output cap so a fresh subscriber can always replay
/// the whole history of a still-running execution.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

enum MuxCommand {
    Publish(FramePayload),
    Subscribe {
        from_seq: Option<u64>,
        reply: oneshot::Sender<mpsc::Receiver<Frame>>,
    },
}

/// Cheap-to-clone handle to a running mux actor.
#[derive(Clone)]
pub struct StreamMuxHandle {
    cmd_tx: mpsc::Sender<MuxCommand>,
}

impl StreamMuxHandle {
    /// Appends a frame, assigning the next sequence number, and fans it out
    /// to every live subscriber. Returns `false` if the actor has already
    /// shut down (i.e. the execution already finalised).
    pub async fn publish(&self, payload: FramePayload) -> bool {
        self.cmd_tx.send(MuxCommand::Publish(payload)).await.is_ok()
    }

    /// Replays ring entries with sequence `>= from_seq` (default 0), then
    /// streams live frames, then the terminal frame, then closes. Returns
    /// `None` if the actor has already shut down.
    pub async fn subscribe(&self, from_seq: Option<u64>) -> Option<mpsc::Receiver<Frame>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCommand::Subscribe {
                from_seq,
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok()
    }
}

struct Subscriber {
    tx: mpsc::Sender<Frame>,
}

/// Spawns the actor task and returns a handle to it. The actor exits on its
/// own shortly after the terminal status frame has been fanned out.
pub fn spawn(ring_capacity: usize, subscriber_buffer: usize) -> StreamMuxHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<MuxCommand>(256);

    tokio::spawn(async move {
        let mut ring: VecDeque<Frame> = VecDeque::with_capacity(ring_capacity.min(1024));
        let mut subscribers: Vec<Subscriber> = Vec::new();
        let mut next_seq: u64 = 0;
        let mut finalized = false;

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                MuxCommand::Publish(payload) => {
                    if finalized {
                        warn!("publish after finalisation ignored");
                        continue;
                    }
                    let frame = Frame {
                        seq: next_seq,
                        timestamp: Utc::now(),
                        payload,
                    };
                    next_seq += 1;

                    if ring.len() >= ring_capacity {
                        ring.pop_front();
                    }
                    ring.push_back(frame.clone());

                    let terminal = frame.is_terminal_status();
                    fan_out(&mut subscribers, frame, subscriber_buffer).await;

                    if terminal {
                        finalized = true;
                        trace!(seq = next_seq, "stream mux finalised");
                        break;
                    }
                }
                MuxCommand::Subscribe { from_seq, reply } => {
                    // `tx` is only handed to the caller via `reply` once this
                    // arm returns, so replay must never block on it here —
                    // the actor is still the only one driving this loop.
                    // `try_send` plus the same lag handling `fan_out` uses
                    // keeps a backlog deeper than `subscriber_buffer` from
                    // wedging the whole mux.
                    let (tx, rx) = mpsc::channel(subscriber_buffer.max(1));
                    let from_seq = from_seq.unwrap_or(0);
                    let mut lagged = false;
                    for frame in ring.iter().filter(|f| f.seq >= from_seq) {
                        match tx.try_send(frame.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(subscriber_buffer, "new subscriber's replay backlog exceeded its buffer, dropping it");
                                let lag_frame = Frame {
                                    seq: frame.seq,
                                    timestamp: Utc::now(),
                                    payload: FramePayload::Status {
                                        value: StatusValue::SubscriberLagged,
                                    },
                                };
                                let _ = tx.try_send(lag_frame);
                                lagged = true;
                                break;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                lagged = true;
                                break;
                            }
                        }
                    }
                    if !lagged {
                        subscribers.push(Subscriber { tx });
                    }
                    let _ = reply.send(rx);
                }
            }
        }
        // Actor exits here: the command channel is dropped, so any further
        // `publish`/`subscribe` call against this handle observes a closed
        // channel. The `Orchestrator` treats a post-finalisation subscribe
        // as "attach after finalisation" and serves a synthetic `Ended`
        // frame from the persisted record instead.
    });

    StreamMuxHandle { cmd_tx }
}

async fn fan_out(subscribers: &mut Vec<Subscriber>, frame: Frame, buffer_cap: usize) {
    let mut still_alive = Vec::with_capacity(subscribers.len());
    for sub in subscribers.drain(..) {
        match sub.tx.try_send(frame.clone()) {
            Ok(()) => still_alive.push(sub),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(buffer_cap, "subscriber lagged, dropping it");
                let lag_frame = Frame {
                    seq: frame.seq,
                    timestamp: Utc::now(),
                    payload: FramePayload::Status {
                        value: StatusValue::SubscriberLagged,
                    },
                };
                let _ = sub.tx.try_send(lag_frame);
                // subscriber dropped: not pushed back into `still_alive`
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // receiver gone, drop silently
            }
        }
    }
    *subscribers = still_alive;
}
