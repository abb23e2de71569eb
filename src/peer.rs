//! Per-socket send path.
//!
//! Every websocket gets one writer task draining a bounded queue; everything
//! else holds a cloneable [`PeerSender`] and pushes frames without blocking.
//! Session and room locks are therefore never held across socket I/O. A full
//! queue means the peer is not keeping up: that peer alone is closed with
//! 1011 and other peers of the same terminal are unaffected.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Close code for viewers that cannot keep up with terminal output.
pub const CLOSE_SLOW_CONSUMER: u16 = 1011;

#[derive(Clone)]
pub struct PeerSender {
    tx: mpsc::Sender<Message>,
    close: Arc<watch::Sender<Option<CloseFrame<'static>>>>,
}

impl PeerSender {
    /// Spawn the writer task for a connected socket sink.
    pub fn spawn(sink: SplitSink<WebSocket, Message>, queue_depth: usize) -> Self {
        let (sender, rx, close_rx) = Self::channel(queue_depth);
        tokio::spawn(run_writer(sink, rx, close_rx));
        sender
    }

    /// Build the send handle plus the raw receiving ends. Used by the writer
    /// task and by tests that assert on emitted frames.
    pub fn channel(
        queue_depth: usize,
    ) -> (
        Self,
        mpsc::Receiver<Message>,
        watch::Receiver<Option<CloseFrame<'static>>>,
    ) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        (
            Self {
                tx,
                close: Arc::new(close_tx),
            },
            rx,
            close_rx,
        )
    }

    pub fn send_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.push(Message::Text(json)),
            Err(e) => debug!(error = %e, "failed to encode outbound message"),
        }
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.push(Message::Binary(bytes));
    }

    /// Ask the writer task to send a close frame and stop. The frame rides
    /// the normal queue so messages already enqueued still go out first; if
    /// the queue is full (a slow consumer is being shed) the side channel
    /// closes the socket immediately instead.
    pub fn close(&self, code: u16, reason: impl Into<Cow<'static, str>>) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        match self.tx.try_send(Message::Close(Some(frame.clone()))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.close.send_replace(Some(frame));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn push(&self, message: Message) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("boardwalk_frames_dropped_total").increment(1);
                self.close(CLOSE_SLOW_CONSUMER, "slow consumer");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("dropping frame for closed peer");
            }
        }
    }
}

/// Reject a socket: log and close with the given code. Used by endpoint
/// handlers when a session-level operation fails.
pub fn reject(sender: &PeerSender, code: u16, reason: String) {
    debug!(code, reason = %reason, "rejecting socket");
    sender.close(code, reason);
}

async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    mut close_rx: watch::Receiver<Option<CloseFrame<'static>>>,
) {
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = close_rx.borrow_and_update().clone();
                if let Some(frame) = frame {
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
            message = rx.recv() => {
                match message {
                    Some(Message::Close(frame)) => {
                        let _ = sink.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }
}
