use std::collections::VecDeque;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::BridgeError;
use super::frames::decode_frame;
use crate::progress::ProgressEvent;

pub(crate) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Decoded progress of a worker-driven session.
///
/// Yields events until the worker closes the socket or the token is
/// cancelled. Cancellation closes the socket; from then on `next` returns
/// `None`.
#[derive(Debug)]
pub struct WorkerStream {
    endpoint: String,
    socket: Option<Socket>,
    pending: VecDeque<ProgressEvent>,
    cancel: CancellationToken,
}

impl WorkerStream {
    pub(crate) fn new(endpoint: String, socket: Socket, cancel: CancellationToken) -> Self {
        Self {
            endpoint,
            socket: Some(socket),
            pending: VecDeque::new(),
            cancel,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn next(&mut self) -> Option<Result<ProgressEvent, BridgeError>> {
        loop {
            if self.cancel.is_cancelled() {
                self.close().await;
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }

            let socket = self.socket.as_mut()?;
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                frame = socket.next() => Some(frame),
            };
            let Some(frame) = frame else {
                self.close().await;
                return None;
            };

            match frame {
                Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => return Some(Err(e)),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(endpoint = %self.endpoint, ?frame, "worker closed stream");
                    self.socket = None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.socket = None;
                    return Some(Err(e.into()));
                }
                None => self.socket = None,
            }
        }
    }

    /// Closes the socket and drops undelivered events. Idempotent.
    pub async fn close(&mut self) {
        self.pending.clear();
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "closing worker stream");
            }
        }
    }
}
