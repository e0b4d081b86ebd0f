use tokio::sync::mpsc;

use crate::ws::Outbound;

/// The receiving side of the session's outbound channel has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Write half of a session's outbound channel.
///
/// Every producer (handler, relay, both pumps) holds a clone; a single sender
/// task drains the channel into the socket, so frames never interleave.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Outbound>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queue a message, waiting for channel capacity.
    pub async fn send(&self, msg: impl Into<Outbound>) -> Result<(), SinkClosed> {
        self.tx.send(msg.into()).await.map_err(|_| SinkClosed)
    }

    /// Resolves once the receiver is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
