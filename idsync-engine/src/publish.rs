//! Handing events to the downstream pipeline.

use crate::error::PublishError;
use crate::tracker::PendingAck;
use async_trait::async_trait;
use idsync_types::Event;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

/// Accepts events for delivery.
///
/// Implementations call [`PendingAck::ack`] once the event has been durably
/// accepted. An event that is never acknowledged holds its cycle open until
/// shutdown.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Hand one event to the pipeline.
    async fn publish(&self, event: Event, ack: PendingAck) -> Result<(), PublishError>;
}

/// Forwards events, with their ack handles, over a channel.
///
/// The consumer decides when each event counts as delivered.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<(Event, PendingAck)>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(Event, PendingAck)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: Event, ack: PendingAck) -> Result<(), PublishError> {
        self.tx
            .send((event, ack))
            .await
            .map_err(|_| PublishError::Closed)
    }
}

/// Writes each event as one JSON line, acknowledging after the flush.
pub struct NdjsonPublisher<W> {
    writer: Mutex<W>,
}

impl<W> NdjsonPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Publisher for NdjsonPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, event: Event, ack: PendingAck) -> Result<(), PublishError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        ack.ack();
        Ok(())
    }
}
