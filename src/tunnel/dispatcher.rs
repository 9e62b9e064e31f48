//! Dispatcher: the single reader loop over the physical connection

use super::frame::{FrameHeader, FRAME_HEADER_SIZE};
use super::pool::ChannelPool;
use super::ChannelSettings;
use crate::transport::{FrameSink, ObfuscatedReader, ObfuscatedWriter, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, trace};

/// Routes frames from the physical connection into the channel pool
pub struct Dispatcher<R, W> {
    reader: ObfuscatedReader<R>,
    writer: Arc<ObfuscatedWriter<W>>,
    pool: ChannelPool,
}

impl<R, W> Dispatcher<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a dispatcher with an empty pool writing through `writer`
    pub fn new(
        reader: ObfuscatedReader<R>,
        writer: Arc<ObfuscatedWriter<W>>,
        settings: ChannelSettings,
    ) -> Self {
        let sink: Arc<dyn FrameSink> = writer.clone();
        Self {
            reader,
            writer,
            pool: ChannelPool::new(sink, settings),
        }
    }

    /// Get the channel pool
    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Run until the physical connection fails
    ///
    /// Never returns `Ok`: a read error, peer close, or a write failure seen
    /// by any channel ends the loop with that error.
    pub async fn run(&mut self) -> Result<(), TransportError> {
        let writer = Arc::clone(&self.writer);
        loop {
            tokio::select! {
                result = self.dispatch_one() => {
                    if let Err(e) = result {
                        error!("Physical connection read failed: {}", e);
                        return Err(e);
                    }
                }
                reason = writer.failed() => {
                    return Err(TransportError::Poisoned(reason));
                }
            }
        }
    }

    /// Read one frame and route it
    async fn dispatch_one(&mut self) -> Result<(), TransportError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut header).await?;
        let header = FrameHeader::decode(header);
        trace!("Recv channel={} length={}", header.channel_id, header.length);

        if header.is_close() {
            self.pool.release(header.channel_id);
            return Ok(());
        }

        self.pool.allocate_or_lookup(header.channel_id);
        let mut payload = vec![0u8; header.length as usize];
        self.reader.read_exact(&mut payload).await?;

        if let Some(channel) = self.pool.get(header.channel_id) {
            if !channel.deliver(Bytes::from(payload)) {
                trace!(
                    "Channel {} no longer consuming, dropped {} bytes",
                    header.channel_id,
                    header.length
                );
            }
        }
        Ok(())
    }
}
