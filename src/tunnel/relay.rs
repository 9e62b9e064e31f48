//! Relay from the destination session back through the tunnel

use super::channel::ChannelWriter;
use super::frame::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use super::ChannelSettings;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Why a relay loop stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// Destination closed its side
    Eof,
    /// Destination read failed
    Error(std::io::Error),
    /// The channel was released; nothing more may be written for it
    Released,
    /// The owning channel asked the relay to stop
    Stopped,
    /// Writing to the physical connection failed
    Transport,
    /// The relay task panicked
    Panicked,
}

/// Read the destination and frame everything back to the peer
///
/// Reads land after `FRAME_HEADER_SIZE` reserved bytes so each chunk is
/// framed in place. Read timeouts only serve to notice a released channel.
/// `stop` resolves (or its sender drops) to end the loop; it is only observed
/// while waiting on the destination, never in the middle of a frame write.
pub(crate) async fn relay_from_target(
    mut target: OwnedReadHalf,
    writer: ChannelWriter,
    settings: ChannelSettings,
    mut stop: oneshot::Receiver<()>,
) -> RelayEnd {
    let id = writer.id();
    let size = settings
        .relay_buffer_size
        .clamp(FRAME_HEADER_SIZE + 1, FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE);
    let mut buf = vec![0u8; size];

    loop {
        let read = tokio::select! {
            _ = &mut stop => {
                trace!("Channel {} relay stopped", id);
                return RelayEnd::Stopped;
            }
            read = tokio::time::timeout(
                settings.read_timeout,
                target.read(&mut buf[FRAME_HEADER_SIZE..]),
            ) => read,
        };

        let n = match read {
            Err(_) => {
                if writer.is_revoked() {
                    return RelayEnd::Released;
                }
                continue;
            }
            Ok(Ok(0)) => {
                trace!("Channel {} target reached end of stream", id);
                if let Err(e) = writer.send_close().await {
                    debug!("Channel {} failed to send close: {}", id, e);
                }
                return RelayEnd::Eof;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Ok(Err(e)) => {
                debug!("Channel {} target read error: {}", id, e);
                if let Err(e) = writer.send_close().await {
                    debug!("Channel {} failed to send close: {}", id, e);
                }
                return RelayEnd::Error(e);
            }
        };

        match writer.send_framed(&mut buf[..FRAME_HEADER_SIZE + n]).await {
            Ok(true) => {}
            Ok(false) => return RelayEnd::Released,
            Err(e) => {
                debug!("Channel {} relay write failed: {}", id, e);
                return RelayEnd::Transport;
            }
        }
    }
}
