//! Logical channel: SOCKS5 handshake, destination connect, forward relay
//!
//! Each allocated channel runs one task that consumes its inbound queue in
//! arrival order. Every dequeued payload advances an explicit state:
//!
//! ```text
//! AwaitingGreeting --greeting--> AwaitingRequest --CONNECT ok--> Relaying
//!        |                              |                           |
//!   bad version                 malformed / connect failed   peer close, target
//!   (abandoned)                     (close frame sent)        EOF or error
//!                                       v                           v
//!                                     Closed <----------------------+
//! ```
//!
//! The pool slot is only retired by a close frame from the peer. The relay task
//! is never aborted: it is told to stop and exits between frames, so a frame
//! it has started writing always reaches the wire whole.

use super::frame::{write_header_in_place, ChannelId, FRAME_HEADER_SIZE};
use super::relay::relay_from_target;
use super::{ChannelSettings, RelayEnd, TunnelError};
use crate::proxy::{
    parse_connect_request, parse_greeting, Address, ProxyError, AUTH_REPLY, CONNECT_SUCCESS_REPLY,
};
use crate::transport::{FrameSink, Lease};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Slot is on the free list
    Free,
    /// Waiting for the SOCKS5 greeting
    AwaitingGreeting,
    /// Waiting for the CONNECT request
    AwaitingRequest,
    /// Destination session open, relaying both ways
    Relaying,
    /// Session over; waiting for the peer to release the id
    Closed,
}

/// Frame writer bound to one channel allocation
#[derive(Clone)]
pub struct ChannelWriter {
    id: ChannelId,
    lease: Lease,
    sink: Arc<dyn FrameSink>,
}

impl ChannelWriter {
    pub fn new(id: ChannelId, lease: Lease, sink: Arc<dyn FrameSink>) -> Self {
        Self { id, lease, sink }
    }

    /// Channel id frames are written under
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether the allocation behind this writer has been released
    pub fn is_revoked(&self) -> bool {
        self.lease.is_revoked()
    }

    /// Frame and send a non-empty payload
    ///
    /// Returns `Ok(false)` when the write was dropped because the lease is
    /// revoked.
    pub async fn send_payload(&self, payload: &[u8]) -> Result<bool, TunnelError> {
        if payload.is_empty() {
            return Err(TunnelError::InvalidFrame(
                "empty data frame would read as close".to_string(),
            ));
        }
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + payload.len()];
        buf[FRAME_HEADER_SIZE..].copy_from_slice(payload);
        self.send_framed(&mut buf).await
    }

    /// Send `buf`, whose first `FRAME_HEADER_SIZE` bytes are reserved for the header
    pub async fn send_framed(&self, buf: &mut [u8]) -> Result<bool, TunnelError> {
        write_header_in_place(buf, self.id)?;
        self.send_raw(buf).await
    }

    /// Send a close frame for this channel
    pub async fn send_close(&self) -> Result<bool, TunnelError> {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.send_framed(&mut buf).await
    }

    async fn send_raw(&self, frame: &[u8]) -> Result<bool, TunnelError> {
        let sent = self.sink.send(frame, &self.lease).await?;
        if !sent {
            trace!("Dropped {} byte frame for released channel {}", frame.len(), self.id);
        }
        Ok(sent)
    }
}

/// Relay task plus the signal that asks it to stop
struct RelayTask {
    handle: JoinHandle<RelayEnd>,
    _stop: oneshot::Sender<()>,
}

/// Whether the channel task keeps consuming its queue
enum Step {
    Continue,
    Stop,
}

/// One virtual proxied connection
pub struct LogicalChannel {
    id: ChannelId,
    state: ChannelState,
    state_tx: watch::Sender<ChannelState>,
    writer: ChannelWriter,
    settings: ChannelSettings,
    target: Option<OwnedWriteHalf>,
}

impl LogicalChannel {
    /// Create a channel in `AwaitingGreeting`
    pub fn new(
        writer: ChannelWriter,
        state_tx: watch::Sender<ChannelState>,
        settings: ChannelSettings,
    ) -> Self {
        let channel = Self {
            id: writer.id(),
            state: ChannelState::AwaitingGreeting,
            state_tx,
            writer,
            settings,
            target: None,
        };
        channel.state_tx.send_replace(channel.state);
        channel
    }

    /// Get channel id
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn transition(&mut self, next: ChannelState) {
        trace!("Channel {} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
    }

    /// Consume the inbound queue until it is closed or the session ends
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Bytes>) {
        let mut relay: Option<RelayTask> = None;

        loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(payload) => {
                        if let Step::Stop = self.on_message(payload, &mut relay).await {
                            break;
                        }
                    }
                    None => {
                        debug!("Channel {} released by peer", self.id);
                        break;
                    }
                },
                end = wait_relay(&mut relay), if relay.is_some() => {
                    debug!("Channel {} relay from target ended: {:?}", self.id, end);
                    relay = None;
                    break;
                }
            }
        }

        // Dropping the stop sender ends the relay at its next read.
        drop(relay.take());
        self.close_target().await;
        if self.state == ChannelState::Relaying {
            self.transition(ChannelState::Closed);
        }
    }

    async fn on_message(
        &mut self,
        payload: Bytes,
        relay: &mut Option<RelayTask>,
    ) -> Step {
        match self.state {
            ChannelState::AwaitingGreeting => self.on_greeting(&payload).await,
            ChannelState::AwaitingRequest => self.on_request(&payload, relay).await,
            ChannelState::Relaying => self.forward(&payload).await,
            ChannelState::Free | ChannelState::Closed => Step::Stop,
        }
    }

    async fn on_greeting(&mut self, payload: &[u8]) -> Step {
        if let Err(e) = parse_greeting(payload) {
            warn!("Channel {} abandoned: {}", self.id, e);
            return Step::Stop;
        }

        if let Err(e) = self.writer.send_payload(&AUTH_REPLY).await {
            debug!("Channel {} failed to send method reply: {}", self.id, e);
            return Step::Stop;
        }
        self.transition(ChannelState::AwaitingRequest);
        Step::Continue
    }

    async fn on_request(
        &mut self,
        payload: &[u8],
        relay: &mut Option<RelayTask>,
    ) -> Step {
        let request = match parse_connect_request(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Channel {} rejected request: {}", self.id, e);
                self.fail().await;
                return Step::Stop;
            }
        };

        let stream = match open_target(&request.address, &self.settings).await {
            Ok(stream) => stream,
            Err(e) => {
                info!("Channel {} connect failed: {}", self.id, e);
                self.fail().await;
                return Step::Stop;
            }
        };
        info!("Channel {} connected to {}", self.id, request.address);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Channel {} failed to set TCP_NODELAY: {}", self.id, e);
        }

        if let Err(e) = self.writer.send_payload(&CONNECT_SUCCESS_REPLY).await {
            debug!("Channel {} failed to send CONNECT reply: {}", self.id, e);
            return Step::Stop;
        }

        let (read_half, write_half) = stream.into_split();
        self.target = Some(write_half);
        self.transition(ChannelState::Relaying);
        let (stop_tx, stop_rx) = oneshot::channel();
        *relay = Some(RelayTask {
            handle: tokio::spawn(relay_from_target(
                read_half,
                self.writer.clone(),
                self.settings.clone(),
                stop_rx,
            )),
            _stop: stop_tx,
        });
        Step::Continue
    }

    async fn forward(&mut self, payload: &[u8]) -> Step {
        let Some(target) = self.target.as_mut() else {
            return Step::Stop;
        };
        match target.write_all(payload).await {
            Ok(()) => Step::Continue,
            Err(e) => {
                debug!("Channel {} target write error: {}", self.id, e);
                self.fail().await;
                Step::Stop
            }
        }
    }

    /// Report failure to the peer and enter `Closed`
    async fn fail(&mut self) {
        if let Err(e) = self.writer.send_close().await {
            debug!("Channel {} failed to send close: {}", self.id, e);
        }
        self.transition(ChannelState::Closed);
    }

    async fn close_target(&mut self) {
        if let Some(mut target) = self.target.take() {
            if let Err(e) = target.shutdown().await {
                debug!("Channel {} target shutdown error: {}", self.id, e);
            }
        }
    }
}

async fn wait_relay(relay: &mut Option<RelayTask>) -> RelayEnd {
    match relay.as_mut() {
        Some(task) => (&mut task.handle).await.unwrap_or(RelayEnd::Panicked),
        None => std::future::pending().await,
    }
}

/// Open the destination session within the connect timeout
async fn open_target(address: &Address, settings: &ChannelSettings) -> Result<TcpStream, TunnelError> {
    let limit = settings.connect_timeout;
    let result = match address {
        Address::Ipv4(ip, port) => {
            tokio::time::timeout(limit, TcpStream::connect(SocketAddr::from((*ip, *port)))).await
        }
        Address::Domain(host, port) => {
            tokio::time::timeout(limit, TcpStream::connect((host.as_str(), *port))).await
        }
        Address::Unsupported(atyp) => return Err(ProxyError::Unresolvable(*atyp).into()),
    };

    match result {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TunnelError::ConnectFailed {
            addr: address.to_string(),
            source,
        }),
        Err(_) => Err(TunnelError::ConnectTimeout(address.to_string())),
    }
}
