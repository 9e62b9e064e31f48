//! Integration tests for xtunnel
//!
//! Drives a real dispatcher over loopback TCP, acting as the peer:
//! - SOCKS5 handshake replies on the wire
//! - Destination connect failures and successes
//! - Many channels relaying at once
//! - Channel release and id reuse, including under write backpressure
//! - Fatal physical connection errors

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use xtunnel::obfuscation::XorObfuscator;
use xtunnel::proxy::{AUTH_REPLY, CONNECT_SUCCESS_REPLY};
use xtunnel::transport::{
    split, FrameSink, Lease, ObfuscatedReader, ObfuscatedWriter, TransportError,
};
use xtunnel::tunnel::{
    encode_frame, ChannelSettings, Dispatcher, Frame, FrameHeader, FRAME_HEADER_SIZE,
};

const GREETING: [u8; 3] = [0x05, 0x01, 0x00];

/// The far end of the physical connection
struct Peer {
    stream: TcpStream,
    obfs: XorObfuscator,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            obfs: XorObfuscator::default(),
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        let wire = self.obfs.apply_to_vec(bytes);
        self.stream.write_all(&wire).await.unwrap();
    }

    async fn send(&mut self, channel_id: u16, payload: &[u8]) {
        let frame = encode_frame(channel_id, payload).unwrap();
        self.send_raw(&frame).await;
    }

    async fn close(&mut self, channel_id: u16) {
        self.send(channel_id, &[]).await;
    }

    async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(10), self.recv_inner())
            .await
            .expect("timed out waiting for a frame")
    }

    async fn recv_inner(&mut self) -> Frame {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.stream.read_exact(&mut header).await.unwrap();
        self.obfs.apply(&mut header);
        let header = FrameHeader::decode(header);

        let mut payload = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut payload).await.unwrap();
        self.obfs.apply(&mut payload);
        Frame::data(header.channel_id, payload.into())
    }

    /// Greet and CONNECT on `channel_id`, asserting both replies
    async fn open(&mut self, channel_id: u16, request: &[u8]) {
        self.send(channel_id, &GREETING).await;
        let reply = self.recv().await;
        assert_eq!(reply.channel_id, channel_id);
        assert_eq!(&reply.payload[..], &AUTH_REPLY);

        self.send(channel_id, request).await;
        let reply = self.recv().await;
        assert_eq!(reply.channel_id, channel_id);
        assert_eq!(&reply.payload[..], &CONNECT_SUCCESS_REPLY);
    }
}

/// Accept one physical connection and run the dispatcher on it
async fn start_tunnel() -> (SocketAddr, JoinHandle<Result<(), TransportError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        stream.set_nodelay(true).unwrap();
        let (reader, writer) = split(stream, XorObfuscator::default());
        let mut dispatcher = Dispatcher::new(reader, writer, ChannelSettings::default());
        dispatcher.run().await
    });

    (addr, handle)
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    addr
}

/// Destination that writes `X` bytes until the connection breaks
async fn start_chatty_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let chunk = [b'X'; 512];
        while socket.write_all(&chunk).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    addr
}

fn ipv4_request(addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("expected an IPv4 address");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    request
}

fn domain_request(host: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

#[tokio::test]
async fn test_greeting_reply_on_wire() {
    let (addr, _tunnel) = start_tunnel().await;
    let mut peer = Peer::connect(addr).await;

    peer.send(1, &GREETING).await;

    let mut raw = [0u8; 10];
    peer.stream.read_exact(&mut raw).await.unwrap();
    let expected: Vec<u8> = [0x00, 0x01, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00]
        .iter()
        .map(|b| b ^ 0x64)
        .collect();
    assert_eq!(&raw[..], &expected[..]);
}

#[tokio::test]
async fn test_unreachable_destination_closes_channel() {
    let (addr, _tunnel) = start_tunnel().await;
    let mut peer = Peer::connect(addr).await;

    // Bind then drop to get a port nobody listens on.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    peer.send(2, &GREETING).await;
    assert_eq!(&peer.recv().await.payload[..], &AUTH_REPLY);

    peer.send(2, &ipv4_request(closed_addr)).await;
    let reply = peer.recv().await;
    assert_eq!(reply.channel_id, 2);
    assert!(reply.is_close());
}

#[tokio::test]
async fn test_domain_connect_relays_both_ways() {
    let (addr, _tunnel) = start_tunnel().await;
    let echo = start_echo_server().await;
    let mut peer = Peer::connect(addr).await;

    peer.open(3, &domain_request("localhost", echo.port())).await;

    let message = b"hello through the tunnel";
    peer.send(3, message).await;

    let mut echoed = Vec::new();
    while echoed.len() < message.len() {
        let frame = peer.recv().await;
        assert_eq!(frame.channel_id, 3);
        assert!(!frame.is_close());
        echoed.extend_from_slice(&frame.payload);
    }
    assert_eq!(&echoed[..], &message[..]);
}

#[tokio::test]
async fn test_bad_greeting_gets_no_reply() {
    let (addr, _tunnel) = start_tunnel().await;
    let mut peer = Peer::connect(addr).await;

    peer.send(4, &[0x04, 0x01, 0x00]).await;
    peer.send(5, &GREETING).await;

    // Only channel 5 answers.
    let reply = peer.recv().await;
    assert_eq!(reply.channel_id, 5);
    assert_eq!(&reply.payload[..], &AUTH_REPLY);
}

#[tokio::test]
async fn test_many_channels_stay_separate() {
    let (addr, _tunnel) = start_tunnel().await;
    let echo = start_echo_server().await;
    let mut peer = Peer::connect(addr).await;

    let ids: Vec<u16> = (0..32u16).map(|i| i * 2047 + 1).collect();
    let request = ipv4_request(echo);

    for &id in &ids {
        peer.send(id, &GREETING).await;
    }
    for _ in &ids {
        let reply = peer.recv().await;
        assert!(ids.contains(&reply.channel_id));
        assert_eq!(&reply.payload[..], &AUTH_REPLY);
    }

    for &id in &ids {
        peer.send(id, &request).await;
    }
    for _ in &ids {
        let reply = peer.recv().await;
        assert!(ids.contains(&reply.channel_id));
        assert_eq!(&reply.payload[..], &CONNECT_SUCCESS_REPLY);
    }

    let expected: HashMap<u16, Vec<u8>> = ids
        .iter()
        .map(|&id| {
            let body: Vec<u8> = (0..6000u32).map(|i| (i as u8) ^ (id as u8)).collect();
            (id, body)
        })
        .collect();
    for &id in &ids {
        peer.send(id, &expected[&id]).await;
    }

    let mut received: HashMap<u16, Vec<u8>> = HashMap::new();
    let total: usize = expected.values().map(Vec::len).sum();
    let mut seen = 0;
    while seen < total {
        let frame = peer.recv().await;
        assert!(!frame.is_close());
        assert!(frame.payload.len() <= 4096 - FRAME_HEADER_SIZE);
        seen += frame.payload.len();
        received
            .entry(frame.channel_id)
            .or_default()
            .extend_from_slice(&frame.payload);
    }

    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_released_channel_leaks_nothing_into_reuse() {
    let (addr, _tunnel) = start_tunnel().await;
    let chatty = start_chatty_server().await;
    let mut peer = Peer::connect(addr).await;

    peer.open(7, &ipv4_request(chatty)).await;
    let first = peer.recv().await;
    assert_eq!(first.channel_id, 7);
    assert!(first.payload.iter().all(|b| *b == b'X'));

    // Release and greet again in one write.
    let mut burst = encode_frame(7, &[]).unwrap().to_vec();
    burst.extend_from_slice(&encode_frame(7, &GREETING).unwrap());
    peer.send_raw(&burst).await;

    loop {
        let frame = peer.recv().await;
        assert_eq!(frame.channel_id, 7);
        if frame.payload.iter().all(|b| *b == b'X') {
            continue;
        }
        assert_eq!(&frame.payload[..], &AUTH_REPLY);
        break;
    }

    // The new allocation has no destination yet, so nothing may follow.
    let quiet = tokio::time::timeout(Duration::from_millis(500), peer.recv_inner()).await;
    assert!(quiet.is_err(), "stale frame after reallocation: {:?}", quiet);
}

#[tokio::test]
async fn test_close_for_free_channel_is_ignored() {
    let (addr, tunnel) = start_tunnel().await;
    let mut peer = Peer::connect(addr).await;

    peer.close(42).await;
    peer.close(42).await;
    peer.send(42, &GREETING).await;

    let reply = peer.recv().await;
    assert_eq!(reply.channel_id, 42);
    assert_eq!(&reply.payload[..], &AUTH_REPLY);
    assert!(!tunnel.is_finished());
}

#[tokio::test]
async fn test_peer_disconnect_is_fatal() {
    let (addr, tunnel) = start_tunnel().await;
    let peer = Peer::connect(addr).await;
    drop(peer);

    let result = tokio::time::timeout(Duration::from_secs(5), tunnel)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransportError::Closed)));
}

#[tokio::test]
async fn test_truncated_frame_is_fatal() {
    let (addr, tunnel) = start_tunnel().await;
    let mut peer = Peer::connect(addr).await;

    // Header promises 10 bytes, only 3 arrive.
    peer.send_raw(&[0x00, 0x09, 0x00, 0x0a, 0x05, 0x01, 0x00]).await;
    peer.stream.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), tunnel)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransportError::Closed)));
}

/// Destination that waits for one byte, then sends `len` copies of `marker`
async fn start_burst_server(marker: u8, len: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut go = [0u8; 1];
        if socket.read_exact(&mut go).await.is_ok() {
            let _ = socket.write_all(&vec![marker; len]).await;
        }
    });

    addr
}

async fn write_frame<W>(writer: &ObfuscatedWriter<W>, channel_id: u16, payload: &[u8])
where
    W: AsyncWrite + Unpin + Send,
{
    let frame = encode_frame(channel_id, payload).unwrap();
    writer.send(&frame, &Lease::new()).await.unwrap();
}

async fn read_frame<R>(reader: &mut ObfuscatedReader<R>) -> Frame
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await.unwrap();
    let header = FrameHeader::decode(header);
    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await.unwrap();
    Frame::data(header.channel_id, payload.into())
}

#[tokio::test]
async fn test_release_under_backpressure_keeps_frames_whole() {
    const BODY: usize = 8000;
    let obfs = XorObfuscator::default();

    // A tiny pipe makes relay frames stall part way through their write.
    let (local, remote) = duplex(64);
    let (reader, writer) = split(local, obfs);
    let tunnel = tokio::spawn(async move {
        let mut dispatcher = Dispatcher::new(reader, writer, ChannelSettings::default());
        dispatcher.run().await
    });
    let (mut peer_rx, peer_tx) = split(remote, obfs);
    let peer_tx = &*peer_tx;

    for id in [1u16, 2, 3] {
        let target = start_burst_server(id as u8, BODY).await;
        write_frame(peer_tx, id, &GREETING).await;
        assert_eq!(&read_frame(&mut peer_rx).await.payload[..], &AUTH_REPLY);
        write_frame(peer_tx, id, &ipv4_request(target)).await;
        assert_eq!(&read_frame(&mut peer_rx).await.payload[..], &CONNECT_SUCCESS_REPLY);
    }

    // Channel 1 starts first and blocks inside its first frame; 2 and 3 queue
    // behind it.
    write_frame(peer_tx, 1, b"go").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    write_frame(peer_tx, 2, b"go").await;
    write_frame(peer_tx, 3, b"go").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    write_frame(peer_tx, 1, &[]).await;
    write_frame(peer_tx, 4, &GREETING).await;

    let mut received: HashMap<u16, usize> = HashMap::new();
    let mut closed = Vec::new();
    let mut reply_seen = false;
    let collected = tokio::time::timeout(Duration::from_secs(10), async {
        while !(reply_seen && closed.len() == 2) {
            let frame = read_frame(&mut peer_rx).await;
            match frame.channel_id {
                4 => {
                    assert_eq!(&frame.payload[..], &AUTH_REPLY);
                    reply_seen = true;
                }
                id @ 1..=3 => {
                    assert!(
                        !(id == 1 && reply_seen),
                        "released channel wrote after its id was reused"
                    );
                    if frame.is_close() {
                        assert_ne!(id, 1, "released channel sent a close frame");
                        closed.push(id);
                    } else {
                        assert!(frame.payload.iter().all(|b| *b == id as u8));
                        *received.entry(id).or_default() += frame.payload.len();
                    }
                }
                other => panic!("frame for unknown channel {}", other),
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "frames stopped arriving");

    closed.sort_unstable();
    assert_eq!(closed, vec![2, 3]);
    assert_eq!(received.get(&2), Some(&BODY));
    assert_eq!(received.get(&3), Some(&BODY));
    assert!(received.get(&1).copied().unwrap_or(0) < BODY);
    assert!(!tunnel.is_finished());
}
