//! Obfuscated transport over the physical connection

use super::{FrameSink, Lease, TransportError};
use crate::obfuscation::XorObfuscator;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::error;

/// Split a stream into an obfuscated reader and a shared writer
pub fn split<S>(
    stream: S,
    obfuscator: XorObfuscator,
) -> (
    ObfuscatedReader<tokio::io::ReadHalf<S>>,
    Arc<ObfuscatedWriter<tokio::io::WriteHalf<S>>>,
)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        ObfuscatedReader::new(read_half, obfuscator),
        Arc::new(ObfuscatedWriter::new(write_half, obfuscator)),
    )
}

/// Read side of the physical connection
pub struct ObfuscatedReader<R> {
    inner: R,
    obfuscator: XorObfuscator,
}

impl<R: AsyncRead + Unpin> ObfuscatedReader<R> {
    /// Wrap a read half
    pub fn new(inner: R, obfuscator: XorObfuscator) -> Self {
        Self { inner, obfuscator }
    }

    /// Fill `buf` completely and decode it in place
    ///
    /// Fails with `Closed` if the peer closes before `buf` is full.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => {
                self.obfuscator.apply(buf);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

/// Write side of the physical connection
///
/// Shared behind an `Arc`. The first failed write poisons the writer and
/// wakes whoever waits in [`ObfuscatedWriter::failed`]. A frame write that is
/// cancelled after its first byte went out also poisons it, since the stream
/// can no longer be parsed.
pub struct ObfuscatedWriter<W> {
    inner: Mutex<W>,
    obfuscator: XorObfuscator,
    poisoned: AtomicBool,
    failure: std::sync::Mutex<Option<String>>,
    failed: Notify,
}

impl<W> ObfuscatedWriter<W> {
    /// Wrap a write half
    pub fn new(inner: W, obfuscator: XorObfuscator) -> Self {
        Self {
            inner: Mutex::new(inner),
            obfuscator,
            poisoned: AtomicBool::new(false),
            failure: std::sync::Mutex::new(None),
            failed: Notify::new(),
        }
    }

    /// Whether a previous write failed
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Wait until a write fails, returning the failure description
    pub async fn failed(&self) -> String {
        loop {
            if let Some(reason) = self.failure_reason() {
                return reason;
            }
            self.failed.notified().await;
        }
    }

    fn failure_reason(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|guard| guard.clone())
    }

    fn poison(&self, reason: String) {
        error!("Physical connection write failed: {}", reason);
        if let Ok(mut guard) = self.failure.lock() {
            guard.get_or_insert(reason);
        }
        self.poisoned.store(true, Ordering::Release);
        self.failed.notify_one();
    }
}

/// Poisons the writer if dropped while still armed
struct InFlight<'a, W> {
    writer: &'a ObfuscatedWriter<W>,
    armed: bool,
}

impl<W> Drop for InFlight<'_, W> {
    fn drop(&mut self) {
        if self.armed {
            self.writer.poison("frame write cancelled part way".to_string());
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for ObfuscatedWriter<W> {
    async fn send(&self, frame: &[u8], lease: &Lease) -> Result<bool, TransportError> {
        let wire = self.obfuscator.apply_to_vec(frame);

        let mut inner = self.inner.lock().await;
        if lease.is_revoked() {
            return Ok(false);
        }
        if self.is_poisoned() {
            return Err(TransportError::Poisoned(
                self.failure_reason().unwrap_or_default(),
            ));
        }

        let mut in_flight = InFlight {
            writer: self,
            armed: true,
        };
        let result = async {
            inner.write_all(&wire).await?;
            inner.flush().await
        }
        .await;
        in_flight.armed = false;

        if let Err(e) = result {
            self.poison(e.to_string());
            return Err(TransportError::Io(e));
        }
        Ok(true)
    }
}
