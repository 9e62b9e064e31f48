//! Transport layer over the physical connection
//!
//! Provides:
//! - Obfuscated reader (owned by the dispatcher)
//! - Obfuscated, lock-serialized writer shared by every channel
//! - The `FrameSink` seam channels write through

mod obfuscated;

pub use obfuscated::{split, ObfuscatedReader, ObfuscatedWriter};

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Writer failed earlier: {0}")]
    Poisoned(String),
}

/// Permission to write frames under one channel allocation
///
/// Revoked when the channel id is released. Sinks check it while holding
/// their write lock, so once `revoke` returns no frame from the old
/// allocation reaches the wire.
#[derive(Debug, Clone, Default)]
pub struct Lease {
    revoked: Arc<AtomicBool>,
}

impl Lease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// Destination for fully encoded frames
///
/// A single call writes one frame atomically: concurrent callers never
/// interleave bytes on the wire.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one encoded frame (header included) unless `lease` is revoked
    ///
    /// Returns `Ok(false)` when the frame was dropped for a revoked lease.
    async fn send(&self, frame: &[u8], lease: &Lease) -> Result<bool, TransportError>;
}
