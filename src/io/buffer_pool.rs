//! Lock-free buffer pool for UDP payloads
//!
//! The UDP session read loop copies every delivered payload into a buffer
//! handed to the subscriber. At high packet rates a fresh allocation per
//! packet dominates the profile, so buffers come from a lock-free free-list
//! and return to it when the subscriber drops them.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default buffer size: the maximum UDP payload
pub const DEFAULT_PACKET_BUFFER_SIZE: usize = 65535;

/// Default free-list capacity
const DEFAULT_POOL_CAPACITY: usize = 512;

/// A free-list of byte buffers shared between the session read loop and its
/// subscribers.
#[derive(Debug)]
pub struct PacketBufferPool {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl PacketBufferPool {
    /// Create a pool holding up to `capacity` buffers of `buffer_size` bytes
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity),
            buffer_size,
        }
    }

    /// Pool with default capacity and maximum-datagram buffers
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_PACKET_BUFFER_SIZE)
    }

    /// Take a buffer holding a copy of `payload`.
    ///
    /// Reuses a pooled buffer when one is free, allocating otherwise. The
    /// returned [`PacketBuf`] releases itself back to the pool on drop.
    #[must_use]
    pub fn copy_from(self: &Arc<Self>, payload: &[u8]) -> PacketBuf {
        let mut buf = self.free.pop().unwrap_or_else(|| {
            Vec::with_capacity(self.buffer_size.max(payload.len()))
        });
        buf.clear();
        buf.extend_from_slice(payload);
        PacketBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently parked in the free-list
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        // Full free-list just drops the buffer.
        let _ = self.free.push(buf);
    }
}

/// A payload buffer borrowed from a [`PacketBufferPool`].
///
/// Dereferences to the payload bytes; returns to the pool on drop.
#[derive(Debug)]
pub struct PacketBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<PacketBufferPool>,
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Deref for PacketBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PacketBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}
