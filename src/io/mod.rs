//! I/O utilities: bidirectional copy and the packet buffer pool

mod buffer_pool;
mod copy;

pub use buffer_pool::{PacketBuf, PacketBufferPool, DEFAULT_PACKET_BUFFER_SIZE};
pub use copy::{copy_bidirectional, CopyResult};
