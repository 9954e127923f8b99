//! Byte transports underneath the framed channel

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Non-blocking byte stream connecting one pool/worker endpoint pair
///
/// Neither reads nor writes ever wait on the peer. A read with nothing
/// available and a write into a full buffer fail with `WouldBlock`. A read
/// returning `Ok(0)` means the peer closed.
pub trait Transport: Read + Write + Send {}

/// Transport selection for new workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Unix domain socket pair
    #[cfg(unix)]
    SocketPair,
    /// In-process byte pipe
    Memory,
}

impl Default for TransportKind {
    #[cfg(unix)]
    fn default() -> Self {
        Self::SocketPair
    }

    #[cfg(not(unix))]
    fn default() -> Self {
        Self::Memory
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(unix)]
            "socket" | "socket_pair" | "socketpair" => Ok(Self::SocketPair),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            Self::SocketPair => write!(f, "socket_pair"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl TransportKind {
    /// Create a connected pair of transports
    pub fn pair(&self) -> io::Result<(Box<dyn Transport>, Box<dyn Transport>)> {
        match self {
            #[cfg(unix)]
            Self::SocketPair => {
                let (a, b) = SocketTransport::pair()?;
                Ok((Box::new(a), Box::new(b)))
            }
            Self::Memory => {
                let (a, b) = MemoryPipe::pair();
                Ok((Box::new(a), Box::new(b)))
            }
        }
    }
}

/// Unix domain socket endpoint in non-blocking mode
#[cfg(unix)]
pub struct SocketTransport {
    stream: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl SocketTransport {
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    fn new(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

#[cfg(unix)]
impl Read for SocketTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

#[cfg(unix)]
impl Write for SocketTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(unix)]
impl Transport for SocketTransport {}

/// One direction of a memory pipe
#[derive(Default)]
struct PipeBuffer {
    bytes: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
}

impl PipeBuffer {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-process byte pipe endpoint
///
/// Each endpoint owns the write half of one buffer and the read half of the
/// other. Dropping an endpoint closes both directions: the peer reads what
/// is left and then sees end of stream, and its writes fail with
/// `BrokenPipe`. Buffers are unbounded unless a capacity is set.
pub struct MemoryPipe {
    inbound: Arc<PipeBuffer>,
    outbound: Arc<PipeBuffer>,
    max_write: Option<usize>,
    capacity: Option<usize>,
}

impl MemoryPipe {
    /// Create a connected pair of endpoints
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(PipeBuffer::default());
        let b_to_a = Arc::new(PipeBuffer::default());

        let a = Self {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            max_write: None,
            capacity: None,
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            max_write: None,
            capacity: None,
        };
        (a, b)
    }

    /// Cap the number of bytes accepted per `write` call
    ///
    /// Used to exercise short-write handling.
    pub fn with_max_write(mut self, max: usize) -> Self {
        self.max_write = Some(max.max(1));
        self
    }

    /// Bound the bytes this endpoint may have in flight to its peer
    ///
    /// Writes into a full buffer fail with `WouldBlock`, like a socket
    /// whose send buffer is full.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }
}

impl Read for MemoryPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut bytes = self.inbound.bytes.lock();
        if bytes.is_empty() {
            if self.inbound.is_closed() {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(bytes.len());
        for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.outbound.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory pipe peer closed",
            ));
        }

        let mut bytes = self.outbound.bytes.lock();
        let room = match self.capacity {
            Some(capacity) => capacity.saturating_sub(bytes.len()),
            None => usize::MAX,
        };
        if room == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(room).min(self.max_write.unwrap_or(usize::MAX));
        bytes.extend(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryPipe {}

impl Drop for MemoryPipe {
    fn drop(&mut self) {
        self.outbound.close();
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn would_block<T: std::fmt::Debug>(result: io::Result<T>) -> bool {
        matches!(result, Err(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    #[test]
    fn test_memory_pipe_transfers_bytes() {
        let (mut a, mut b) = MemoryPipe::pair();
        let mut buf = [0u8; 8];
        assert!(would_block(b.read(&mut buf)));

        a.write_all(b"abc").unwrap();
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert!(would_block(b.read(&mut buf)));
    }

    #[test]
    fn test_memory_pipe_short_writes() {
        let (a, _b) = MemoryPipe::pair();
        let mut a = a.with_max_write(2);
        assert_eq!(a.write(b"hello").unwrap(), 2);
    }

    #[test]
    fn test_memory_pipe_capacity() {
        let (a, mut b) = MemoryPipe::pair();
        let mut a = a.with_capacity(4);
        assert_eq!(a.write(b"hello").unwrap(), 4);
        assert!(would_block(a.write(b"o")));

        let mut buf = [0u8; 2];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(a.write(b"o!!").unwrap(), 2);
    }

    #[test]
    fn test_memory_pipe_drop_closes_peer() {
        let (mut a, b) = MemoryPipe::pair();
        a.write_all(b"xy").unwrap();
        drop(a);

        let mut b = b;
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(b.read(&mut buf).unwrap(), 0);

        let err = b.write(b"z").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_transport_never_blocks() {
        let (mut a, mut b) = SocketTransport::pair().unwrap();
        let mut buf = [0u8; 4];
        assert!(would_block(b.read(&mut buf)));

        a.write_all(b"ping").unwrap();
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // Nobody reads from b, so a's send buffer eventually fills
        let chunk = vec![0u8; 64 * 1024];
        let mut filled = false;
        for _ in 0..1024 {
            if would_block(a.write(&chunk)) {
                filled = true;
                break;
            }
        }
        assert!(filled);

        drop(a);
        let mut drained = vec![0u8; 64 * 1024];
        while b.read(&mut drained).unwrap() > 0 {}
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("memory".parse::<TransportKind>().unwrap(), TransportKind::Memory);
        #[cfg(unix)]
        assert_eq!(
            "socket".parse::<TransportKind>().unwrap(),
            TransportKind::SocketPair
        );
        assert!("fifo".parse::<TransportKind>().is_err());
    }
}
