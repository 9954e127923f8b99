//! Length-framed channel between a pool endpoint and a worker endpoint
//!
//! Every message is one frame:
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────────────┐
//! │ length (u32, BE)     │ body (length bytes)               │
//! └──────────────────────┴───────────────────────────────────┘
//! ```
//!
//! The body is a JSON [`TaskRecord`](crate::task::TaskRecord), or JSON
//! `null` for an unstack request. Both directions use the same format and
//! each direction has a single writer and a single reader, so frames are
//! never reordered.
//!
//! Neither side ever waits on the other. Outgoing frames that the transport
//! cannot take yet stay in the endpoint's outbox until a later
//! [`Channel::flush`]; incoming bytes collect in an inbox until a whole
//! frame is available.

mod transport;

#[cfg(unix)]
pub use transport::SocketTransport;
pub use transport::{MemoryPipe, Transport, TransportKind};

use std::io;

use tracing::{debug, error, trace, warn};

use crate::task::{Task, TaskRecord};

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Largest frame body either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Transport-level errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Read or write failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Frame body could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Frame length exceeds [`MAX_FRAME_LEN`]
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Peer has gone away or the endpoint is unusable
    #[error("channel closed")]
    Closed,
}

/// Message carried by one frame
#[derive(Debug)]
pub enum Message {
    /// A task handed over to, or back from, a worker
    Task(Task),
    /// Ask the worker to return its front queued task unexecuted
    Unstack,
}

impl Message {
    /// Serialize the frame body
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::Task(task) => encode_body(Some(task)),
            Self::Unstack => encode_body(None),
        }
    }

    /// Parse a frame body
    pub fn decode(body: &[u8]) -> Result<Self, TransportError> {
        let record: Option<TaskRecord> = serde_json::from_slice(body)?;
        Ok(match record {
            Some(record) => Self::Task(record.into_task()),
            None => Self::Unstack,
        })
    }
}

/// Frame body for a task, or for an unstack request when `task` is `None`
fn encode_body(task: Option<&Task>) -> Result<Vec<u8>, TransportError> {
    let record: Option<TaskRecord> = task.map(Task::to_record);
    Ok(serde_json::to_vec(&record)?)
}

/// Prefix a body with its big-endian length
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Read the body length from a frame header
pub fn decode_header(header: [u8; HEADER_LEN]) -> Result<usize, TransportError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

/// One endpoint of a framed channel
pub struct Channel {
    transport: Box<dyn Transport>,
    outbox: Vec<u8>,
    inbox: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl Channel {
    const READ_CHUNK: usize = 16 * 1024;

    /// Wrap a transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            outbox: Vec::new(),
            inbox: Vec::new(),
            eof: false,
            closed: false,
        }
    }

    /// Create a connected pair of endpoints over the given transport
    pub fn pair(kind: TransportKind) -> Result<(Self, Self), TransportError> {
        let (a, b) = kind.pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Whether the peer closed or the stream became unusable
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes accepted by [`Channel::send`] but not yet written
    pub fn pending_output(&self) -> usize {
        self.outbox.len()
    }

    /// Queue one message as a single frame and write as much as possible
    ///
    /// Never blocks. Whatever the transport cannot take now is written by
    /// later calls to [`Channel::flush`].
    pub fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let body = message.encode()?;
        self.send_body(&body)
    }

    /// Send a task without giving up ownership
    pub fn send_task(&mut self, task: &Task) -> Result<(), TransportError> {
        let body = encode_body(Some(task))?;
        self.send_body(&body)
    }

    /// Send an unstack request
    pub fn send_unstack(&mut self) -> Result<(), TransportError> {
        self.send(&Message::Unstack)
    }

    fn send_body(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let frame = encode_frame(body)?;
        self.outbox.extend_from_slice(&frame);
        self.flush().map_err(|e| {
            error!(error = %e, frame_len = frame.len(), "Failed to write frame, message dropped");
            e
        })
    }

    /// Write queued output until it is gone or the transport is full
    ///
    /// Short writes resubmit the remainder. A closed peer discards the
    /// outbox and closes this endpoint.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        if self.closed {
            self.outbox.clear();
            return Err(TransportError::Closed);
        }

        let mut written = 0;
        let result = loop {
            if written == self.outbox.len() {
                break Ok(());
            }
            match self.transport.write(&self.outbox[written..]) {
                Ok(0) => {
                    break Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted zero bytes",
                    )));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(written, pending = self.outbox.len() - written, "Transport full, output deferred");
                    break Ok(());
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        self.closed = true;
                    }
                    break Err(TransportError::Io(e));
                }
            }
        };

        self.outbox.drain(..written);
        if self.closed {
            self.outbox.clear();
        }
        result
    }

    /// Receive the next message without blocking
    ///
    /// Returns `None` when no whole frame is available yet. Peer closure
    /// and transport failures are also reported as `None`; failures are
    /// logged. Frames whose body cannot be decoded are logged and skipped.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.next_frame() {
                Ok(Some(body)) => match Message::decode(&body) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        error!(error = %e, frame_len = body.len(), "Failed to decode frame, message dropped");
                    }
                },
                Ok(None) => return None,
                Err(e) => {
                    error!(error = %e, "Failed to read frame, channel closed");
                    // The stream position is unknown after a failed read
                    self.close_inbound();
                    return None;
                }
            }
        }
    }

    /// Pop one complete frame body from the inbox, reading more if needed
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(body) = self.take_frame()? {
            return Ok(Some(body));
        }
        if self.eof {
            return Ok(None);
        }

        if self.fill()? {
            self.eof = true;
        }
        if let Some(body) = self.take_frame()? {
            return Ok(Some(body));
        }

        if self.eof {
            if self.inbox.is_empty() {
                debug!("Channel peer closed");
            } else {
                warn!(
                    buffered = self.inbox.len(),
                    "Channel peer closed mid-frame, partial frame discarded"
                );
            }
            self.close_inbound();
        }
        Ok(None)
    }

    /// Split the first frame off the inbox if it is complete
    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(header) = self.inbox.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let mut prefix = [0u8; HEADER_LEN];
        prefix.copy_from_slice(header);
        let len = decode_header(prefix)?;

        if self.inbox.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let body = self.inbox[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.inbox.drain(..HEADER_LEN + len);
        Ok(Some(body))
    }

    /// Read everything currently available; `true` once the peer closed
    fn fill(&mut self) -> Result<bool, TransportError> {
        let mut chunk = [0u8; Self::READ_CHUNK];
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn close_inbound(&mut self) {
        self.eof = true;
        self.closed = true;
        self.inbox.clear();
        self.outbox.clear();
    }
}
