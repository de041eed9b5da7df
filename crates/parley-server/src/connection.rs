//! One accepted client socket and its framing/login state.
//!
//! All I/O goes through `&self` readiness calls on the tokio stream so the
//! event loop can hold readiness futures for every connection at once and
//! still reach any connection to write to it.

use crate::handshake::PendingChallenge;
use futures_util::FutureExt;
use parley_core::{frame_encode, Envelope, FrameDecoder, ParleyError, ParleyResult};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::Span;

/// Loop-assigned connection identifier.
pub type ConnId = u64;

/// Bytes pulled per `try_read`.
const READ_CHUNK: usize = 4096;

/// Reads per readable event before yielding to other connections.
const MAX_READS_PER_CYCLE: usize = 16;

/// Where a connection is in the login handshake.
#[derive(Debug, Default)]
pub enum LoginState {
    #[default]
    Unauthenticated,
    ChallengeSent(PendingChallenge),
    Authenticated,
}

/// What a drain of the socket produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Complete frames, in arrival order.
    pub frames: Vec<Vec<u8>>,
    /// The peer closed its side.
    pub closed: bool,
}

pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    stream: TcpStream,
    decoder: FrameDecoder,
    state: LoginState,
    io_timeout: Duration,
    span: Span,
}

impl Connection {
    pub fn new(
        id: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
        max_frame_len: usize,
        io_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            decoder: FrameDecoder::with_max_len(max_frame_len),
            state: LoginState::Unauthenticated,
            io_timeout,
            span: tracing::info_span!("conn", id, peer = %peer),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn state(&self) -> &LoginState {
        &self.state
    }

    pub fn set_state(&mut self, state: LoginState) {
        self.state = state;
    }

    /// Take the outstanding challenge, leaving the connection unauthenticated.
    pub fn take_challenge(&mut self) -> Option<PendingChallenge> {
        match std::mem::take(&mut self.state) {
            LoginState::ChallengeSent(pending) => Some(pending),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Resolves once the socket has data (or EOF) to read.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Drain what the socket has buffered into complete frames without blocking.
    pub fn read_available(&mut self) -> ParleyResult<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        let mut buf = [0u8; READ_CHUNK];

        for _ in 0..MAX_READS_PER_CYCLE {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    outcome.closed = true;
                    break;
                }
                Ok(n) => outcome.frames.extend(self.decoder.feed_raw(&buf[..n])?),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(outcome)
    }

    /// Whether the last readiness event reported the socket writable.
    pub fn is_writable(&self) -> bool {
        matches!(self.stream.writable().now_or_never(), Some(Ok(())))
    }

    /// Encode and send `envelope`, bounded by the connection's I/O timeout.
    pub async fn send(&self, envelope: &Envelope) -> ParleyResult<()> {
        let frame = frame_encode(envelope)?;
        tokio::time::timeout(self.io_timeout, self.write_all(&frame))
            .await
            .map_err(|_| ParleyError::Timeout)?
            .map_err(|e| ParleyError::PeerUnreachable(e.to_string()))
    }

    /// Send `envelope` only as far as the socket accepts it right now.
    ///
    /// Never waits. If the kernel buffer fills before the frame is out, the
    /// peer is treated as gone: the frame is truncated on the wire and the
    /// connection must be dropped.
    pub fn try_send(&self, envelope: &Envelope) -> ParleyResult<()> {
        let frame = frame_encode(envelope)?;
        let mut data = &frame[..];
        while !data.is_empty() {
            match self.stream.try_write(data) {
                Ok(0) => {
                    return Err(ParleyError::PeerUnreachable("write returned zero".into()));
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(ParleyError::PeerUnreachable(format!(
                        "send buffer full, {} of {} bytes unsent",
                        data.len(),
                        frame.len()
                    )));
                }
                Err(e) => return Err(ParleyError::PeerUnreachable(e.to_string())),
            }
        }
        Ok(())
    }

    async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}
