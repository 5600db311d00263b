use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard};

use mio::Token;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HalfCloseState {
    pub input_shut: bool,
    pub output_shut: bool,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn shutdown(self) -> Shutdown {
        match self {
            Direction::Input => Shutdown::Read,
            Direction::Output => Shutdown::Write,
        }
    }
}

/// What a call to `Endpoint::close` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The socket was already closed, or this direction was already shut down.
    Unchanged,
    /// Only the requested direction was shut down, the other direction remains usable.
    HalfClosed,
    /// Both directions have ended, the socket is closed.
    Closed,
}

/// One side of a proxied connection: either the client's socket or the socket to the remote endpoint.
///
/// The socket is always in non-blocking mode. The reading thread only ever reads from it and shuts down its input,
/// the relay thread only ever writes to it and shuts down its output.
pub struct Endpoint {
    stream: TcpStream,
    token: Token,
    peer_addr: Option<SocketAddr>,
    state: Mutex<HalfCloseState>,
}

impl Endpoint {
    pub fn new(stream: TcpStream, token: Token) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Self {
            stream,
            token,
            peer_addr,
            state: Mutex::new(HalfCloseState::default()),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn state(&self) -> HalfCloseState {
        *self.lock_state()
    }

    /// Reads whatever is available without blocking.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Writes all of `buf`, waiting for the socket to become writable whenever the send buffer is full.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match (&self.stream).write(&buf[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::WriteZero, "failed to write whole chunk"));
                }
                Ok(size) => {
                    written += size;
                    if written < buf.len() {
                        trace!("Partial write of {} bytes to {}, {} bytes left", size, self, buf.len() - written);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    wait_writable(self.raw_fd())?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn close_input(&self) -> CloseOutcome {
        self.close(Direction::Input)
    }

    pub fn close_output(&self) -> CloseOutcome {
        self.close(Direction::Output)
    }

    /// Ends one direction of the socket. If the other direction has already ended, the socket is closed completely.
    pub fn close(&self, direction: Direction) -> CloseOutcome {
        let mut state = self.lock_state();
        if state.closed {
            return CloseOutcome::Unchanged;
        }
        let (this_shut, other_shut) = match direction {
            Direction::Input => (state.input_shut, state.output_shut),
            Direction::Output => (state.output_shut, state.input_shut),
        };
        if other_shut {
            debug!("Closing {}", self);
            // ENOTCONN if the peer has already reset the connection.
            let _ = self.stream.shutdown(Shutdown::Both);
            state.input_shut = true;
            state.output_shut = true;
            state.closed = true;
            CloseOutcome::Closed
        } else if !this_shut {
            debug!("Closing {:?} of {}", direction, self);
            let _ = self.stream.shutdown(direction.shutdown());
            match direction {
                Direction::Input => state.input_shut = true,
                Direction::Output => state.output_shut = true,
            }
            CloseOutcome::HalfClosed
        } else {
            CloseOutcome::Unchanged
        }
    }

    fn lock_state(&self) -> MutexGuard<HalfCloseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{} [{}]", addr, self.token.0),
            None => write!(f, "<unknown peer> [{}]", self.token.0),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("token", &self.token)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

// man 2 poll: blocks until the descriptor is ready for writing or an error condition is reported on it. In the latter
// case, the following write reports the actual error.
fn wait_writable(fd: RawFd) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let result = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if result >= 0 {
            return Ok(());
        }
        let e = io::Error::last_os_error();
        if e.kind() != ErrorKind::Interrupted {
            return Err(e);
        }
    }
}
