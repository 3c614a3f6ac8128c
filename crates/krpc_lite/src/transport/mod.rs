//! Byte-level duplex channels.
//!
//! A [`Transport`] moves raw bytes; framing lives in [`crate::framer`].
//! Implementations exist for TCP sockets, serial character devices and an
//! in-process pipe pair used by tests.

mod memory;
mod serial;
mod tcp;

use std::io;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TransportError;

pub use memory::MemoryTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Closes a transport from another thread, unblocking any pending read.
pub type TransportCloser = Box<dyn Fn() + Send + Sync>;

pub trait Transport: Send {
    /// Human readable description of the remote end, for logs and errors.
    fn target(&self) -> String;

    /// Make a single attempt to open the channel.
    fn open(&mut self) -> io::Result<()>;

    /// Open the channel, retrying up to `retries` more times with a fixed
    /// `backoff` between attempts.
    fn connect(&mut self, retries: u32, backoff: Duration) -> Result<(), TransportError> {
        let attempts = retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open() {
                Ok(()) => {
                    debug!(target_addr = %self.target(), attempt, "transport connected");
                    return Ok(());
                }
                Err(source) if attempt >= attempts => {
                    return Err(TransportError::ConnectFailed {
                        target: self.target(),
                        attempts,
                        source,
                    });
                }
                Err(e) => {
                    warn!(target_addr = %self.target(), attempt, error = %e, "connect failed, retrying");
                    thread::sleep(backoff);
                }
            }
        }
    }

    /// Write all of `data`.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Block until exactly `n` bytes have been read.
    ///
    /// Fails with [`TransportError::Eof`] if the peer closes first.
    fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;

    /// Read between 1 and `max` bytes, returning as soon as any are available.
    ///
    /// With a timeout, an empty buffer means nothing arrived in time. Without
    /// one, the call blocks until data or end of stream. Channels that cannot
    /// time out a read fail with an [`io::ErrorKind::Unsupported`] error when
    /// given a timeout.
    fn partial_receive(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError>;

    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// A handle that closes this channel from another thread, if the
    /// underlying channel supports it.
    fn closer(&self) -> Option<TransportCloser>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn target(&self) -> String {
        (**self).target()
    }

    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn connect(&mut self, retries: u32, backoff: Duration) -> Result<(), TransportError> {
        (**self).connect(retries, backoff)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(data)
    }

    fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        (**self).receive(n)
    }

    fn partial_receive(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).partial_receive(max, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn closer(&self) -> Option<TransportCloser> {
        (**self).closer()
    }
}

/// Map the read errors that mean "no data yet" to an empty result.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
