use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use tracing::trace;

use super::{Transport, TransportCloser, is_timeout};
use crate::error::TransportError;

/// A TCP connection with Nagle's algorithm disabled.
#[derive(Debug)]
pub struct TcpTransport {
    address: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// A transport for `address` (`host:port`). Nothing is opened until
    /// [`Transport::open`] or [`Transport::connect`].
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl Transport for TcpTransport {
    fn target(&self) -> String {
        self.address.clone()
    }

    fn open(&mut self) -> io::Result<()> {
        let stream = TcpStream::connect(&self.address)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()?;
        trace!(len = data.len(), "tcp send");
        Ok(())
    }

    fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream()?;
        stream.set_read_timeout(None)?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Eof),
                Ok(read) => filled += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn partial_receive(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream()?;
        // A zero read timeout is rejected by the socket API.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        stream.set_read_timeout(timeout)?;
        let mut buf = vec![0u8; max];
        loop {
            match stream.read(&mut buf) {
                Ok(0) if max > 0 => return Err(TransportError::Eof),
                Ok(read) => {
                    buf.truncate(read);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn closer(&self) -> Option<TransportCloser> {
        let clone = self.stream.as_ref()?.try_clone().ok()?;
        Some(Box::new(move || {
            let _ = clone.shutdown(Shutdown::Both);
        }))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
