use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Transport, TransportCloser};
use crate::error::TransportError;

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One direction of an in-process channel.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.buf.extend(data);
        self.readable.notify_all();
        Ok(())
    }

    /// Take up to `max` bytes, waiting until `deadline` for the first one.
    fn read(&self, max: usize, deadline: Option<Instant>) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        while state.buf.is_empty() {
            if state.closed {
                return Err(TransportError::Eof);
            }
            match deadline {
                Some(deadline) => {
                    if self.readable.wait_until(&mut state, deadline).timed_out()
                        && state.buf.is_empty()
                    {
                        return if state.closed {
                            Err(TransportError::Eof)
                        } else {
                            Ok(Vec::new())
                        };
                    }
                }
                None => self.readable.wait(&mut state),
            }
        }
        let n = max.min(state.buf.len());
        Ok(state.buf.drain(..n).collect())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().buf.len()
    }
}

/// One end of an in-process duplex channel.
///
/// Created in connected pairs; whatever one end sends the other receives.
/// Closing either end ends both directions.
pub struct MemoryTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    connected: bool,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let forward = Arc::new(Pipe::default());
        let backward = Arc::new(Pipe::default());
        let a = MemoryTransport {
            incoming: Arc::clone(&backward),
            outgoing: Arc::clone(&forward),
            connected: true,
        };
        let b = MemoryTransport {
            incoming: forward,
            outgoing: backward,
            connected: true,
        };
        (a, b)
    }

    /// Bytes sent by this end that the peer has not read yet.
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }
}

impl Transport for MemoryTransport {
    fn target(&self) -> String {
        "memory".to_string()
    }

    fn open(&mut self) -> io::Result<()> {
        if self.incoming.state.lock().closed {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory transport closed",
            ));
        }
        self.connected = true;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.outgoing.write(data)
    }

    fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut buf = Vec::with_capacity(n);
        while buf.len() < n {
            let chunk = self.incoming.read(n - buf.len(), None)?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    fn partial_receive(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.incoming.read(max, timeout.map(|t| Instant::now() + t))
    }

    fn close(&mut self) {
        self.connected = false;
        self.incoming.close();
        self.outgoing.close();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn closer(&self) -> Option<TransportCloser> {
        let incoming = Arc::clone(&self.incoming);
        let outgoing = Arc::clone(&self.outgoing);
        Some(Box::new(move || {
            incoming.close();
            outgoing.close();
        }))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
