use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::trace;

use super::{Transport, TransportCloser};
use crate::error::TransportError;

/// A serial line exposed as a character device.
///
/// The device must already be configured (baud rate, raw mode). Serial links
/// carry a single RPC connection; streams are not available over them.
#[derive(Debug)]
pub struct SerialTransport {
    path: PathBuf,
    device: Option<File>,
}

impl SerialTransport {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            device: None,
        }
    }

    fn device(&mut self) -> Result<&mut File, TransportError> {
        self.device.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl Transport for SerialTransport {
    fn target(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&mut self) -> io::Result<()> {
        let device = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.device = Some(device);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let device = self.device()?;
        device.write_all(data)?;
        device.flush()?;
        trace!(len = data.len(), "serial send");
        Ok(())
    }

    fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let device = self.device()?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match device.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Eof),
                Ok(read) => filled += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    // Character devices offer no portable read timeout, so timed reads are
    // refused rather than silently blocking.
    fn partial_receive(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let device = self.device()?;
        if timeout.is_some() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "serial reads cannot time out",
            )));
        }
        let mut buf = vec![0u8; max];
        loop {
            match device.read(&mut buf) {
                Ok(0) if max > 0 => return Err(TransportError::Eof),
                Ok(read) => {
                    buf.truncate(read);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    fn closer(&self) -> Option<TransportCloser> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_fails_to_connect() {
        let mut transport = SerialTransport::new("/nonexistent/ttyKRPC0");
        let err = transport.connect(1, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectFailed { attempts: 2, .. }
        ));
    }

    #[test]
    fn test_reads_from_device_file() {
        let path = std::env::temp_dir().join(format!("krpc-serial-{}", std::process::id()));
        std::fs::write(&path, [0x01, 0x02, 0x03]).unwrap();

        let mut transport = SerialTransport::new(&path);
        transport.open().unwrap();
        assert_eq!(transport.partial_receive(1, None).unwrap(), vec![0x01]);
        assert_eq!(transport.receive(2).unwrap(), vec![0x02, 0x03]);
        assert!(matches!(transport.receive(1), Err(TransportError::Eof)));
        match transport.partial_receive(1, Some(Duration::from_millis(1))) {
            Err(TransportError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::Unsupported),
            other => panic!("unexpected result: {other:?}"),
        }

        transport.close();
        assert!(!transport.is_connected());
        std::fs::remove_file(&path).unwrap();
    }
}
