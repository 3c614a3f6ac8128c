use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::Shared;
use crate::codec::decode_message;
use crate::error::Result;
use crate::framer::{FrameHeader, read_frame_header, read_payload};
use crate::schema;
use crate::transport::Transport;

/// Background loop that owns the stream connection.
pub(super) struct Reader {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
    header: FrameHeader,
    poll_interval: Duration,
}

impl Reader {
    pub(super) fn new(
        shared: Arc<Shared>,
        transport: Box<dyn Transport>,
        poll_interval: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            shared,
            transport,
            header: FrameHeader::new(max_message_size),
            poll_interval,
        }
    }

    pub(super) fn run(mut self) {
        let _ = self.shared.reader_thread.set(thread::current().id());
        debug!(target_addr = %self.transport.target(), "stream reader started");

        match self.read_loop() {
            Ok(()) => debug!("stream reader stopped"),
            Err(e) if self.shared.stop.load(Ordering::SeqCst) => {
                debug!(error = %e, "stream reader stopped")
            }
            Err(e) => warn!(error = %e, "stream connection lost"),
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.frozen.store(false, Ordering::SeqCst);
        // Wake anyone blocked on the batch condition.
        self.shared.update.update(|_| ());
        self.transport.close();
    }

    fn read_loop(&mut self) -> Result<()> {
        while !self.shared.stop.load(Ordering::SeqCst) {
            // Freezing only happens between frames.
            if self.header.is_empty() && self.shared.should_freeze.load(Ordering::SeqCst) {
                self.frozen()?;
                continue;
            }
            if let Some(payload) = self.poll_frame()? {
                self.dispatch(&payload);
            }
        }
        Ok(())
    }

    /// Wait up to one poll interval for a frame.
    fn poll_frame(&mut self) -> Result<Option<Bytes>> {
        let header = read_frame_header(
            &mut *self.transport,
            &mut self.header,
            Some(self.poll_interval),
        )?;
        match header {
            Some(len) => Ok(Some(read_payload(&mut *self.transport, len)?)),
            None => Ok(None),
        }
    }

    /// Keep draining frames without applying them until thawed, then apply
    /// the newest one.
    fn frozen(&mut self) -> Result<()> {
        self.shared.frozen.store(true, Ordering::SeqCst);
        debug!("stream updates frozen");

        let mut latest = None;
        while self.shared.should_freeze.load(Ordering::SeqCst) || !self.header.is_empty() {
            if self.shared.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(payload) = self.poll_frame()? {
                trace!(len = payload.len(), "holding update while frozen");
                latest = Some(payload);
            }
        }

        if let Some(payload) = latest {
            self.dispatch(&payload);
        }
        self.shared.frozen.store(false, Ordering::SeqCst);
        debug!("stream updates thawed");
        Ok(())
    }

    fn dispatch(&self, payload: &[u8]) {
        match decode_message::<schema::StreamUpdate>(payload) {
            Ok(update) => {
                trace!(results = update.results.len(), "stream update");
                self.shared.apply(update);
            }
            Err(e) => warn!(error = %e, len = payload.len(), "skipping malformed stream update"),
        }
    }
}
