use std::time::{Duration, Instant};

use bytes::Bytes;

use super::condition::UpdateCondition;
use super::handle::StreamHandle;
use super::registry::{CallbackTag, StreamValue, removed};
use crate::codec::WireValue;
use crate::error::{Error, Result};

fn occurred(value: &Bytes) -> bool {
    bool::decode(value).unwrap_or(false)
}

/// A server-side event.
///
/// The server reports an occurrence by sending `true` on the event's stream;
/// [`wait`](Self::wait) blocks until the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    stream: StreamHandle,
}

impl Event {
    pub(super) fn new(stream: StreamHandle) -> Self {
        Self { stream }
    }

    /// The underlying stream of bools.
    pub fn stream(&self) -> &StreamHandle {
        &self.stream
    }

    pub fn start(&self) -> Result<()> {
        self.stream.start()
    }

    /// Signalled whenever the event's stream updates.
    pub fn condition(&self) -> Result<std::sync::Arc<UpdateCondition<StreamValue>>> {
        self.stream.condition()
    }

    /// Start the event if needed and block until it next occurs. Returns
    /// `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.stream.shared()?.on_reader_thread() {
            return Err(Error::Stream(
                "cannot wait for an event on the stream reader thread".into(),
            ));
        }
        let slot = self.stream.condition()?;
        let seen = slot.generation();
        self.start()?;

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut guard = slot.acquire();
        loop {
            match guard.value() {
                StreamValue::Removed => return Err(removed(self.stream.id())),
                StreamValue::Value(value) if guard.generation() != seen && occurred(value) => {
                    return Ok(true);
                }
                _ => {}
            }
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if !guard.wait(remaining) {
                return Ok(false);
            }
        }
    }

    /// Call `callback` each time the event occurs.
    pub fn add_callback<F>(&self, callback: F) -> Result<CallbackTag>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.stream.add_callback(move |update| {
            if update.is_ok_and(occurred) {
                callback();
            }
        })
    }

    pub fn remove_callback(&self, tag: CallbackTag) -> bool {
        self.stream.remove_callback(tag)
    }

    /// Remove the event from the server.
    pub fn remove(&self) -> Result<()> {
        self.stream.remove()
    }
}
