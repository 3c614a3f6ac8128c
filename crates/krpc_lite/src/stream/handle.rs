use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::condition::UpdateCondition;
use super::registry::{CallbackTag, Entry, StreamState, StreamValue, removed};
use super::{Shared, ValuePolicy};
use crate::codec::WireValue;
use crate::error::{Error, RemoteError, Result};
use crate::krpc::KrpcService;
use crate::schema::ProcedureCall;

/// A reference to a registered stream.
///
/// Handles are cheap to clone. Every handle for the same server stream id
/// refers to the same local entry, and they compare equal. A handle does not
/// keep the manager alive.
#[derive(Clone)]
pub struct StreamHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl StreamHandle {
    pub(super) fn new(id: u64, shared: &Arc<Shared>) -> Self {
        Self {
            id,
            shared: Arc::downgrade(shared),
        }
    }

    /// The server-assigned stream id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn shared(&self) -> Result<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| Error::Stream("stream manager has shut down".into()))
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut Entry) -> R) -> Result<R> {
        self.shared()?
            .with_entry(self.id, f)
            .ok_or_else(|| removed(self.id))
    }

    /// The per-stream condition. Lock it with
    /// [`acquire`](UpdateCondition::acquire) to read the current value and
    /// wait for the next one without a gap.
    pub fn condition(&self) -> Result<Arc<UpdateCondition<StreamValue>>> {
        self.with_entry(|entry| Arc::clone(&entry.slot))
    }

    /// The call the server evaluates, or for an event returned by a
    /// procedure, the call that produced it.
    pub fn call(&self) -> Result<ProcedureCall> {
        self.with_entry(|entry| entry.call.clone())
    }

    pub fn state(&self) -> StreamState {
        self.with_entry(|entry| entry.state)
            .unwrap_or(StreamState::Removed)
    }

    pub fn started(&self) -> bool {
        matches!(self.state(), StreamState::Started | StreamState::Live)
    }

    /// The rate last requested with [`set_rate`](Self::set_rate); `0` means
    /// unlimited.
    pub fn rate(&self) -> Result<f32> {
        self.with_entry(|entry| entry.rate)
    }

    /// Ask the server to start sending updates. Later calls do nothing.
    pub fn start(&self) -> Result<()> {
        let shared = self.shared()?;
        let first = shared
            .with_entry(self.id, |entry| {
                let first = entry.state == StreamState::Registered;
                if first {
                    entry.state = StreamState::Started;
                }
                first
            })
            .ok_or_else(|| removed(self.id))?;
        if !first {
            return Ok(());
        }

        if let Err(e) = KrpcService::new(&shared.rpc).start_stream(self.id) {
            shared.with_entry(self.id, |entry| {
                if entry.state == StreamState::Started {
                    entry.state = StreamState::Registered;
                }
            });
            return Err(e);
        }
        debug!(stream_id = self.id, "stream started");
        Ok(())
    }

    /// Start the stream and block until its first update arrives.
    pub fn start_and_wait(&self, timeout: Duration) -> Result<()> {
        self.start()?;
        if self.shared()?.on_reader_thread() {
            return Err(Error::Stream(
                "cannot wait for an update on the stream reader thread".into(),
            ));
        }

        let slot = self.condition()?;
        let deadline = Instant::now() + timeout;
        let mut guard = slot.acquire();
        while guard.value().is_pending() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !guard.wait(Some(remaining)) {
                return Err(Error::Stream(format!(
                    "timed out waiting for the first update of stream {}",
                    self.id
                )));
            }
        }
        match guard.value() {
            StreamValue::Removed => Err(removed(self.id)),
            _ => Ok(()),
        }
    }

    /// Limit updates to `rate` per second; `0` removes the limit.
    pub fn set_rate(&self, rate: f32) -> Result<()> {
        let shared = self.shared()?;
        if shared.with_entry(self.id, |_| ()).is_none() {
            return Err(removed(self.id));
        }
        KrpcService::new(&shared.rpc).set_stream_rate(self.id, rate)?;
        shared.with_entry(self.id, |entry| entry.rate = rate);
        Ok(())
    }

    /// The latest encoded value.
    ///
    /// A cached error is returned on every call until a value replaces it.
    /// Before the first update the behavior follows the manager's
    /// [`ValuePolicy`].
    pub fn value(&self) -> Result<Bytes> {
        let shared = self.shared()?;
        let current = self.condition()?.acquire().value().clone();
        match (current, shared.policy) {
            (StreamValue::Pending, ValuePolicy::StartAndWait(timeout)) => {
                self.start_and_wait(timeout)?;
                self.condition()?.acquire().value().to_result(self.id)
            }
            (current, _) => current.to_result(self.id),
        }
    }

    /// The latest value, decoded.
    pub fn get<T: WireValue>(&self) -> Result<T> {
        Ok(T::decode(&self.value()?)?)
    }

    /// Block until the stream next updates. Returns `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.shared()?.on_reader_thread() {
            return Err(Error::Stream(
                "cannot wait for an update on the stream reader thread".into(),
            ));
        }
        let slot = self.condition()?;
        let mut guard = slot.acquire();
        if matches!(guard.value(), StreamValue::Removed) {
            return Err(removed(self.id));
        }
        let updated = guard.wait(timeout);
        if matches!(guard.value(), StreamValue::Removed) {
            return Err(removed(self.id));
        }
        Ok(updated)
    }

    /// Call `callback` with every update of this stream.
    ///
    /// Callbacks run on the reader thread with the manager lock held; they may
    /// call back into the manager.
    pub fn add_callback<F>(&self, callback: F) -> Result<CallbackTag>
    where
        F: Fn(std::result::Result<&Bytes, &RemoteError>) + Send + Sync + 'static,
    {
        let shared = self.shared()?;
        let guard = shared.registry.lock();
        let mut registry = guard.borrow_mut();
        let tag = registry.next_tag();
        let entry = registry
            .entries
            .get_mut(&self.id)
            .ok_or_else(|| removed(self.id))?;
        entry.callbacks.insert(tag, Arc::new(callback));
        Ok(tag)
    }

    pub fn remove_callback(&self, tag: CallbackTag) -> bool {
        self.with_entry(|entry| entry.callbacks.remove(&tag).is_some())
            .unwrap_or(false)
    }

    /// Remove the stream from the server and the local registry.
    ///
    /// Removing an already removed stream is a no-op. Anyone waiting on the
    /// stream wakes and sees it as removed.
    pub fn remove(&self) -> Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let entry = {
            let guard = shared.registry.lock();
            let mut registry = guard.borrow_mut();
            registry.entries.remove(&self.id)
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        entry.retire();
        KrpcService::new(&shared.rpc).remove_stream(self.id)?;
        debug!(stream_id = self.id, "stream removed");
        Ok(())
    }
}

impl PartialEq for StreamHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for StreamHandle {}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
