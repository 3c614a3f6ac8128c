use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;

use super::condition::UpdateCondition;
use crate::error::{Error, RemoteError};
use crate::schema::ProcedureCall;

/// Identifies a registered callback so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackTag(u64);

/// Called with each new value or error of one stream.
pub type StreamCallback =
    Arc<dyn Fn(std::result::Result<&Bytes, &RemoteError>) + Send + Sync>;

/// Called once after every batch of updates.
pub type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle of a stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Known to the server, not yet sending updates.
    Registered,
    /// `StartStream` issued, no update received yet.
    Started,
    /// At least one update received.
    Live,
    /// Removed locally or torn down; terminal.
    Removed,
}

/// The latest thing the server sent for a stream.
#[derive(Debug, Clone, Default)]
pub enum StreamValue {
    /// Nothing received yet.
    #[default]
    Pending,
    Value(Bytes),
    /// The procedure failed; kept until a value replaces it.
    Error(RemoteError),
    Removed,
}

impl StreamValue {
    pub fn is_pending(&self) -> bool {
        matches!(self, StreamValue::Pending)
    }

    pub(crate) fn to_result(&self, id: u64) -> crate::error::Result<Bytes> {
        match self {
            StreamValue::Value(value) => Ok(value.clone()),
            StreamValue::Error(e) => Err(Error::Remote(e.clone())),
            StreamValue::Pending => Err(Error::Stream(format!("stream {id} has no value yet"))),
            StreamValue::Removed => Err(removed(id)),
        }
    }
}

pub(crate) fn removed(id: u64) -> Error {
    Error::Stream(format!("stream {id} has been removed"))
}

pub(crate) struct Entry {
    pub(crate) call: ProcedureCall,
    pub(crate) state: StreamState,
    pub(crate) rate: f32,
    pub(crate) callbacks: BTreeMap<CallbackTag, StreamCallback>,
    pub(crate) slot: Arc<UpdateCondition<StreamValue>>,
}

impl Entry {
    pub(crate) fn new(call: ProcedureCall) -> Self {
        Self {
            call,
            state: StreamState::Registered,
            rate: 0.0,
            callbacks: BTreeMap::new(),
            slot: Arc::new(UpdateCondition::default()),
        }
    }

    /// Mark the slot removed, waking anyone waiting on it.
    pub(crate) fn retire(&self) {
        self.slot.update(|value| *value = StreamValue::Removed);
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) entries: HashMap<u64, Entry, ahash::RandomState>,
    pub(crate) callbacks: BTreeMap<CallbackTag, UpdateCallback>,
    next_tag: u64,
}

impl Registry {
    pub(crate) fn next_tag(&mut self) -> CallbackTag {
        self.next_tag += 1;
        CallbackTag(self.next_tag)
    }

    /// Drop every entry and callback.
    pub(crate) fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.retire();
        }
        self.entries.clear();
        self.callbacks.clear();
    }
}
