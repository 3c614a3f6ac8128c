//! Server-pushed value streams.
//!
//! A [`StreamManager`] owns the stream connection and a background thread
//! that reads `StreamUpdate` frames from it. Each update overwrites the cached
//! value (or error) of its stream, wakes waiters and runs callbacks.
//!
//! # Locking
//!
//! The registry sits behind one reentrant lock shared by the reader and the
//! public API, so callbacks may call back into the manager. Callbacks are
//! cloned out of the registry before they run; no `RefCell` borrow is held
//! while user code executes. Per-stream conditions are always taken after the
//! registry lock, never before.
//!
//! # Freezing
//!
//! [`StreamManager::freeze`] makes the reader stop applying updates at the
//! next frame boundary. It keeps draining the connection and remembers only
//! the newest frame, which [`StreamManager::thaw`] applies before returning.
//! Both calls spin until the reader acknowledges.

mod condition;
mod event;
mod handle;
mod reader;
mod registry;

use std::cell::RefCell;
use std::collections::hash_map;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::ReentrantMutex;
use tracing::{debug, info, trace, warn};

use crate::client::RpcClient;
use crate::error::{Error, Result};
use crate::framer::DEFAULT_MAX_MESSAGE_SIZE;
use crate::krpc::KrpcService;
use crate::schema::{self, ProcedureCall};
use crate::transport::{Transport, TransportCloser};

pub use condition::{ConditionGuard, UpdateCondition};
pub use event::Event;
pub use handle::StreamHandle;
pub use registry::{CallbackTag, StreamCallback, StreamState, StreamValue, UpdateCallback};

use reader::Reader;
use registry::{Entry, Registry};

/// What [`StreamHandle::value`] does before the first update has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValuePolicy {
    /// Fail with [`Error::Stream`].
    #[default]
    Error,
    /// Start the stream and wait up to the given time for its first value.
    StartAndWait(Duration),
}

/// Configuration for a [`StreamManager`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How long the reader blocks on the connection before checking its
    /// stop and freeze flags.
    pub poll_interval: Duration,

    /// Largest update frame accepted.
    pub max_message_size: usize,

    pub value_policy: ValuePolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            value_policy: ValuePolicy::Error,
        }
    }
}

impl StreamConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_value_policy(mut self, policy: ValuePolicy) -> Self {
        self.value_policy = policy;
        self
    }
}

/// State shared between the manager, its handles and the reader thread.
pub(crate) struct Shared {
    rpc: Arc<RpcClient>,
    registry: ReentrantMutex<RefCell<Registry>>,
    update: UpdateCondition<()>,
    stop: AtomicBool,
    should_freeze: AtomicBool,
    frozen: AtomicBool,
    running: AtomicBool,
    reader_thread: OnceLock<ThreadId>,
    policy: ValuePolicy,
}

impl Shared {
    /// Run `f` on the entry for `id`, if there is one.
    ///
    /// `f` must not call back into the manager.
    fn with_entry<R>(&self, id: u64, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let guard = self.registry.lock();
        let mut registry = guard.borrow_mut();
        registry.entries.get_mut(&id).map(f)
    }

    fn on_reader_thread(&self) -> bool {
        self.reader_thread.get() == Some(&thread::current().id())
    }

    /// Apply one batch of updates.
    fn apply(&self, update: schema::StreamUpdate) {
        let guard = self.registry.lock();
        let mut applied = 0usize;

        for result in update.results {
            let id = result.id;
            let value = match result.result {
                Some(schema::ProcedureResult {
                    error: Some(error), ..
                }) => StreamValue::Error(self.rpc.build_error(&error)),
                Some(result) => StreamValue::Value(result.value),
                None => continue,
            };

            let callbacks: Vec<StreamCallback> = {
                let mut registry = guard.borrow_mut();
                let Some(entry) = registry.entries.get_mut(&id) else {
                    trace!(stream_id = id, "update for unknown stream ignored");
                    continue;
                };
                entry.state = StreamState::Live;
                let cached = value.clone();
                entry.slot.update(move |slot| *slot = cached);
                entry.callbacks.values().cloned().collect()
            };
            applied += 1;

            for callback in &callbacks {
                match &value {
                    StreamValue::Value(bytes) => callback(Ok(bytes)),
                    StreamValue::Error(e) => callback(Err(e)),
                    StreamValue::Pending | StreamValue::Removed => {}
                }
            }
        }

        if applied > 0 {
            self.update.update(|_| ());
            let callbacks: Vec<UpdateCallback> =
                guard.borrow().callbacks.values().cloned().collect();
            for callback in &callbacks {
                callback();
            }
        }
    }

    fn freeze(&self) -> Result<()> {
        if self.on_reader_thread() {
            return Err(Error::Stream(
                "cannot freeze from the stream reader thread".into(),
            ));
        }
        self.should_freeze.store(true, Ordering::SeqCst);
        while !self.frozen.load(Ordering::SeqCst) {
            if !self.running.load(Ordering::SeqCst) {
                self.should_freeze.store(false, Ordering::SeqCst);
                return Err(not_running());
            }
            std::hint::spin_loop();
            thread::yield_now();
        }
        Ok(())
    }

    fn thaw(&self) -> Result<()> {
        if self.on_reader_thread() {
            return Err(Error::Stream(
                "cannot thaw from the stream reader thread".into(),
            ));
        }
        self.should_freeze.store(false, Ordering::SeqCst);
        while self.frozen.load(Ordering::SeqCst) {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            std::hint::spin_loop();
            thread::yield_now();
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(not_running());
        }
        Ok(())
    }
}

fn not_running() -> Error {
    Error::Stream("stream reader is not running".into())
}

/// Registry of streams fed by a background reader thread.
pub struct StreamManager {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    closer: Option<TransportCloser>,
}

impl StreamManager {
    /// Take ownership of an already handshaken stream connection and start
    /// the reader thread. Stream procedures are issued through `rpc`.
    pub fn new(
        rpc: Arc<RpcClient>,
        transport: Box<dyn Transport>,
        config: StreamConfig,
    ) -> Result<Self> {
        let closer = transport.closer();
        let shared = Arc::new(Shared {
            rpc,
            registry: ReentrantMutex::new(RefCell::new(Registry::default())),
            update: UpdateCondition::new(()),
            stop: AtomicBool::new(false),
            should_freeze: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            running: AtomicBool::new(true),
            reader_thread: OnceLock::new(),
            policy: config.value_policy,
        });

        let reader = Reader::new(
            Arc::clone(&shared),
            transport,
            config.poll_interval,
            config.max_message_size,
        );
        let handle = thread::Builder::new()
            .name("krpc-stream-reader".into())
            .spawn(move || reader.run())
            .map_err(|e| Error::Stream(format!("failed to start stream reader: {e}")))?;

        Ok(Self {
            shared,
            reader: Some(handle),
            closer,
        })
    }

    /// Register `call` as a stream.
    ///
    /// The server hands out one id per distinct call, so adding the same call
    /// twice returns handles to the same entry.
    pub fn add_stream(&self, call: ProcedureCall) -> Result<StreamHandle> {
        let path = call.path();
        let stream = KrpcService::new(&self.shared.rpc).add_stream(&call, false)?;
        if stream.id == 0 {
            return Err(Error::Stream(format!("server returned no stream id for {path}")));
        }

        let guard = self.shared.registry.lock();
        let mut registry = guard.borrow_mut();
        match registry.entries.entry(stream.id) {
            hash_map::Entry::Occupied(_) => {
                debug!(stream_id = stream.id, procedure = %path, "reusing existing stream")
            }
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Entry::new(call));
                info!(stream_id = stream.id, procedure = %path, "stream added");
            }
        }
        Ok(StreamHandle::new(stream.id, &self.shared))
    }

    /// Create an event that occurs whenever `call`, which must return a bool,
    /// evaluates to `true`.
    pub fn add_event(&self, call: ProcedureCall) -> Result<Event> {
        let event = KrpcService::new(&self.shared.rpc).add_event(&call)?;
        self.register_event(&event, call)
    }

    /// Track an event returned by a procedure. `origin` is the call that
    /// produced it and is reported by the event stream's
    /// [`call`](StreamHandle::call).
    pub fn register_event(&self, event: &schema::Event, origin: ProcedureCall) -> Result<Event> {
        let id = match event.stream {
            Some(schema::Stream { id }) if id != 0 => id,
            _ => {
                return Err(Error::Stream(format!(
                    "server returned no event stream for {}",
                    origin.path()
                )));
            }
        };
        let path = origin.path();
        let guard = self.shared.registry.lock();
        guard
            .borrow_mut()
            .entries
            .entry(id)
            .or_insert_with(|| Entry::new(origin));
        info!(stream_id = id, procedure = %path, "event added");
        Ok(Event::new(StreamHandle::new(id, &self.shared)))
    }

    /// A handle for a stream that is still registered.
    pub fn get_stream(&self, id: u64) -> Option<StreamHandle> {
        self.shared
            .with_entry(id, |_| ())
            .map(|()| StreamHandle::new(id, &self.shared))
    }

    pub fn len(&self) -> usize {
        self.shared.registry.lock().borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `callback` after every batch of updates.
    pub fn add_update_callback<F>(&self, callback: F) -> CallbackTag
    where
        F: Fn() + Send + Sync + 'static,
    {
        let guard = self.shared.registry.lock();
        let mut registry = guard.borrow_mut();
        let tag = registry.next_tag();
        registry.callbacks.insert(tag, Arc::new(callback));
        tag
    }

    pub fn remove_update_callback(&self, tag: CallbackTag) -> bool {
        let guard = self.shared.registry.lock();
        let removed = guard.borrow_mut().callbacks.remove(&tag).is_some();
        removed
    }

    /// Signalled after every applied batch of updates.
    pub fn update_condition(&self) -> &UpdateCondition<()> {
        &self.shared.update
    }

    /// Block until the next batch of updates has been applied, or the reader
    /// stops. Returns `false` on timeout.
    pub fn wait_for_update(&self, timeout: Option<Duration>) -> bool {
        self.shared.update.acquire().wait(timeout)
    }

    /// Stop applying updates until [`thaw`](Self::thaw).
    ///
    /// Returns once the reader has paused, so values read afterwards form a
    /// consistent snapshot.
    pub fn freeze(&self) -> Result<()> {
        self.shared.freeze()
    }

    /// Resume applying updates. The newest update received while frozen is
    /// applied before this returns.
    pub fn thaw(&self) -> Result<()> {
        self.shared.thaw()
    }

    /// Freeze until the returned guard is dropped.
    pub fn frozen(&self) -> Result<FrozenGuard<'_>> {
        self.freeze()?;
        Ok(FrozenGuard { manager: self })
    }

    pub fn is_frozen(&self) -> bool {
        self.shared.frozen.load(Ordering::SeqCst)
    }

    /// Whether the reader thread is still consuming the stream connection.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop the reader, close the stream connection and drop every entry.
    ///
    /// Handles report [`StreamState::Removed`] afterwards.
    pub fn shutdown(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.should_freeze.store(false, Ordering::SeqCst);
        if let Some(closer) = self.closer.take() {
            closer();
        }
        if self.shared.on_reader_thread() {
            warn!("stream manager dropped on its reader thread; not joining");
        } else if reader.join().is_err() {
            warn!("stream reader panicked");
        }

        let guard = self.shared.registry.lock();
        guard.borrow_mut().clear();
        debug!("stream manager shut down");
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("streams", &self.len())
            .field("running", &self.is_running())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// Keeps stream updates frozen while alive.
#[must_use = "updates thaw as soon as the guard is dropped"]
pub struct FrozenGuard<'a> {
    manager: &'a StreamManager,
}

impl Drop for FrozenGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.thaw() {
            debug!(error = %e, "thaw on guard drop failed");
        }
    }
}
