use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use krpc_lite::ClientId;
use krpc_lite::codec::WireValue;
use krpc_lite::schema::{ProcedureCall, ProcedureResult};
use parking_lot::Mutex;

/// A stream registered by one client.
#[derive(Debug)]
struct ServerStream {
    call: ProcedureCall,
    /// Event streams carry a bool and report every `true` result.
    event: bool,
    started: bool,
    rate: f32,
    last_sent: Option<Instant>,
    last_result: Option<ProcedureResult>,
}

impl ServerStream {
    fn is_due(&self, now: Instant) -> bool {
        if !self.started {
            return false;
        }
        match self.last_sent {
            // A period too long for `Duration` is never reached.
            Some(at) if self.rate > 0.0 => Duration::try_from_secs_f32(1.0 / self.rate)
                .is_ok_and(|period| now.duration_since(at) >= period),
            _ => true,
        }
    }
}

/// The streams of one client, keyed by id and by call.
#[derive(Debug, Default)]
pub struct StreamTable {
    ids: HashMap<ProcedureCall, u64, ahash::RandomState>,
    streams: BTreeMap<u64, ServerStream>,
    next_id: u64,
}

impl StreamTable {
    /// Register `call`, returning the existing id when the same call is
    /// already registered.
    pub fn add(&mut self, call: ProcedureCall, start: bool) -> u64 {
        let id = match self.ids.get(&call) {
            Some(id) => *id,
            None => {
                self.next_id += 1;
                let id = self.next_id;
                self.ids.insert(call.clone(), id);
                self.insert(id, call, false);
                id
            }
        };
        if start {
            self.start(id);
        }
        id
    }

    /// Register an event stream for `call`, which must return a bool. Every
    /// event gets its own id.
    pub fn add_event(&mut self, call: ProcedureCall) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.insert(id, call, true);
        id
    }

    fn insert(&mut self, id: u64, call: ProcedureCall, event: bool) {
        self.streams.insert(
            id,
            ServerStream {
                call,
                event,
                started: false,
                rate: 0.0,
                last_sent: None,
                last_result: None,
            },
        );
    }

    pub fn start(&mut self, id: u64) -> bool {
        match self.streams.get_mut(&id) {
            Some(stream) => {
                stream.started = true;
                true
            }
            None => false,
        }
    }

    pub fn set_rate(&mut self, id: u64, rate: f32) -> bool {
        match self.streams.get_mut(&id) {
            Some(stream) => {
                stream.rate = rate;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: u64) -> bool {
        match self.streams.remove(&id) {
            Some(stream) => {
                if self.ids.get(&stream.call) == Some(&id) {
                    self.ids.remove(&stream.call);
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Started streams whose rate allows an update at `now`.
    pub fn due(&self, now: Instant) -> Vec<(u64, ProcedureCall)> {
        self.streams
            .iter()
            .filter(|(_, stream)| stream.is_due(now))
            .map(|(id, stream)| (*id, stream.call.clone()))
            .collect()
    }

    /// Record a fresh evaluation. Returns true when it differs from the last
    /// result sent, in which case it counts as sent at `now`. Event streams
    /// send every `true` result and never a `false` one.
    pub fn record(&mut self, id: u64, result: &ProcedureResult, now: Instant) -> bool {
        let Some(stream) = self.streams.get_mut(&id) else {
            return false;
        };
        if stream.event && result.error.is_none() {
            if !bool::decode(&result.value).unwrap_or(false) {
                return false;
            }
        } else if stream.last_result.as_ref() == Some(result) {
            return false;
        }
        stream.last_result = Some(result.clone());
        stream.last_sent = Some(now);
        true
    }
}

/// Server-side state of one connected client.
pub struct ClientSession {
    id: ClientId,
    name: String,
    streams: Mutex<StreamTable>,
    counters: DashMap<String, i32, ahash::RandomState>,
}

impl ClientSession {
    pub fn new(id: ClientId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            streams: Mutex::new(StreamTable::default()),
            counters: DashMap::default(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn streams(&self) -> parking_lot::MutexGuard<'_, StreamTable> {
        self.streams.lock()
    }

    /// Increment the named counter and return its new value.
    pub fn increment_counter(&self, key: &str) -> i32 {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Connected clients, keyed by identifier.
///
/// A client is present while its RPC connection is open; the stream
/// connection looks it up during its handshake.
#[derive(Debug, Default)]
pub struct ClientMap {
    clients: DashMap<ClientId, Arc<ClientSession>, ahash::RandomState>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. The returned guard removes it again on drop.
    pub fn register(self: &Arc<Self>, session: Arc<ClientSession>) -> ClientGuard {
        let id = session.id();
        self.clients.insert(id, session);
        ClientGuard {
            id,
            map: Arc::clone(self),
        }
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<ClientSession>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Keeps a client registered while alive.
pub struct ClientGuard {
    id: ClientId,
    map: Arc<ClientMap>,
}

impl ClientGuard {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.map.clients.remove(&self.id);
    }
}

impl fmt::Debug for ClientGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientGuard").field("id", &self.id).finish()
    }
}
