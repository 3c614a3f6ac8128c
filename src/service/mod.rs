//! Procedures served by [`TestServer`](crate::server::TestServer).

mod krpc;
mod test_service;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use krpc_lite::codec::WireValue;
use krpc_lite::schema::{ProcedureCall, ProcedureResult};
use tracing::debug;

use crate::error::ProcedureError;
use crate::server::ClientSession;

pub type ProcedureOutcome = Result<Bytes, ProcedureError>;

/// Positional arguments of one call.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    call: &'a ProcedureCall,
}

impl<'a> Args<'a> {
    pub fn new(call: &'a ProcedureCall) -> Self {
        Self { call }
    }

    fn raw(&self, position: u32) -> Option<&'a [u8]> {
        self.call
            .arguments
            .iter()
            .find(|argument| argument.position == position)
            .map(|argument| &argument.value[..])
    }

    pub fn get<T: WireValue>(&self, position: u32) -> Result<T, ProcedureError> {
        let raw = self.raw(position).ok_or_else(|| {
            ProcedureError::argument_exception(format!(
                "{} is missing argument {position}",
                self.call.path()
            ))
        })?;
        Ok(T::decode(raw)?)
    }

    pub fn get_or<T: WireValue>(&self, position: u32, default: T) -> Result<T, ProcedureError> {
        match self.raw(position) {
            Some(raw) => Ok(T::decode(raw)?),
            None => Ok(default),
        }
    }

    pub fn raw_bytes(&self, position: u32) -> Result<&'a [u8], ProcedureError> {
        self.raw(position).ok_or_else(|| {
            ProcedureError::argument_exception(format!(
                "{} is missing argument {position}",
                self.call.path()
            ))
        })
    }
}

/// A repeating timer that reports each expiry once.
#[derive(Debug)]
struct Timer {
    created: Instant,
    interval: Duration,
    repeats: u32,
    reported: u32,
}

impl Timer {
    /// Whether an expiry is due that has not been reported yet. Reporting
    /// it consumes it.
    fn poll(&mut self, now: Instant) -> bool {
        let interval = self.interval.as_nanos().max(1);
        let expired = now.duration_since(self.created).as_nanos() / interval;
        let expired = u32::try_from(expired).unwrap_or(u32::MAX).min(self.repeats);
        if expired > self.reported {
            self.reported += 1;
            true
        } else {
            false
        }
    }
}

/// Server-wide procedure state and dispatch.
#[derive(Debug, Default)]
pub struct Services {
    objects: DashMap<u64, String, ahash::RandomState>,
    timers: DashMap<u64, Timer, ahash::RandomState>,
    next_object: AtomicU64,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `call` names a procedure this server knows.
    pub fn exists(&self, call: &ProcedureCall) -> bool {
        let procedures = match call.service.as_str() {
            krpc::SERVICE => krpc::PROCEDURES,
            test_service::SERVICE => test_service::PROCEDURES,
            _ => return false,
        };
        procedures.contains(&call.procedure.as_str())
    }

    pub fn call(&self, session: &ClientSession, call: &ProcedureCall) -> ProcedureOutcome {
        let args = Args::new(call);
        match call.service.as_str() {
            krpc::SERVICE => krpc::call(self, session, call, args),
            test_service::SERVICE => test_service::call(self, session, call, args),
            other => Err(ProcedureError::generic(format!(
                "Service '{other}' not found"
            ))),
        }
    }

    /// Run `call` and wrap the outcome for a response.
    pub fn dispatch(&self, session: &ClientSession, call: &ProcedureCall) -> ProcedureResult {
        match self.call(session, call) {
            Ok(value) => ProcedureResult::value(value),
            Err(e) => {
                debug!(procedure = %call.path(), error = %e, "procedure failed");
                ProcedureResult::error(e.to_schema())
            }
        }
    }

    fn create_object(&self, value: String) -> u64 {
        let id = self.next_object.fetch_add(1, Ordering::Relaxed) + 1;
        self.objects.insert(id, value);
        id
    }

    fn object(&self, id: u64) -> Option<String> {
        self.objects.get(&id).map(|value| value.clone())
    }

    fn create_timer(&self, interval: Duration, repeats: u32) -> u64 {
        let id = self.next_object.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = Timer {
            created: Instant::now(),
            interval,
            repeats,
            reported: 0,
        };
        self.timers.insert(id, timer);
        id
    }

    fn poll_timer(&self, id: u64, now: Instant) -> Option<bool> {
        self.timers.get_mut(&id).map(|mut timer| timer.poll(now))
    }
}

fn not_found(call: &ProcedureCall) -> ProcedureError {
    ProcedureError::generic(format!("Procedure '{}' not found", call.path()))
}
