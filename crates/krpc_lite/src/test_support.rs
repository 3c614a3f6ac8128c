//! In-process server doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::client::RpcClient;
use crate::codec::{WireValue, decode_message, encode_message};
use crate::error::ErrorRegistry;
use crate::framer::{self, DEFAULT_MAX_MESSAGE_SIZE};
use crate::schema::{self, ProcedureCall, ProcedureResult};
use crate::stream::{StreamConfig, StreamManager};
use crate::transport::{MemoryTransport, Transport};

#[derive(Debug, thiserror::Error)]
#[error("custom: {0}")]
pub(crate) struct CustomError(pub String);

/// Serve framed requests on `transport` until the peer goes away.
pub(crate) fn spawn_rpc_server<F>(mut transport: MemoryTransport, handler: F) -> JoinHandle<()>
where
    F: Fn(&ProcedureCall) -> ProcedureResult + Send + 'static,
{
    thread::spawn(move || {
        while let Ok(request) =
            framer::read_message::<_, schema::Request>(&mut transport, DEFAULT_MAX_MESSAGE_SIZE)
        {
            let response = schema::Response {
                error: None,
                results: request.calls.iter().map(&handler).collect(),
            };
            if framer::write_message(&mut transport, &response).is_err() {
                break;
            }
        }
    })
}

fn arg(call: &ProcedureCall, position: usize) -> &[u8] {
    call.arguments
        .get(position)
        .map(|a| &a.value[..])
        .unwrap_or_default()
}

/// A few `TestService` procedures, enough for client tests.
pub(crate) fn test_service(call: &ProcedureCall) -> ProcedureResult {
    if call.service != "TestService" {
        return ProcedureResult::error(schema::Error::generic(format!(
            "Service '{}' not found",
            call.service
        )));
    }
    match call.procedure.as_str() {
        "Int32ToString" => {
            let value = i32::decode(arg(call, 0)).unwrap();
            ProcedureResult::value(value.to_string().to_bytes())
        }
        "ThrowArgumentException" => ProcedureResult::error(schema::Error::typed(
            "",
            "ArgumentException",
            "Invalid argument",
        )),
        "ThrowCustomException" => ProcedureResult::error(schema::Error::typed(
            "TestService",
            "CustomException",
            "A custom kRPC exception",
        )),
        other => ProcedureResult::error(schema::Error::generic(format!(
            "Procedure 'TestService.{other}' not found"
        ))),
    }
}

/// Event stream ids start here, clear of the ids handed out for streams.
pub(crate) const EVENT_IDS: u64 = 1000;

#[derive(Default)]
struct FakeState {
    ids: HashMap<ProcedureCall, u64>,
    events: u64,
    started: Vec<u64>,
    removed: Vec<u64>,
    rates: HashMap<u64, f32>,
}

/// The `KRPC` stream procedures, recording what was asked of them.
#[derive(Default)]
pub(crate) struct FakeKrpc {
    state: Mutex<FakeState>,
}

impl FakeKrpc {
    pub(crate) fn handle(&self, call: &ProcedureCall) -> ProcedureResult {
        if call.service != "KRPC" {
            return test_service(call);
        }
        let mut state = self.state.lock();
        match call.procedure.as_str() {
            "GetClientName" => ProcedureResult::value("test-client".to_string().to_bytes()),
            "GetClientID" => ProcedureResult::value(Bytes::from_static(&[7; 16]).to_bytes()),
            "AddStream" => {
                let target: ProcedureCall = decode_message(arg(call, 0)).unwrap();
                let next = state.ids.len() as u64 + 1;
                let id = *state.ids.entry(target).or_insert(next);
                if bool::decode(arg(call, 1)).unwrap() {
                    state.started.push(id);
                }
                ProcedureResult::value(encode_message(&schema::Stream { id }))
            }
            "AddEvent" => {
                state.events += 1;
                let id = EVENT_IDS + state.events;
                ProcedureResult::value(encode_message(&schema::Event {
                    stream: Some(schema::Stream { id }),
                }))
            }
            "StartStream" => {
                state.started.push(u64::decode(arg(call, 0)).unwrap());
                ProcedureResult::value(Bytes::new())
            }
            "SetStreamRate" => {
                let id = u64::decode(arg(call, 0)).unwrap();
                let rate = f32::decode(arg(call, 1)).unwrap();
                state.rates.insert(id, rate);
                ProcedureResult::value(Bytes::new())
            }
            "RemoveStream" => {
                state.removed.push(u64::decode(arg(call, 0)).unwrap());
                ProcedureResult::value(Bytes::new())
            }
            other => ProcedureResult::error(schema::Error::generic(format!(
                "Procedure 'KRPC.{other}' not found"
            ))),
        }
    }

    pub(crate) fn started(&self) -> Vec<u64> {
        self.state.lock().started.clone()
    }

    pub(crate) fn removed(&self) -> Vec<u64> {
        self.state.lock().removed.clone()
    }

    pub(crate) fn rate(&self, id: u64) -> Option<f32> {
        self.state.lock().rates.get(&id).copied()
    }
}

/// A stream manager wired to in-process doubles.
pub(crate) struct StreamFixture {
    pub manager: StreamManager,
    pub krpc: Arc<FakeKrpc>,
    /// Server end of the stream connection; updates are pushed here.
    pub updates: MemoryTransport,
}

impl StreamFixture {
    pub(crate) fn new(config: StreamConfig) -> Self {
        Self::with_errors(config, ErrorRegistry::new())
    }

    pub(crate) fn with_errors(config: StreamConfig, errors: ErrorRegistry) -> Self {
        let krpc = Arc::new(FakeKrpc::default());
        let (rpc_client, rpc_server) = MemoryTransport::pair();
        let handler = Arc::clone(&krpc);
        spawn_rpc_server(rpc_server, move |call| handler.handle(call));
        let rpc = Arc::new(RpcClient::new(Box::new(rpc_client), Arc::new(errors)));

        let (stream_client, updates) = MemoryTransport::pair();
        let manager = StreamManager::new(rpc, Box::new(stream_client), config).unwrap();
        Self {
            manager,
            krpc,
            updates,
        }
    }

    pub(crate) fn push_value<T: WireValue>(&mut self, id: u64, value: T) {
        push_value(&mut self.updates, id, value);
    }

    /// Block until the reader has taken every pushed byte off the channel.
    pub(crate) fn drain(&self) {
        while self.updates.pending() > 0 {
            thread::yield_now();
        }
    }
}

/// Send one `StreamUpdate` frame.
pub(crate) fn push_update(transport: &mut MemoryTransport, results: Vec<(u64, ProcedureResult)>) {
    let update = schema::StreamUpdate {
        results: results
            .into_iter()
            .map(|(id, result)| schema::StreamResult {
                id,
                result: Some(result),
            })
            .collect(),
    };
    framer::write_message(transport, &update).unwrap();
}

pub(crate) fn push_value<T: WireValue>(transport: &mut MemoryTransport, id: u64, value: T) {
    push_update(transport, vec![(id, ProcedureResult::value(value.to_bytes()))]);
}

pub(crate) fn counter_call() -> ProcedureCall {
    ProcedureCall::new("TestService", "Counter", [])
}

pub(crate) fn send_raw(transport: &mut MemoryTransport, data: &[u8]) {
    transport.send(data).unwrap();
}
