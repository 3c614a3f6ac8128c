//! Typed calls to the server's built-in `KRPC` service.

use bytes::Bytes;

use crate::client::RpcClient;
use crate::codec::{WireValue, decode_message, encode_message};
use crate::error::Result;
use crate::schema::{self, ProcedureCall};

pub const SERVICE: &str = "KRPC";

/// Borrowed view of an [`RpcClient`] exposing the `KRPC` procedures.
#[derive(Debug, Clone, Copy)]
pub struct KrpcService<'a> {
    client: &'a RpcClient,
}

impl<'a> KrpcService<'a> {
    pub fn new(client: &'a RpcClient) -> Self {
        Self { client }
    }

    /// The identifier the server assigned to this client.
    pub fn get_client_id(&self) -> Result<Bytes> {
        let value = self.client.invoke(SERVICE, "GetClientID", [])?;
        Ok(Bytes::decode(&value)?)
    }

    pub fn get_client_name(&self) -> Result<String> {
        let value = self.client.invoke(SERVICE, "GetClientName", [])?;
        Ok(String::decode(&value)?)
    }

    /// Register `call` as a stream. The server returns the existing stream
    /// when an identical call is already registered for this client.
    pub fn add_stream(&self, call: &ProcedureCall, start: bool) -> Result<schema::Stream> {
        let value = self
            .client
            .invoke(SERVICE, "AddStream", [encode_message(call), start.to_bytes()])?;
        Ok(decode_message(&value)?)
    }

    /// Create an event that occurs whenever `call`, which must return a
    /// bool, evaluates to `true`. The event's stream is not started.
    pub fn add_event(&self, call: &ProcedureCall) -> Result<schema::Event> {
        let value = self.client.invoke(SERVICE, "AddEvent", [encode_message(call)])?;
        Ok(decode_message(&value)?)
    }

    pub fn start_stream(&self, id: u64) -> Result<()> {
        self.client.invoke(SERVICE, "StartStream", [id.to_bytes()])?;
        Ok(())
    }

    /// Ask the server to send at most `rate` updates per second; `0` removes
    /// the limit.
    pub fn set_stream_rate(&self, id: u64, rate: f32) -> Result<()> {
        self.client
            .invoke(SERVICE, "SetStreamRate", [id.to_bytes(), rate.to_bytes()])?;
        Ok(())
    }

    pub fn remove_stream(&self, id: u64) -> Result<()> {
        self.client.invoke(SERVICE, "RemoveStream", [id.to_bytes()])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorRegistry;
    use crate::test_support::{self, FakeKrpc};
    use crate::transport::MemoryTransport;

    fn client(krpc: Arc<FakeKrpc>) -> RpcClient {
        let (client_end, server_end) = MemoryTransport::pair();
        test_support::spawn_rpc_server(server_end, move |call| krpc.handle(call));
        RpcClient::new(Box::new(client_end), Arc::new(ErrorRegistry::new()))
    }

    #[test]
    fn test_add_stream_dedupes_identical_calls() {
        let fake = Arc::new(FakeKrpc::default());
        let client = client(Arc::clone(&fake));
        let krpc = KrpcService::new(&client);

        let call = ProcedureCall::new("TestService", "Counter", []);
        let first = krpc.add_stream(&call, false).unwrap();
        let second = krpc.add_stream(&call, false).unwrap();
        let other = krpc
            .add_stream(&ProcedureCall::new("TestService", "Other", []), false)
            .unwrap();
        assert_ne!(first.id, 0);
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_stream_lifecycle_calls() {
        let fake = Arc::new(FakeKrpc::default());
        let client = client(Arc::clone(&fake));
        let krpc = KrpcService::new(&client);

        let stream = krpc
            .add_stream(&ProcedureCall::new("TestService", "Counter", []), true)
            .unwrap();
        krpc.set_stream_rate(stream.id, 2.5).unwrap();
        krpc.remove_stream(stream.id).unwrap();

        assert_eq!(fake.started(), vec![stream.id]);
        assert_eq!(fake.rate(stream.id), Some(2.5));
        assert_eq!(fake.removed(), vec![stream.id]);
    }

    #[test]
    fn test_events_get_their_own_streams() {
        let fake = Arc::new(FakeKrpc::default());
        let client = client(Arc::clone(&fake));
        let krpc = KrpcService::new(&client);

        let call = ProcedureCall::new("TestService", "Fired", []);
        let stream = krpc.add_stream(&call, false).unwrap();
        let first = krpc.add_event(&call).unwrap().stream.unwrap();
        let second = krpc.add_event(&call).unwrap().stream.unwrap();
        assert_ne!(first, second);
        assert_ne!(first, stream);
        assert!(fake.started().is_empty());
    }

    #[test]
    fn test_client_identity() {
        let client = client(Arc::new(FakeKrpc::default()));
        let krpc = KrpcService::new(&client);
        assert_eq!(krpc.get_client_name().unwrap(), "test-client");
        assert_eq!(krpc.get_client_id().unwrap().len(), 16);
    }
}
