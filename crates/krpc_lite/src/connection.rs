//! Handshakes and the top-level [`Connection`].
//!
//! A client opens two connections to the server. The RPC connection sends a
//! `ConnectionRequest` carrying the client name and receives the client
//! identifier; the stream connection then presents that identifier so the
//! server can route stream updates to it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::RpcClient;
use crate::error::{Error, ErrorRegistry, Result};
use crate::framer::{self, DEFAULT_MAX_MESSAGE_SIZE};
use crate::krpc::KrpcService;
use crate::codec::decode_message;
use crate::schema::{
    self, ConnectionRequest, ConnectionResponse, ProcedureCall, connection_request,
    connection_response,
};
use crate::stream::{Event, StreamConfig, StreamHandle, StreamManager, ValuePolicy};
use crate::transport::{SerialTransport, TcpTransport, Transport};

/// Longest client name the server accepts, in bytes.
pub const MAX_CLIENT_NAME_LEN: usize = 32;

/// The 16-byte identifier the server assigns during the RPC handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; 16]);

impl ClientId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id = <[u8; 16]>::try_from(bytes).map_err(|_| {
            Error::connection(format!(
                "client identifier must be 16 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(ClientId(id))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<Uuid> for ClientId {
    fn from(uuid: Uuid) -> Self {
        ClientId(uuid.into_bytes())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

fn check_response(response: &ConnectionResponse) -> Result<()> {
    match response.status() {
        connection_response::Status::Ok => Ok(()),
        status => Err(Error::connection(format!(
            "server refused connection ({status:?}): {}",
            response.message
        ))),
    }
}

/// Open the RPC connection under `name` and return the assigned identifier.
pub fn handshake_rpc<T: Transport + ?Sized>(
    transport: &mut T,
    name: &str,
    max_message_size: usize,
) -> Result<ClientId> {
    if name.len() > MAX_CLIENT_NAME_LEN {
        return Err(Error::connection(format!(
            "client name is {} bytes, the limit is {MAX_CLIENT_NAME_LEN}",
            name.len()
        )));
    }
    let request = ConnectionRequest {
        r#type: connection_request::Type::Rpc as i32,
        client_name: name.to_string(),
        client_identifier: Bytes::new(),
    };
    framer::write_message(transport, &request)?;
    let response: ConnectionResponse = framer::read_message(transport, max_message_size)?;
    check_response(&response)?;
    let id = ClientId::from_bytes(&response.client_identifier)?;
    debug!(client_id = %id, "rpc handshake complete");
    Ok(id)
}

/// Attach the stream connection to the client identified by `id`.
pub fn handshake_stream<T: Transport + ?Sized>(
    transport: &mut T,
    id: &ClientId,
    max_message_size: usize,
) -> Result<()> {
    let request = ConnectionRequest {
        r#type: connection_request::Type::Stream as i32,
        client_name: String::new(),
        client_identifier: Bytes::copy_from_slice(id.as_bytes()),
    };
    framer::write_message(transport, &request)?;
    let response: ConnectionResponse = framer::read_message(transport, max_message_size)?;
    check_response(&response)?;
    debug!(client_id = %id, "stream handshake complete");
    Ok(())
}

/// Configuration for [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Name shown by the server; at most 32 bytes.
    pub name: String,

    /// Server host name or address.
    pub address: String,

    pub rpc_port: u16,

    /// Port of the stream server; `None` connects without streams.
    pub stream_port: Option<u16>,

    /// Additional attempts after the first failed connect.
    pub connect_retries: u32,

    /// Pause between connect attempts.
    pub retry_backoff: Duration,

    /// How often the stream reader checks its flags while idle.
    pub poll_interval: Duration,

    /// Largest message accepted on either connection.
    pub max_message_size: usize,

    pub value_policy: ValuePolicy,

    /// Typed mappings for server errors.
    pub errors: ErrorRegistry,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: "127.0.0.1".to_string(),
            rpc_port: 50000,
            stream_port: Some(50001),
            connect_retries: 10,
            retry_backoff: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            value_policy: ValuePolicy::Error,
            errors: ErrorRegistry::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    pub fn with_stream_port(mut self, port: u16) -> Self {
        self.stream_port = Some(port);
        self
    }

    /// Connect without a stream connection.
    pub fn without_streams(mut self) -> Self {
        self.stream_port = None;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

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

    pub fn with_errors(mut self, errors: ErrorRegistry) -> Self {
        self.errors = errors;
        self
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_max_message_size(self.max_message_size)
            .with_value_policy(self.value_policy)
    }
}

fn open_transport<T: Transport>(transport: &mut T, config: &ConnectionConfig) -> Result<()> {
    transport
        .connect(config.connect_retries, config.retry_backoff)
        .map_err(|source| Error::Connection {
            message: format!("cannot reach {}", transport.target()),
            source: Some(source),
        })
}

/// A client connected to a server: an [`RpcClient`] plus, when the stream
/// connection is present, a [`StreamManager`].
pub struct Connection {
    client_id: ClientId,
    rpc: Arc<RpcClient>,
    streams: Option<StreamManager>,
}

impl Connection {
    /// Connect over TCP, retrying each connection as configured.
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        let mut rpc = TcpTransport::new(format!("{}:{}", config.address, config.rpc_port));
        open_transport(&mut rpc, &config)?;

        let stream = match config.stream_port {
            Some(port) => {
                let mut stream = TcpTransport::new(format!("{}:{port}", config.address));
                open_transport(&mut stream, &config)?;
                Some(Box::new(stream) as Box<dyn Transport>)
            }
            None => None,
        };

        Self::from_transports(Box::new(rpc), stream, config)
    }

    /// Connect over a serial device. Serial links carry no streams.
    pub fn connect_serial(path: impl AsRef<Path>, config: ConnectionConfig) -> Result<Self> {
        let mut serial = SerialTransport::new(path);
        open_transport(&mut serial, &config)?;
        Self::from_transports(Box::new(serial), None, config)
    }

    /// Handshake over already open transports.
    pub fn from_transports(
        mut rpc: Box<dyn Transport>,
        stream: Option<Box<dyn Transport>>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let client_id = handshake_rpc(&mut *rpc, &config.name, config.max_message_size)?;
        let rpc = Arc::new(
            RpcClient::new(rpc, Arc::new(config.errors.clone()))
                .with_max_message_size(config.max_message_size),
        );

        let streams = match stream {
            Some(mut transport) => {
                handshake_stream(&mut *transport, &client_id, config.max_message_size)?;
                Some(StreamManager::new(
                    Arc::clone(&rpc),
                    transport,
                    config.stream_config(),
                )?)
            }
            None => None,
        };

        info!(
            client_id = %client_id,
            name = %config.name,
            streams = streams.is_some(),
            "connected"
        );
        Ok(Self {
            client_id,
            rpc,
            streams,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn krpc(&self) -> KrpcService<'_> {
        KrpcService::new(&self.rpc)
    }

    pub fn invoke<I>(&self, service: &str, procedure: &str, args: I) -> Result<Bytes>
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.rpc.invoke(service, procedure, args)
    }

    pub fn streams(&self) -> Result<&StreamManager> {
        self.streams
            .as_ref()
            .ok_or_else(|| Error::Stream("connection has no stream connection".into()))
    }

    pub fn add_stream(&self, call: ProcedureCall) -> Result<StreamHandle> {
        self.streams()?.add_stream(call)
    }

    /// Create an event that occurs whenever `call` evaluates to `true`.
    pub fn add_event(&self, call: ProcedureCall) -> Result<Event> {
        self.streams()?.add_event(call)
    }

    /// Invoke a procedure that returns an event and track that event.
    pub fn invoke_event(&self, call: ProcedureCall) -> Result<Event> {
        let streams = self.streams()?;
        let value = self.rpc.invoke_call(call.clone())?;
        let event: schema::Event = decode_message(&value)?;
        streams.register_event(&event, call)
    }

    pub fn freeze_streams(&self) -> Result<()> {
        self.streams()?.freeze()
    }

    pub fn thaw_streams(&self) -> Result<()> {
        self.streams()?.thaw()
    }

    /// Stop the stream reader and close both connections.
    pub fn close(&mut self) {
        if let Some(mut streams) = self.streams.take() {
            streams.shutdown();
        }
        self.rpc.close();
        debug!(client_id = %self.client_id, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread::{self, JoinHandle};

    use super::*;
    use crate::codec::WireValue;
    use crate::test_support::{self, FakeKrpc, counter_call};
    use crate::transport::MemoryTransport;

    const ID: [u8; 16] = [0x11; 16];

    fn respond(
        transport: &mut MemoryTransport,
        status: connection_response::Status,
        message: &str,
    ) -> ConnectionRequest {
        let request: ConnectionRequest = framer::read_message(transport, 1024).unwrap();
        let response = ConnectionResponse {
            status: status as i32,
            message: message.to_string(),
            client_identifier: if status == connection_response::Status::Ok {
                Bytes::from_static(&ID)
            } else {
                Bytes::new()
            },
        };
        framer::write_message(transport, &response).unwrap();
        request
    }

    #[test]
    fn test_rpc_handshake() {
        let (mut client, mut server) = MemoryTransport::pair();
        let peer = thread::spawn(move || respond(&mut server, connection_response::Status::Ok, ""));
        let id = handshake_rpc(&mut client, "tester", 1024).unwrap();
        let request = peer.join().unwrap();

        assert_eq!(id.as_bytes(), &ID);
        assert_eq!(request.r#type(), connection_request::Type::Rpc);
        assert_eq!(request.client_name, "tester");
        assert_eq!(id.to_string(), Uuid::from_bytes(ID).to_string());
    }

    #[test]
    fn test_stream_handshake_sends_identifier() {
        let (mut client, mut server) = MemoryTransport::pair();
        let peer = thread::spawn(move || respond(&mut server, connection_response::Status::Ok, ""));
        handshake_stream(&mut client, &ClientId(ID), 1024).unwrap();
        let request = peer.join().unwrap();

        assert_eq!(request.r#type(), connection_request::Type::Stream);
        assert_eq!(&request.client_identifier[..], &ID);
    }

    #[test]
    fn test_refused_handshake() {
        let (mut client, mut server) = MemoryTransport::pair();
        let peer = thread::spawn(move || {
            respond(
                &mut server,
                connection_response::Status::WrongType,
                "unknown client identifier",
            )
        });
        let err = handshake_stream(&mut client, &ClientId(ID), 1024).unwrap_err();
        peer.join().unwrap();
        match err {
            Error::Connection { message, .. } => assert!(message.contains("unknown client identifier")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_long_name_rejected_locally() {
        let (mut client, server) = MemoryTransport::pair();
        let name = "x".repeat(MAX_CLIENT_NAME_LEN + 1);
        let err = handshake_rpc(&mut client, &name, 1024).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(client.pending(), 0);
        drop(server);
    }

    #[test]
    fn test_client_id_length_checked() {
        assert!(ClientId::from_bytes(&[0; 15]).is_err());
        assert!(ClientId::from_bytes(&[0; 16]).is_ok());
    }

    fn serve(
        mut rpc: MemoryTransport,
        mut stream: Option<MemoryTransport>,
    ) -> JoinHandle<Option<MemoryTransport>> {
        thread::spawn(move || {
            respond(&mut rpc, connection_response::Status::Ok, "");
            if let Some(stream) = stream.as_mut() {
                respond(stream, connection_response::Status::Ok, "");
            }
            let krpc = FakeKrpc::default();
            test_support::spawn_rpc_server(rpc, move |call| krpc.handle(call));
            stream
        })
    }

    #[test]
    fn test_connection_over_transports() {
        let (rpc_client, rpc_server) = MemoryTransport::pair();
        let (stream_client, stream_server) = MemoryTransport::pair();
        let server = serve(rpc_server, Some(stream_server));

        let config = ConnectionConfig::new("tester").with_poll_interval(Duration::from_millis(5));
        let mut connection = Connection::from_transports(
            Box::new(rpc_client),
            Some(Box::new(stream_client)),
            config,
        )
        .unwrap();
        let mut updates = server.join().unwrap().unwrap();

        assert_eq!(connection.client_id().as_bytes(), &ID);
        let value = connection
            .invoke("TestService", "Int32ToString", [7i32.to_bytes()])
            .unwrap();
        assert_eq!(String::decode(&value).unwrap(), "7");

        let stream = connection.add_stream(counter_call()).unwrap();
        test_support::push_value(&mut updates, stream.id(), 3i32);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stream.value().is_err() {
            assert!(std::time::Instant::now() < deadline, "no stream update");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(stream.get::<i32>().unwrap(), 3);

        connection.freeze_streams().unwrap();
        connection.thaw_streams().unwrap();
        connection.close();
        assert!(!connection.rpc().is_connected());
        assert_eq!(stream.state(), crate::stream::StreamState::Removed);
    }

    #[test]
    fn test_connection_without_streams() {
        let (rpc_client, rpc_server) = MemoryTransport::pair();
        let server = serve(rpc_server, None);
        let config = ConnectionConfig::new("rpc-only");
        let connection = Connection::from_transports(Box::new(rpc_client), None, config).unwrap();
        server.join().unwrap();

        assert!(matches!(connection.streams(), Err(Error::Stream(_))));
        assert!(matches!(connection.add_stream(counter_call()), Err(Error::Stream(_))));
        assert_eq!(connection.krpc().get_client_name().unwrap(), "test-client");
    }
}
