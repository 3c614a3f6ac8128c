//! A blocking client for kRPC-style servers.
//!
//! Procedure calls travel as length-delimited protobuf messages over an RPC
//! connection. Streams are procedure calls the server re-evaluates and pushes
//! over a second connection; a background reader keeps the latest value of
//! each one.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use krpc_lite::codec::WireValue;
//! use krpc_lite::schema::ProcedureCall;
//! use krpc_lite::{Connection, ConnectionConfig};
//!
//! let connection = Connection::connect(ConnectionConfig::new("example"))?;
//!
//! let value = connection.invoke("TestService", "Int32ToString", [42i32.to_bytes()])?;
//! assert_eq!(String::decode(&value)?, "42");
//!
//! let counter = connection.add_stream(ProcedureCall::new("TestService", "Counter", []))?;
//! counter.start_and_wait(Duration::from_secs(1))?;
//! println!("counter = {}", counter.get::<i32>()?);
//! # Ok::<(), krpc_lite::Error>(())
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod framer;
pub mod krpc;
pub mod schema;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::RpcClient;
pub use connection::{ClientId, Connection, ConnectionConfig};
pub use error::{EncodingError, Error, ErrorRegistry, RemoteError, Result, TransportError};
pub use stream::{
    Event, StreamConfig, StreamHandle, StreamManager, StreamState, ValuePolicy,
};
