use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::schema;

/// Errors raised while encoding or decoding wire values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EncodingError {
    /// Malformed input.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// The value could not be written.
    #[error("encode failed: {0}")]
    EncodeFailed(String),

    /// A decoded bytes value does not fit the caller's buffer.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// A varint ran past 10 bytes.
    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    /// The buffer ended in the middle of a value.
    #[error("unexpected end of buffer")]
    Truncated,
}

impl From<prost::DecodeError> for EncodingError {
    fn from(e: prost::DecodeError) -> Self {
        EncodingError::DecodeFailed(e.to_string())
    }
}

impl From<prost::EncodeError> for EncodingError {
    fn from(e: prost::EncodeError) -> Self {
        EncodingError::EncodeFailed(e.to_string())
    }
}

/// Errors raised by a byte-level transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport I/O error")]
    Io(#[from] io::Error),

    /// The peer closed the channel.
    #[error("end of stream")]
    Eof,

    /// Every connection attempt failed.
    #[error("failed to connect to {target} after {attempts} attempts")]
    ConnectFailed {
        target: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("transport is not connected")]
    NotConnected,

    /// The channel was closed locally.
    #[error("transport closed")]
    Closed,
}

/// A server-side procedure failure with no registered typed mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub service: String,
    pub name: String,
    pub message: String,
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// An error produced by a registered exception factory.
#[derive(Debug, Clone)]
pub struct TypedError {
    pub service: String,
    pub name: String,
    inner: Arc<dyn std::error::Error + Send + Sync>,
}

impl TypedError {
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Display for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.service, self.name, self.inner)
    }
}

/// An error reported by the server for a procedure call.
///
/// Cheap to clone so streams can cache it and hand it to every reader.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("RPC error: {0}")]
    Rpc(RpcFailure),

    #[error("{0}")]
    Typed(TypedError),
}

impl RemoteError {
    /// A failure reported without a typed mapping, such as a top-level
    /// response error.
    pub fn generic(error: &schema::Error) -> Self {
        RemoteError::Rpc(RpcFailure {
            service: error.service.clone(),
            name: error.name.clone(),
            message: error_message(error),
        })
    }

    pub fn service(&self) -> &str {
        match self {
            RemoteError::Rpc(e) => &e.service,
            RemoteError::Typed(e) => &e.service,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RemoteError::Rpc(e) => &e.name,
            RemoteError::Typed(e) => &e.name,
        }
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            RemoteError::Typed(e) => e.downcast_ref::<E>(),
            RemoteError::Rpc(_) => None,
        }
    }
}

/// Top-level error type of the client library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Connecting or the handshake failed.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<TransportError>,
    },

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Operation on an unknown or removed stream, or a stream with no value yet.
    #[error("stream error: {0}")]
    Stream(String),
}

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Builds a typed error from the server's description text.
pub type ErrorFactory =
    Arc<dyn Fn(&str) -> Box<dyn std::error::Error + Send + Sync> + Send + Sync>;

/// Maps `(service, error name)` pairs reported by the server to typed errors.
///
/// Owned by each client; errors without a registered factory become
/// [`RemoteError::Rpc`].
#[derive(Clone, Default)]
pub struct ErrorRegistry {
    factories: HashMap<(String, String), ErrorFactory, ahash::RandomState>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for errors named `name` raised by `service`.
    pub fn register<F, E>(
        mut self,
        service: impl Into<String>,
        name: impl Into<String>,
        factory: F,
    ) -> Self
    where
        F: Fn(&str) -> E + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let factory: ErrorFactory = Arc::new(
            move |description: &str| -> Box<dyn std::error::Error + Send + Sync> {
                Box::new(factory(description))
            },
        );
        self.factories.insert((service.into(), name.into()), factory);
        self
    }

    pub fn contains(&self, service: &str, name: &str) -> bool {
        self.factories
            .contains_key(&(service.to_owned(), name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Resolve an error message from the server.
    pub fn build(&self, error: &schema::Error) -> RemoteError {
        let key = (error.service.clone(), error.name.clone());
        match self.factories.get(&key) {
            Some(factory) => RemoteError::Typed(TypedError {
                inner: Arc::from(factory(&error_message(error))),
                service: key.0,
                name: key.1,
            }),
            None => RemoteError::generic(error),
        }
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn error_message(error: &schema::Error) -> String {
    if error.stack_trace.is_empty() {
        error.description.clone()
    } else {
        format!(
            "{}\nServer stack trace:\n{}",
            error.description, error.stack_trace
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("custom: {0}")]
    struct CustomError(String);

    fn server_error(service: &str, name: &str, description: &str) -> schema::Error {
        schema::Error {
            service: service.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            stack_trace: String::new(),
        }
    }

    #[test]
    fn test_registered_error_is_typed() {
        let registry = ErrorRegistry::new().register("TestService", "CustomException", |d| {
            CustomError(d.to_string())
        });

        let err = registry.build(&server_error("TestService", "CustomException", "boom"));
        let custom = err.downcast_ref::<CustomError>().unwrap();
        assert_eq!(custom.0, "boom");
        assert_eq!(err.service(), "TestService");
        assert_eq!(err.name(), "CustomException");
    }

    #[test]
    fn test_unregistered_error_is_generic() {
        let registry = ErrorRegistry::new();
        let err = registry.build(&server_error("", "", "Service 'Nope' not found"));
        match err {
            RemoteError::Rpc(failure) => assert_eq!(failure.message, "Service 'Nope' not found"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stack_trace_appended() {
        let mut error = server_error("", "", "failed");
        error.stack_trace = "at Foo()".to_string();
        let err = ErrorRegistry::new().build(&error);
        assert_eq!(err.to_string(), "RPC error: failed\nServer stack trace:\nat Foo()");
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ErrorRegistry::new().register("S", "E", |d| CustomError(d.to_string()));
        let b = ErrorRegistry::new();
        assert!(a.contains("S", "E"));
        assert!(!b.contains("S", "E"));
        assert!(matches!(b.build(&server_error("S", "E", "x")), RemoteError::Rpc(_)));
    }
}
