//! Synchronous procedure calls over the RPC connection.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{EncodingError, ErrorRegistry, RemoteError, Result};
use crate::framer::{self, DEFAULT_MAX_MESSAGE_SIZE};
use crate::schema::{self, ProcedureCall};
use crate::transport::{Transport, TransportCloser};

/// Issues requests on the RPC connection, one at a time.
///
/// The protocol has no request ids, so a response belongs to whichever request
/// was sent last. The transport lock is held from send until the response has
/// been read; concurrent callers queue behind it. A failed exchange may leave
/// unread bytes behind, so it closes the transport and later calls fail with a
/// [`TransportError`](crate::error::TransportError).
pub struct RpcClient {
    transport: Mutex<Box<dyn Transport>>,
    closer: Option<TransportCloser>,
    errors: Arc<ErrorRegistry>,
    max_message_size: usize,
}

impl RpcClient {
    pub fn new(transport: Box<dyn Transport>, errors: Arc<ErrorRegistry>) -> Self {
        Self {
            closer: transport.closer(),
            transport: Mutex::new(transport),
            errors,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Set the largest response payload accepted.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn errors(&self) -> &ErrorRegistry {
        &self.errors
    }

    /// Call `service.procedure` with already-encoded arguments and return the
    /// encoded result.
    pub fn invoke<I>(&self, service: &str, procedure: &str, args: I) -> Result<Bytes>
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.invoke_call(ProcedureCall::new(service, procedure, args))
    }

    pub fn invoke_call(&self, call: ProcedureCall) -> Result<Bytes> {
        let mut results = self.invoke_batch(vec![call])?;
        // invoke_batch guarantees one result per call.
        results
            .pop()
            .unwrap_or_else(|| Err(EncodingError::DecodeFailed("empty response".into()).into()))
    }

    /// Send several calls in one request. Results come back in call order.
    ///
    /// The outer error covers the exchange itself; each inner result is the
    /// outcome of one call.
    pub fn invoke_batch(&self, calls: Vec<ProcedureCall>) -> Result<Vec<Result<Bytes>>> {
        let expected = calls.len();
        if let Some(first) = calls.first() {
            debug!(procedure = %first.path(), calls = expected, "invoke");
        }
        let request = schema::Request { calls };

        let response = {
            let mut transport = self.transport.lock();
            let exchange = framer::write_message(&mut **transport, &request).and_then(|()| {
                framer::read_message::<_, schema::Response>(&mut **transport, self.max_message_size)
            });
            if let Err(e) = &exchange {
                warn!(
                    target_addr = %transport.target(),
                    error = %e,
                    "rpc exchange failed, closing connection"
                );
                transport.close();
            }
            exchange?
        };

        if let Some(error) = response.error {
            debug!(description = %error.description, "request failed");
            return Err(RemoteError::generic(&error).into());
        }
        if response.results.len() != expected {
            return Err(EncodingError::DecodeFailed(format!(
                "response has {} results for {expected} calls",
                response.results.len()
            ))
            .into());
        }

        Ok(response
            .results
            .into_iter()
            .map(|result| self.resolve(result))
            .collect())
    }

    /// Turn a procedure result into its value or its mapped error.
    pub(crate) fn resolve(&self, result: schema::ProcedureResult) -> Result<Bytes> {
        match result.error {
            Some(error) => Err(self.build_error(&error).into()),
            None => Ok(result.value),
        }
    }

    pub(crate) fn build_error(&self, error: &schema::Error) -> RemoteError {
        let remote = self.errors.build(error);
        debug!(service = %error.service, name = %error.name, "procedure failed");
        remote
    }

    pub fn is_connected(&self) -> bool {
        self.transport.lock().is_connected()
    }

    /// Close the connection. A call blocked on the server fails instead of
    /// holding the call lock forever.
    pub fn close(&self) {
        if let Some(closer) = &self.closer {
            closer();
        }
        self.transport.lock().close();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("errors", &self.errors)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}
