//! An async server speaking the client's wire protocol.
//!
//! The server listens on two ports. An RPC connection handshakes, receives a
//! fresh client identifier and then exchanges framed `Request`/`Response`
//! pairs. A stream connection handshakes with that identifier and receives
//! `StreamUpdate` frames on every tick in which a started stream changed.

mod codec;
mod config;
mod rpc;
mod session;
mod stream;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use krpc_lite::ClientId;
use krpc_lite::schema::{ConnectionResponse, connection_response};
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::error::ServerError;
use crate::service::Services;

pub use codec::{read_message, write_message};
pub use config::ServerConfig;
pub use session::{ClientGuard, ClientMap, ClientSession, StreamTable};

/// State shared by every connection task.
#[derive(Debug)]
pub(crate) struct ServerState {
    config: ServerConfig,
    clients: Arc<ClientMap>,
    services: Services,
}

/// Answer a connection request.
async fn respond<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: connection_response::Status,
    message: &str,
    id: Option<ClientId>,
) -> Result<(), ServerError> {
    let response = ConnectionResponse {
        status: status as i32,
        message: message.to_string(),
        client_identifier: id
            .map(|id| Bytes::copy_from_slice(id.as_bytes()))
            .unwrap_or_default(),
    };
    write_message(writer, &response).await
}

/// Reply with `status` and fail the handshake.
async fn refuse<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: connection_response::Status,
    message: &str,
) -> ServerError {
    if let Err(e) = respond(writer, status, message, None).await {
        return e;
    }
    ServerError::Handshake(message.to_string())
}

/// A bound server, ready to [`run`](Self::run).
pub struct TestServer {
    rpc: TcpListener,
    stream: TcpListener,
    rpc_addr: SocketAddr,
    stream_addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let rpc = TcpListener::bind(config.rpc_addr()).await?;
        let stream = TcpListener::bind(config.stream_addr()).await?;
        let rpc_addr = rpc.local_addr()?;
        let stream_addr = stream.local_addr()?;

        info!(rpc = %rpc_addr, stream = %stream_addr, "server listening");

        Ok(Self {
            rpc,
            stream,
            rpc_addr,
            stream_addr,
            state: Arc::new(ServerState {
                config,
                clients: Arc::new(ClientMap::new()),
                services: Services::new(),
            }),
        })
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    /// Clients whose RPC connection is open.
    pub fn clients(&self) -> Arc<ClientMap> {
        Arc::clone(&self.state.clients)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes. Connections already
    /// accepted keep running until their clients leave.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accepted = self.rpc.accept() => {
                    self.spawn_connection(accepted, "rpc", rpc::serve_rpc);
                }
                accepted = self.stream.accept() => {
                    self.spawn_connection(accepted, "stream", stream::serve_stream);
                }
            }
        }
    }

    fn spawn_connection<F, Fut>(
        &self,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
        kind: &'static str,
        serve: F,
    ) where
        F: FnOnce(TcpStream, Arc<ServerState>) -> Fut,
        Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(kind, error = %e, "failed to accept connection");
                return;
            }
        };
        let task = serve(socket, Arc::clone(&self.state));
        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!(kind, peer = %peer, error = %e, "connection ended with error");
            }
        });
    }
}
