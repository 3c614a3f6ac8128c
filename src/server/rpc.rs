use std::sync::Arc;

use krpc_lite::ClientId;
use krpc_lite::connection::MAX_CLIENT_NAME_LEN;
use krpc_lite::schema::{
    self, ConnectionRequest, Request, Response, connection_request, connection_response::Status,
};
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ClientSession, ServerState, read_message, refuse, respond, write_message};
use crate::error::ServerError;
use crate::service::Services;

pub(super) async fn serve_rpc(socket: TcpStream, state: Arc<ServerState>) -> Result<(), ServerError> {
    socket.set_nodelay(true)?;
    let peer = socket.peer_addr()?;
    let max_size = state.config.max_message_size;
    let (mut reader, mut writer) = socket.into_split();

    let Some(request) = read_message::<_, ConnectionRequest>(&mut reader, max_size).await? else {
        return Ok(());
    };
    if request.r#type() != connection_request::Type::Rpc {
        return Err(refuse(&mut writer, Status::WrongType, "expected an RPC connection request").await);
    }
    if request.client_name.len() > MAX_CLIENT_NAME_LEN {
        return Err(refuse(&mut writer, Status::MalformedMessage, "client name is too long").await);
    }

    let id = ClientId::from(Uuid::new_v4());
    let session = Arc::new(ClientSession::new(id, request.client_name));
    let _guard = state.clients.register(Arc::clone(&session));
    respond(&mut writer, Status::Ok, "", Some(id)).await?;
    info!(client_id = %id, name = %session.name(), peer = %peer, "client connected");

    while let Some(request) = read_message::<_, Request>(&mut reader, max_size).await? {
        let response = handle_request(&state.services, &session, &request);
        write_message(&mut writer, &response).await?;
    }

    info!(client_id = %id, "client disconnected");
    Ok(())
}

fn handle_request(services: &Services, session: &ClientSession, request: &Request) -> Response {
    if request.calls.is_empty() {
        return Response {
            error: Some(schema::Error::generic("Request contains no calls")),
            results: Vec::new(),
        };
    }
    debug!(client_id = %session.id(), calls = request.calls.len(), "request");
    Response {
        error: None,
        results: request
            .calls
            .iter()
            .map(|call| services.dispatch(session, call))
            .collect(),
    }
}
