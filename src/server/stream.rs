use std::sync::Arc;
use std::time::Instant;

use krpc_lite::ClientId;
use krpc_lite::schema::{
    ConnectionRequest, StreamResult, StreamUpdate, connection_request, connection_response::Status,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::{ClientSession, ServerState, read_message, refuse, respond, write_message};
use crate::error::ServerError;
use crate::service::Services;

pub(super) async fn serve_stream(
    socket: TcpStream,
    state: Arc<ServerState>,
) -> Result<(), ServerError> {
    socket.set_nodelay(true)?;
    let max_size = state.config.max_message_size;
    let (mut reader, mut writer) = socket.into_split();

    let Some(request) = read_message::<_, ConnectionRequest>(&mut reader, max_size).await? else {
        return Ok(());
    };
    if request.r#type() != connection_request::Type::Stream {
        return Err(refuse(&mut writer, Status::WrongType, "expected a stream connection request").await);
    }
    let session = ClientId::from_bytes(&request.client_identifier)
        .ok()
        .and_then(|id| state.clients.get(&id));
    let Some(session) = session else {
        return Err(refuse(&mut writer, Status::WrongType, "unknown client identifier").await);
    };
    respond(&mut writer, Status::Ok, "", None).await?;
    info!(client_id = %session.id(), "stream connection attached");

    let mut ticker = time::interval(state.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !state.clients.contains(&session.id()) {
                    break;
                }
                if let Some(update) = collect_updates(&state.services, &session, Instant::now()) {
                    trace!(client_id = %session.id(), results = update.results.len(), "stream update");
                    write_message(&mut writer, &update).await?;
                }
            }
            read = reader.read(&mut scratch) => {
                if read? == 0 {
                    break;
                }
                debug!(client_id = %session.id(), "ignoring data on stream connection");
            }
        }
    }

    info!(client_id = %session.id(), "stream connection closed");
    Ok(())
}

/// Evaluate every due stream and keep the results that changed.
fn collect_updates(
    services: &Services,
    session: &ClientSession,
    now: Instant,
) -> Option<StreamUpdate> {
    let due = session.streams().due(now);
    let mut results = Vec::new();
    for (id, call) in due {
        let result = services.dispatch(session, &call);
        if session.streams().record(id, &result, now) {
            results.push(StreamResult {
                id,
                result: Some(result),
            });
        }
    }
    (!results.is_empty()).then_some(StreamUpdate { results })
}

#[cfg(test)]
mod tests {
    use krpc_lite::codec::WireValue;
    use krpc_lite::schema::ProcedureCall;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_collect_updates_sends_changes_only() {
        let services = Services::new();
        let session = ClientSession::new(ClientId::from(Uuid::new_v4()), "tester");
        let counter = session
            .streams()
            .add(ProcedureCall::new("TestService", "Counter", []), true);
        let constant = session.streams().add(
            ProcedureCall::new("TestService", "Int32ToString", [5i32.to_bytes()]),
            true,
        );
        let idle = session.streams().add(
            ProcedureCall::new("TestService", "Int32ToString", [6i32.to_bytes()]),
            false,
        );

        let first = collect_updates(&services, &session, Instant::now()).unwrap();
        let ids: Vec<u64> = first.results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![counter, constant]);
        assert!(!ids.contains(&idle));

        let second = collect_updates(&services, &session, Instant::now()).unwrap();
        assert_eq!(second.results.len(), 1);
        assert_eq!(second.results[0].id, counter);
        let value = &second.results[0].result.as_ref().unwrap().value;
        assert_eq!(i32::decode(value).unwrap(), 2);
    }
}
