//! The built-in `KRPC` service.

use bytes::Bytes;
use krpc_lite::codec::{WireValue, decode_message, encode_message};
use krpc_lite::schema::{self, ProcedureCall};
use tracing::debug;

use super::{Args, ProcedureOutcome, Services, not_found};
use crate::error::ProcedureError;
use crate::server::ClientSession;

pub(super) const SERVICE: &str = krpc_lite::krpc::SERVICE;

pub(super) const PROCEDURES: &[&str] = &[
    "GetClientID",
    "GetClientName",
    "AddStream",
    "AddEvent",
    "StartStream",
    "SetStreamRate",
    "RemoveStream",
];

/// Encode an event backed by stream `id`.
pub(super) fn event(id: u64) -> Bytes {
    encode_message(&schema::Event {
        stream: Some(schema::Stream { id }),
    })
}

fn no_stream(id: u64) -> ProcedureError {
    ProcedureError::argument_exception(format!("No stream with id {id}"))
}

pub(super) fn call(
    services: &Services,
    session: &ClientSession,
    call: &ProcedureCall,
    args: Args<'_>,
) -> ProcedureOutcome {
    match call.procedure.as_str() {
        "GetClientID" => Ok(Bytes::copy_from_slice(session.id().as_bytes()).to_bytes()),
        "GetClientName" => Ok(session.name().to_string().to_bytes()),
        "AddStream" => {
            let target: ProcedureCall = decode_message(args.raw_bytes(0)?)?;
            let start = args.get_or(1, true)?;
            if !services.exists(&target) {
                return Err(not_found(&target));
            }
            let path = target.path();
            let id = session.streams().add(target, start);
            debug!(client_id = %session.id(), stream_id = id, procedure = %path, "stream added");
            Ok(encode_message(&schema::Stream { id }))
        }
        "AddEvent" => {
            let target: ProcedureCall = decode_message(args.raw_bytes(0)?)?;
            if !services.exists(&target) {
                return Err(not_found(&target));
            }
            let path = target.path();
            let id = session.streams().add_event(target);
            debug!(client_id = %session.id(), stream_id = id, procedure = %path, "event added");
            Ok(event(id))
        }
        "StartStream" => {
            let id: u64 = args.get(0)?;
            if !session.streams().start(id) {
                return Err(no_stream(id));
            }
            Ok(Bytes::new())
        }
        "SetStreamRate" => {
            let id: u64 = args.get(0)?;
            let rate: f32 = args.get(1)?;
            if !rate.is_finite() || rate < 0.0 {
                return Err(ProcedureError::argument_exception(format!(
                    "Invalid stream rate {rate}"
                )));
            }
            if !session.streams().set_rate(id, rate) {
                return Err(no_stream(id));
            }
            Ok(Bytes::new())
        }
        "RemoveStream" => {
            let id: u64 = args.get(0)?;
            if !session.streams().remove(id) {
                return Err(no_stream(id));
            }
            debug!(client_id = %session.id(), stream_id = id, "stream removed");
            Ok(Bytes::new())
        }
        _ => Err(not_found(call)),
    }
}

#[cfg(test)]
mod tests {
    use krpc_lite::ClientId;
    use uuid::Uuid;

    use super::*;

    fn session() -> ClientSession {
        ClientSession::new(ClientId::from(Uuid::new_v4()), "tester")
    }

    fn add_stream(services: &Services, session: &ClientSession, target: &ProcedureCall) -> u64 {
        let call = ProcedureCall::new(
            SERVICE,
            "AddStream",
            [encode_message(target), false.to_bytes()],
        );
        let value = services.call(session, &call).unwrap();
        decode_message::<schema::Stream>(&value).unwrap().id
    }

    #[test]
    fn test_client_name_and_id() {
        let services = Services::new();
        let session = session();
        let name = services
            .call(&session, &ProcedureCall::new(SERVICE, "GetClientName", []))
            .unwrap();
        assert_eq!(String::decode(&name).unwrap(), "tester");

        let id = services
            .call(&session, &ProcedureCall::new(SERVICE, "GetClientID", []))
            .unwrap();
        assert_eq!(&Bytes::decode(&id).unwrap()[..], session.id().as_bytes());
    }

    #[test]
    fn test_add_stream_dedupes() {
        let services = Services::new();
        let session = session();
        let target = ProcedureCall::new("TestService", "Counter", []);
        let a = add_stream(&services, &session, &target);
        let b = add_stream(&services, &session, &target);
        assert_eq!(a, b);
        assert_eq!(session.streams().len(), 1);
    }

    #[test]
    fn test_add_stream_rejects_unknown_procedure() {
        let services = Services::new();
        let session = session();
        let target = ProcedureCall::new("TestService", "Missing", []);
        let call = ProcedureCall::new(SERVICE, "AddStream", [encode_message(&target)]);
        let err = services.call(&session, &call).unwrap_err();
        assert!(matches!(err, ProcedureError::Generic(_)));
    }

    #[test]
    fn test_set_stream_rate_rejects_invalid_rates() {
        let services = Services::new();
        let session = session();
        let counter = ProcedureCall::new("TestService", "Counter", []);
        let id = add_stream(&services, &session, &counter);
        let set_rate = |rate: f32| {
            ProcedureCall::new(SERVICE, "SetStreamRate", [id.to_bytes(), rate.to_bytes()])
        };
        for rate in [f32::NAN, f32::INFINITY, -1.0] {
            let call = set_rate(rate);
            let error = services.dispatch(&session, &call).error.unwrap();
            assert_eq!(error.name, "ArgumentException");
        }

        assert!(services.call(&session, &set_rate(1e-30)).is_ok());
    }

    #[test]
    fn test_add_event_creates_a_separate_stream() {
        let services = Services::new();
        let session = session();
        let target = ProcedureCall::new("TestService", "Counter", []);
        let stream = add_stream(&services, &session, &target);

        let call = ProcedureCall::new(SERVICE, "AddEvent", [encode_message(&target)]);
        let value = services.call(&session, &call).unwrap();
        let event = decode_message::<schema::Event>(&value).unwrap().stream.unwrap();
        assert_ne!(event.id, stream);
        assert_eq!(session.streams().len(), 2);

        let missing = ProcedureCall::new("TestService", "Missing", []);
        let call = ProcedureCall::new(SERVICE, "AddEvent", [encode_message(&missing)]);
        assert!(services.call(&session, &call).is_err());
    }

    #[test]
    fn test_unknown_stream_id() {
        let services = Services::new();
        let session = session();
        let call = ProcedureCall::new(SERVICE, "RemoveStream", [9u64.to_bytes()]);
        let result = services.dispatch(&session, &call);
        let error = result.error.unwrap();
        assert_eq!(error.name, "ArgumentException");
    }
}
