//! `TestService`: procedures exercising every wire type, errors and streams.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use krpc_lite::codec::{ObjectHandle, WireValue};
use krpc_lite::schema::ProcedureCall;

use super::{Args, ProcedureOutcome, Services, not_found};
use crate::error::ProcedureError;
use crate::server::ClientSession;

pub(super) const SERVICE: &str = "TestService";

pub(super) const PROCEDURES: &[&str] = &[
    "Int32ToString",
    "Int64ToString",
    "FloatToString",
    "DoubleToString",
    "BoolToString",
    "StringToInt32",
    "BytesToHexString",
    "AddMultipleValues",
    "IncrementList",
    "IncrementSet",
    "IncrementDictionary",
    "IncrementTuple",
    "Counter",
    "OnTimer",
    "TimerFired",
    "CreateTestObject",
    "TestObjectValue",
    "ThrowArgumentException",
    "ThrowCustomException",
];

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub(super) fn call(
    services: &Services,
    session: &ClientSession,
    call: &ProcedureCall,
    args: Args<'_>,
) -> ProcedureOutcome {
    let value = match call.procedure.as_str() {
        "Int32ToString" => args.get::<i32>(0)?.to_string().to_bytes(),
        "Int64ToString" => args.get::<i64>(0)?.to_string().to_bytes(),
        "FloatToString" => args.get::<f32>(0)?.to_string().to_bytes(),
        "DoubleToString" => args.get::<f64>(0)?.to_string().to_bytes(),
        "BoolToString" => {
            let text = if args.get::<bool>(0)? { "True" } else { "False" };
            text.to_string().to_bytes()
        }
        "StringToInt32" => {
            let text: String = args.get(0)?;
            let value: i32 = text.trim().parse().map_err(|_| {
                ProcedureError::argument_exception(format!("'{text}' is not an integer"))
            })?;
            value.to_bytes()
        }
        "BytesToHexString" => hex(&args.get::<Bytes>(0)?).to_bytes(),
        "AddMultipleValues" => {
            let x: f32 = args.get(0)?;
            let y: i32 = args.get(1)?;
            let z: i64 = args.get(2)?;
            (f64::from(x) + f64::from(y) + z as f64).to_bytes()
        }
        "IncrementList" => args
            .get::<Vec<i32>>(0)?
            .into_iter()
            .map(|x| x.wrapping_add(1))
            .collect::<Vec<_>>()
            .to_bytes(),
        "IncrementSet" => args
            .get::<BTreeSet<i32>>(0)?
            .into_iter()
            .map(|x| x.wrapping_add(1))
            .collect::<BTreeSet<_>>()
            .to_bytes(),
        "IncrementDictionary" => args
            .get::<BTreeMap<String, i32>>(0)?
            .into_iter()
            .map(|(key, value)| (key, value.wrapping_add(1)))
            .collect::<BTreeMap<_, _>>()
            .to_bytes(),
        "IncrementTuple" => {
            let (a, b): (i32, i64) = args.get(0)?;
            (a.wrapping_add(1), b.wrapping_add(1)).to_bytes()
        }
        "Counter" => {
            let key: String = args.get_or(0, String::new())?;
            let divisor: i32 = args.get_or(1, 1)?;
            if divisor == 0 {
                return Err(ProcedureError::argument_exception("divisor must not be zero"));
            }
            (session.increment_counter(&key) / divisor).to_bytes()
        }
        "OnTimer" => {
            let milliseconds: u32 = args.get(0)?;
            let repeats: u32 = args.get_or(1, 1)?;
            let timer = services.create_timer(Duration::from_millis(milliseconds.into()), repeats);
            let fired = ProcedureCall::new(
                SERVICE,
                "TimerFired",
                [ObjectHandle::new(timer).to_bytes()],
            );
            super::krpc::event(session.streams().add_event(fired))
        }
        "TimerFired" => {
            let handle: ObjectHandle = args.get(0)?;
            services
                .poll_timer(handle.id(), Instant::now())
                .ok_or_else(|| {
                    ProcedureError::argument_exception(format!("no timer with id {}", handle.id()))
                })?
                .to_bytes()
        }
        "CreateTestObject" => {
            let value: String = args.get(0)?;
            ObjectHandle::new(services.create_object(value)).to_bytes()
        }
        "TestObjectValue" => {
            let handle: ObjectHandle = args.get(0)?;
            if handle.is_null() {
                return Err(ProcedureError::argument_exception("object is null"));
            }
            services
                .object(handle.id())
                .ok_or_else(|| {
                    ProcedureError::argument_exception(format!("no object with id {}", handle.id()))
                })?
                .to_bytes()
        }
        "ThrowArgumentException" => {
            return Err(ProcedureError::argument_exception("Invalid argument"));
        }
        "ThrowCustomException" => {
            return Err(ProcedureError::Typed {
                service: SERVICE,
                name: "CustomException",
                description: "A custom kRPC exception".into(),
            });
        }
        _ => return Err(not_found(call)),
    };
    Ok(value)
}
