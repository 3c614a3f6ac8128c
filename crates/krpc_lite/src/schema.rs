//! Protocol messages exchanged with the server.
//!
//! These mirror the server's protobuf schema field for field, so they are
//! declared with `prost` derives rather than generated from a `.proto` file.

use bytes::Bytes;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionRequest {
    #[prost(enumeration = "connection_request::Type", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub client_name: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub client_identifier: Bytes,
}

pub mod connection_request {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Rpc = 0,
        Stream = 1,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionResponse {
    #[prost(enumeration = "connection_response::Status", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub client_identifier: Bytes,
}

pub mod connection_response {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Ok = 0,
        MalformedMessage = 1,
        Timeout = 2,
        WrongType = 3,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(message, repeated, tag = "1")]
    pub calls: Vec<ProcedureCall>,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct ProcedureCall {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub procedure: String,
    #[prost(message, repeated, tag = "3")]
    pub arguments: Vec<Argument>,
    #[prost(uint32, tag = "4")]
    pub service_id: u32,
    #[prost(uint32, tag = "5")]
    pub procedure_id: u32,
}

impl ProcedureCall {
    /// Build a call whose arguments are positioned in order.
    pub fn new<I>(service: impl Into<String>, procedure: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        Self {
            service: service.into(),
            procedure: procedure.into(),
            arguments: args
                .into_iter()
                .enumerate()
                .map(|(position, value)| Argument {
                    position: position as u32,
                    value,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// `Service.Procedure`, for logs and error messages.
    pub fn path(&self) -> String {
        format!("{}.{}", self.service, self.procedure)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Argument {
    #[prost(uint32, tag = "1")]
    pub position: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub error: Option<Error>,
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<ProcedureResult>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProcedureResult {
    #[prost(message, optional, tag = "1")]
    pub error: Option<Error>,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

impl ProcedureResult {
    pub fn value(value: Bytes) -> Self {
        Self { error: None, value }
    }

    pub fn error(error: Error) -> Self {
        Self {
            error: Some(error),
            value: Bytes::new(),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Error {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(string, tag = "4")]
    pub stack_trace: String,
}

impl Error {
    /// An error with no service or name; clients report it as a generic RPC error.
    pub fn generic(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn typed(
        service: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            description: description.into(),
            stack_trace: String::new(),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamUpdate {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<StreamResult>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamResult {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, optional, tag = "2")]
    pub result: Option<ProcedureResult>,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Stream {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

/// A server-side event, delivered as a stream of bools.
#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Event {
    #[prost(message, optional, tag = "1")]
    pub stream: Option<Stream>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct List {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub items: Vec<Bytes>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Set {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub items: Vec<Bytes>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Tuple {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub items: Vec<Bytes>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Dictionary {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<DictionaryEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DictionaryEntry {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}
