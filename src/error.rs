use std::io;

use krpc_lite::EncodingError;
use thiserror::Error;

/// Errors that end a server task.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error("server I/O error")]
    Io(#[from] io::Error),

    /// A frame or message on the wire could not be decoded.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The peer sent an unusable connection request.
    #[error("handshake rejected: {0}")]
    Handshake(String),
}

/// A failed procedure call, reported to the client inside its result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcedureError {
    /// Reported without a service or name, so clients see a plain RPC error.
    #[error("{0}")]
    Generic(String),

    /// An exception the client may map to its own error type.
    #[error("{service}.{name}: {description}")]
    Typed {
        service: &'static str,
        name: &'static str,
        description: String,
    },

    #[error("invalid argument: {0}")]
    Argument(#[from] EncodingError),
}

impl ProcedureError {
    pub fn generic(description: impl Into<String>) -> Self {
        ProcedureError::Generic(description.into())
    }

    pub fn argument_exception(description: impl Into<String>) -> Self {
        ProcedureError::Typed {
            service: "",
            name: "ArgumentException",
            description: description.into(),
        }
    }

    pub fn to_schema(&self) -> krpc_lite::schema::Error {
        use krpc_lite::schema::Error;

        match self {
            ProcedureError::Generic(description) => Error::generic(description.clone()),
            ProcedureError::Typed {
                service,
                name,
                description,
            } => Error::typed(*service, *name, description.clone()),
            ProcedureError::Argument(e) => Error::generic(format!("invalid argument: {e}")),
        }
    }
}
