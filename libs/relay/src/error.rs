use std::io;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::ValidationError;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("io {0}")]
    Io(#[from] std::io::Error),
    #[error("serial {0}")]
    Serial(#[from] serialport::Error),
    #[error("json {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml parsing failed {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid sample {0}")]
    Validation(#[from] ValidationError),
    #[error("input stream closed")]
    StreamClosed,
    #[error("ingestion task panicked")]
    TaskPanicked,
}

impl Error {
    pub fn is_stream_closed(&self) -> bool {
        match self {
            Error::StreamClosed => true,
            Error::Io(err)
                if err.kind() == io::ErrorKind::BrokenPipe
                    || err.kind() == io::ErrorKind::ConnectionReset
                    || err.kind() == io::ErrorKind::UnexpectedEof =>
            {
                true
            }
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub description: String,
}

impl From<Error> for ErrorResponse {
    fn from(val: Error) -> Self {
        ErrorResponse {
            description: val.to_string(),
        }
    }
}

impl From<ValidationError> for ErrorResponse {
    fn from(val: ValidationError) -> Self {
        ErrorResponse {
            description: val.to_string(),
        }
    }
}
