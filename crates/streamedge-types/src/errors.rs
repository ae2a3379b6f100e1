use std::error::Error;
use std::fmt::{Display, Formatter};

/// Flat error taxonomy for the streaming pipeline. Background loops never propagate
/// these upward; only `QueryService` and config validation surface them to a caller.
#[derive(Debug, Clone)]
pub enum StreamError {
    DecodeError(String),
    MissingField(String),
    ConnectionLost(String),
    BackpressureDropped(String),
    QueryTimeout,
    Validation { field: Option<String>, message: String },
    InitError(String),
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::DecodeError(msg) => write!(f, "failed to decode event: {msg}"),
            StreamError::MissingField(field) => {
                write!(f, "event missing required scoping field: {field}")
            }
            StreamError::ConnectionLost(msg) => write!(f, "bus connection lost: {msg}"),
            StreamError::BackpressureDropped(reason) => {
                write!(f, "event dropped under backpressure: {reason}")
            }
            StreamError::QueryTimeout => write!(f, "query exceeded its deadline"),
            StreamError::Validation { field, message } => match field {
                Some(field) => write!(f, "invalid value for {field}: {message}"),
                None => write!(f, "invalid query: {message}"),
            },
            StreamError::InitError(stage) => write!(f, "failed to initialize {stage}"),
        }
    }
}

impl Error for StreamError {}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        StreamError::ConnectionLost(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::DecodeError(err.to_string())
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
