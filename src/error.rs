//! Error types for hvport

use hvport_protocol::{ProtocolError, Status};
use thiserror::Error;

use crate::engine::EngineError;

/// Result type alias using hvport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a control request or managing a session
#[derive(Error, Debug)]
pub enum Error {
    /// A VM or VCPU descriptor did not resolve to a live object
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(i32),

    /// Request on a session that has already been closed
    #[error("Session {0} is closed")]
    SessionClosed(u64),

    /// A memory-map slot index is out of range
    #[error("Memory-map slot {slot} out of range (max {max})")]
    SlotOutOfRange { slot: u32, max: u32 },

    /// No free resource slot, engine capacity, or pinnable memory
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A buffer length does not match what the request requires
    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Unknown control code
    #[error("Unsupported request: {0:#x}")]
    UnsupportedRequest(u32),

    /// The virtualization engine returned a failure
    #[error("Engine error: {0}")]
    Engine(EngineError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lifecycle module failed to come up
    #[error("Module {module} failed: {reason}")]
    Module { module: &'static str, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidDescriptor(_) | Error::SessionClosed(_) => Status::InvalidDescriptor,
            Error::SlotOutOfRange { .. } => Status::SlotOutOfRange,
            Error::ResourceExhausted(_) => Status::ResourceExhausted,
            Error::LengthMismatch { .. } => Status::LengthMismatch,
            Error::UnsupportedRequest(_) => Status::UnsupportedRequest,
            Error::Engine(_) | Error::Config(_) | Error::Module { .. } | Error::Io(_) => {
                Status::EngineError
            }
        }
    }
}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Exhausted | EngineError::NoMemory => Error::ResourceExhausted(e.to_string()),
            e => Error::Engine(e),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Truncated { expected, actual } => {
                Error::LengthMismatch { expected, actual }
            }
            ProtocolError::UnknownControlCode(code) => Error::UnsupportedRequest(code),
            ProtocolError::UnknownStatus(code) => {
                Error::Config(format!("unknown status value {:#x}", code))
            }
        }
    }
}
