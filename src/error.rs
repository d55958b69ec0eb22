// src/error.rs
use std::io;

/// Central error type for the petrel engine.
#[derive(Debug)]
pub enum PetrelError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Request bytes that could not be parsed.
    Parse(String),
    /// Task queue rejected a submission at capacity.
    QueueFull,
    /// Connection slab reached its maximum capacity.
    SlabFull,
    /// Bad configuration file or value.
    Config(String),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for PetrelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PetrelError::Io(e) => write!(f, "I/O error: {}", e),
            PetrelError::Parse(msg) => write!(f, "parse error: {}", msg),
            PetrelError::QueueFull => write!(f, "task queue is full"),
            PetrelError::SlabFull => write!(f, "connection slab is full"),
            PetrelError::Config(msg) => write!(f, "config error: {}", msg),
            PetrelError::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for PetrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PetrelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PetrelError {
    fn from(e: io::Error) -> Self {
        PetrelError::Io(e)
    }
}

pub type PetrelResult<T> = Result<T, PetrelError>;
