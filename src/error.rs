use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("Initialization error: {0}")]
    InitError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),
    #[error("Process error: {0}")]
    ProcessError(String),
    #[error("{size} processes is not enough for this dispatcher")]
    NotEnoughProcesses { size: i32 },
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl From<bincode::Error> for DispatchError {
    fn from(e: bincode::Error) -> Self {
        DispatchError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
