use thiserror::Error;

use shm::ShmError;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("invalid bridge configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}
