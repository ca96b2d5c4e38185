use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("aead seal failed: {0}")]
    SealFailed(String),
    #[error("aead open failed: {0}")]
    OpenFailed(String),
    #[error("protocol: {0}")]
    Protocol(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
