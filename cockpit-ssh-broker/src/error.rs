use std::error::Error;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("no session for channel {0:?}")]
    UnknownChannel(String),
    #[error("failed to spawn relay process")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl BrokerError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
