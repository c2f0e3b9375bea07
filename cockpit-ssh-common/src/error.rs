use std::error::Error;

#[derive(thiserror::Error, Debug)]
pub enum CommonError {
    #[error("invalid target specifier: {0}")]
    InvalidTarget(String),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl CommonError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
