use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("lease lost")]
    LeaseLost,
}

pub type Result<T> = std::result::Result<T, Error>;
