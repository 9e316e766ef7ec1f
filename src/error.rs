use thiserror::Error;

use crate::client::ClientError;

/// Gateway-level failure with a closed set of kinds.
///
/// These are the conditions the gateway itself produces: the pool being
/// drained, a per-operation deadline firing, or an operation reaching a
/// session handle that was already settled. Everything the broker answers
/// with travels as [`Error::Client`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error("no brokers available")]
    NoBrokers,

    #[error("read timeout")]
    ReadTimeout,

    #[error("write timeout")]
    WriteTimeout,

    #[error("offset commit timeout")]
    OffsetCommitTimeout,

    #[error("offset fetch timeout")]
    OffsetFetchTimeout,

    #[error("read from closed consumer")]
    ConsumerClosed,

    #[error("write to closed producer")]
    ProducerClosed,

    #[error("closed offset coordinator")]
    OffsetCoordinatorClosed,

    #[error("metadata read timeout")]
    MetadataReadTimeout,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    App(#[from] AppError),

    #[error("broker client error: {0}")]
    Client(#[from] ClientError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
