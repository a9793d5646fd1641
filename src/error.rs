use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("server rejected request ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("not permitted: {0}")]
    Forbidden(String),
    #[error("server rejected mutation: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeasurementError {
    #[error("invalid height {height} reported for {key}")]
    InvalidHeight { key: String, height: f64 },
    #[error("no row registered for {0}")]
    UnknownKey(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaybackError {
    #[error("media source missing for {0}")]
    MissingSource(String),
    #[error("media failed to load: {0}")]
    LoadFailed(String),
    #[error("{0} is not playable")]
    Unplayable(String),
}
