use thiserror::Error;

/// The capture device could not produce a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

/// A pixel buffer whose shape does not match its declared dimensions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("malformed pixel buffer: expected {expected} bytes, got {actual}")]
    Format { expected: usize, actual: usize },
    #[error("unsupported channel count {0} (expected 3 or 4)")]
    Channels(usize),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("audio query failed: {0}")]
    Query(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger source failed: {0}")]
    Source(String),
}

/// Anything a background worker iteration can fail with.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error("{0} panicked")]
    Panicked(&'static str),
}
