//! Error taxonomy: one top-level error wrapping per-component error enums
//! via `#[from]`, plus `severity()`/`is_recoverable()` so a single `tracing`
//! call at the boundary gets the right log level.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UstreamerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("memory sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("stream server error: {0}")]
    Stream(#[from] StreamError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("capture source offline")]
    Offline,
    #[error("capture source not available: {0}")]
    NotAvailable(String),
}

#[derive(Error, Debug, Clone)]
pub enum EncoderError {
    #[error("unknown encoder type: {0}")]
    UnknownType(String),
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    #[error("encoder backend not available: {0}")]
    NotAvailable(String),
}

#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("invalid object name: {0}")]
    InvalidObject(String),
    #[error("failed to open shared memory: {0}")]
    OpenFailed(String),
    #[error("failed to truncate shared memory: {0}")]
    TruncateFailed(String),
    #[error("failed to map shared memory: {0}")]
    MapFailed(String),
    #[error("sink is busy")]
    Busy,
    #[error("no new data")]
    NoData,
    #[error("protocol version mismatch: sink={sink}, expected={expected}")]
    ProtocolMismatch { sink: u32, expected: u32 },
    #[error("lock error: {0}")]
    LockFailed(String),
}

#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("failed to bind {addr}: {details}")]
    BindFailed { addr: String, details: String },
    #[error("client transport error: {0}")]
    ClientTransport(String),
}

/// Log severity bucket, independent of `tracing::Level` so callers can map
/// it without importing `tracing` into every error site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            ErrorSeverity::Info => tracing::Level::INFO,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Critical => tracing::Level::ERROR,
        }
    }
}

impl UstreamerError {
    /// Per : `SinkBusy`/`SinkNoData` are expected and recoverable;
    /// `InvalidConfig` is fatal; everything else defaults to recoverable
    /// per-component handling (log and continue).
    pub fn is_recoverable(&self) -> bool {
        match self {
            UstreamerError::InvalidConfig(_) => false,
            UstreamerError::Shutdown => false,
            UstreamerError::Sink(SinkError::Busy) | UstreamerError::Sink(SinkError::NoData) => {
                true
            }
            UstreamerError::Capture(_) => true,
            UstreamerError::Encoder(_) => true,
            UstreamerError::Stream(StreamError::ClientTransport(_)) => true,
            _ => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            UstreamerError::InvalidConfig(_) => ErrorSeverity::Critical,
            UstreamerError::Shutdown => ErrorSeverity::Info,
            UstreamerError::Sink(SinkError::Busy) | UstreamerError::Sink(SinkError::NoData) => {
                ErrorSeverity::Info
            }
            UstreamerError::Sink(SinkError::ProtocolMismatch { .. }) => ErrorSeverity::Warning,
            UstreamerError::Capture(CaptureError::Offline) => ErrorSeverity::Warning,
            UstreamerError::Stream(StreamError::ClientTransport(_)) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, UstreamerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_busy_and_no_data_are_recoverable_info() {
        let busy = UstreamerError::Sink(SinkError::Busy);
        assert!(busy.is_recoverable());
        assert_eq!(busy.severity(), ErrorSeverity::Info);

        let no_data = UstreamerError::Sink(SinkError::NoData);
        assert!(no_data.is_recoverable());
        assert_eq!(no_data.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn invalid_config_is_fatal() {
        let e = UstreamerError::InvalidConfig("bad port".into());
        assert!(!e.is_recoverable());
        assert_eq!(e.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn protocol_mismatch_is_a_warning() {
        let e = UstreamerError::Sink(SinkError::ProtocolMismatch {
            sink: 1,
            expected: 2,
        });
        assert_eq!(e.severity(), ErrorSeverity::Warning);
    }
}
