//! Error taxonomy for the digitizer core

use crate::stream::identity::StreamId;
use thiserror::Error;

/// Errors that can occur while configuring, feeding, or reading the digitizer
#[derive(Error, Debug)]
pub enum DigitizerError {
    #[error("Record length of {0} too short; minimum is {min}", min = crate::MIN_RECORD_LENGTH)]
    RecordLengthTooShort(usize),

    #[error("Record length of {0} too long; maximum is {max}", max = crate::MAX_RECORD_LENGTH)]
    RecordLengthTooLong(usize),

    #[error("Record length of {0} is not a multiple of {g}", g = crate::RECORD_LENGTH_GRANULARITY)]
    RecordLengthGranularity(usize),

    #[error("Invalid acquisition settings: {0}")]
    InvalidSettings(String),

    #[error("Channel triple {0} does not fit a stream ID (sub-channel and result must be 0-15)")]
    InvalidChannel(String),

    #[error("Stream {0} is not enabled")]
    StreamNotEnabled(StreamId),

    #[error("No correlator for stream set {0:?}")]
    UnknownCorrelator(Vec<StreamId>),

    #[error("No {kind} stream at filter position {position}")]
    UnknownFilterPosition { kind: String, position: usize },

    #[error("Operation not available in {0} mode")]
    ModeError(String),

    #[error("Acquisition has not been armed")]
    NotArmed,

    #[error("Acquisition is running")]
    Busy,

    #[error("Record size mismatch for stream {sid}: expected {expected} samples, got {actual}")]
    RecordSize {
        sid: StreamId,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed buffer: {len} bytes is not a whole number of {width}-byte samples")]
    MalformedBuffer { len: usize, width: usize },

    #[error("Record queue for stream {0} is full")]
    QueueOverflow(StreamId),

    #[error("I/O failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Settings file is not valid JSON: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("Insufficient number of records were taken before the {0:?} timeout")]
    Timeout(std::time::Duration),

    #[error("Lock poisoned for stream {0}")]
    LockPoisoned(StreamId),
}

impl DigitizerError {
    /// True for errors raised by record-length or settings validation
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::RecordLengthTooShort(_)
                | Self::RecordLengthTooLong(_)
                | Self::RecordLengthGranularity(_)
                | Self::InvalidSettings(_)
                | Self::InvalidChannel(_)
        )
    }

    /// True for errors caused by addressing a stream or stream set that does not exist
    pub fn is_addressing(&self) -> bool {
        matches!(
            self,
            Self::StreamNotEnabled(_)
                | Self::UnknownCorrelator(_)
                | Self::UnknownFilterPosition { .. }
        )
    }
}

/// Result alias used throughout the core
pub type Result<T> = std::result::Result<T, DigitizerError>;
