//! Qreadout - data-reduction front end for multi-channel digitizer readout
//!
//! This library re-exports the stream routing, averaging, correlation and
//! record-queue machinery from `qreadout-core`.
//!
//! The REST control surface lives in `qreadout-server`.

pub use qreadout_core::acquisition;
pub use qreadout_core::stats;
pub use qreadout_core::stream;

pub use qreadout_core::{
    combinations, Accumulator, AcquisitionSettings, ChannelTriple, Correlator, DeliveryHandle,
    DeliveryPort, Digitizer, DigitizerError, DigitizerMode, RecordQueue, Stream, StreamId,
    StreamRouter, StreamType, SyntheticSource, TaggedBuffer, WAIT_POLL_INTERVAL,
};
pub use qreadout_core::{
    BUILD_DATE, DEFAULT_MAX_CORRELATION_ARITY, MAX_RECORD_LENGTH, MIN_RECORD_LENGTH,
    RECORD_LENGTH_GRANULARITY, VERSION,
};
