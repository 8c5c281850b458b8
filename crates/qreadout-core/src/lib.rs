//! Qreadout Core - stream demultiplexing, averaging, and correlation
//!
//! This library is the data-reduction core of a digitizer readout front end.
//! Tagged packet buffers from the hardware delivery path are routed by
//! logical stream into running-average accumulators, N-body correlators,
//! or raw record queues, while a client thread polls for completion and
//! pulls snapshots out.

pub mod acquisition;
pub mod error;
pub mod stats;
pub mod stream;

pub use acquisition::engine::{DeliveryHandle, DeliveryPort, Digitizer, WAIT_POLL_INTERVAL};
pub use acquisition::packet::TaggedBuffer;
pub use acquisition::queue::RecordQueue;
pub use acquisition::router::StreamRouter;
pub use acquisition::settings::{AcquisitionSettings, DigitizerMode};
pub use acquisition::synth::SyntheticSource;
pub use error::{DigitizerError, Result};
pub use stats::{accumulator::Accumulator, correlator::Correlator};
pub use stream::combinations::combinations;
pub use stream::identity::{ChannelTriple, Stream, StreamId, StreamType};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (YYYY-MM-DD), stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Shortest accepted record length in raw ADC samples
pub const MIN_RECORD_LENGTH: usize = 128;

/// Longest accepted record length (keeps raw packets within 4096 words)
pub const MAX_RECORD_LENGTH: usize = 16384;

/// Record lengths must be a multiple of this so decimated demod streams line up
pub const RECORD_LENGTH_GRANULARITY: usize = 128;

/// Decimation between ADC samples and the raw (PHYSICAL) stream
pub const RAW_DECIMATION_FACTOR: usize = 4;

/// Decimation between ADC samples and demodulated (DEMOD) streams
pub const DEMOD_DECIMATION_FACTOR: usize = 32;

/// Correlators are built for every combination of 2..=this many result streams
pub const DEFAULT_MAX_CORRELATION_ARITY: usize = 2;

/// Raw kernel integrators per module when the caller supplies no count
pub const DEFAULT_RAW_INTEGRATORS: u32 = 2;
