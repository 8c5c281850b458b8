//! Stream identity, type classification, and fixed-point scaling
//!
//! A stream is addressed by a channel triple `(module, sub, result)`:
//!
//! ```text
//! (a, 0, 0)  PHYSICAL    raw ADC samples of module a
//! (a, b, 0)  DEMOD       demodulated quadratures of virtual channel b
//! (a, 0, c)  RESULT      raw kernel integrator c       (c <= K)
//!            STATE       thresholded integrator        (K < c <= 2K)
//!            CORRELATED  correlator output             (c > 2K)
//! (a, b, c)  RESULT/STATE/CORRELATED under demod channel b (c = 1, 2, >2)
//! ```
//!
//! where `K` is the number of raw kernel integrators on the module.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Compact 16-bit stream identifier: `(a << 8) | (b << 4) | c`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u16);

impl StreamId {
    /// Pack a channel triple into a stream ID
    pub fn from_triple(triple: ChannelTriple) -> Self {
        let ChannelTriple { a, b, c } = triple;
        Self(((a as u16) << 8) | ((b as u16) << 4) | c as u16)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u16> for StreamId {
    fn from(sid: u16) -> Self {
        Self(sid)
    }
}

/// Channel address triple `(module, sub-channel, result)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelTriple {
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

impl ChannelTriple {
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self { a, b, c }
    }

    /// `b` and `c` each get four bits of the stream ID
    pub fn fits_stream_id(&self) -> bool {
        self.b <= 0xF && self.c <= 0xF
    }

    /// Reject triples whose stream ID would alias another triple's
    pub fn validate(self) -> crate::Result<Self> {
        if self.fits_stream_id() {
            Ok(self)
        } else {
            Err(crate::DigitizerError::InvalidChannel(self.to_string()))
        }
    }
}

impl fmt::Display for ChannelTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.a, self.b, self.c)
    }
}

impl std::str::FromStr for ChannelTriple {
    type Err = String;

    /// Parse `a.b.c`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected a.b.c, got '{}'", s));
        }
        let parse = |p: &str| {
            p.parse::<u8>()
                .map_err(|e| format!("invalid channel index '{}': {}", p, e))
        };
        let (a, b, c) = (parse(parts[0])?, parse(parts[1])?, parse(parts[2])?);
        let triple = Self { a, b, c };
        if !triple.fits_stream_id() {
            return Err(format!("channel triple '{}' does not fit a stream ID", s));
        }
        Ok(triple)
    }
}

/// Stream type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// Raw ADC samples
    Physical,
    /// Demodulated complex quadratures
    Demod,
    /// Integrated complex kernel results
    Result,
    /// Thresholded binary states
    State,
    /// Cross-stream correlator output
    Correlated,
}

impl StreamType {
    /// Every type, in delivery-filter order
    pub const ALL: [StreamType; 5] = [
        StreamType::Physical,
        StreamType::Demod,
        StreamType::Result,
        StreamType::State,
        StreamType::Correlated,
    ];

    /// Bytes per sample on the wire: 16-bit raw/demod, 32-bit for integrated types
    pub fn sample_width(self) -> usize {
        match self {
            StreamType::Physical | StreamType::Demod => 2,
            StreamType::Result | StreamType::State | StreamType::Correlated => 4,
        }
    }

    /// Real-valued streams carry one value per sample; the rest are I/Q pairs
    pub fn is_complex(self) -> bool {
        !matches!(self, StreamType::Physical)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamType::Physical => "physical",
            StreamType::Demod => "demod",
            StreamType::Result => "result",
            StreamType::State => "state",
            StreamType::Correlated => "correlated",
        };
        f.write_str(name)
    }
}

/// One logical data stream from the DSP module
///
/// Two streams with the same triple always compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub triple: ChannelTriple,
    pub id: StreamId,
    pub kind: StreamType,
}

impl Stream {
    /// Build a stream from its triple
    ///
    /// # Arguments
    /// * `num_raw_integrators` - raw kernel integrators on the module; sets the
    ///   RESULT / STATE / CORRELATED bands of the raw branch
    pub fn new(a: u8, b: u8, c: u8, num_raw_integrators: u32) -> Self {
        let triple = ChannelTriple::new(a, b, c);
        let kind = classify(triple, num_raw_integrators);
        Self {
            triple,
            id: StreamId::from_triple(triple),
            kind,
        }
    }

    /// Build a stream using [`crate::DEFAULT_RAW_INTEGRATORS`]
    pub fn from_triple(triple: ChannelTriple) -> Self {
        Self::new(triple.a, triple.b, triple.c, crate::DEFAULT_RAW_INTEGRATORS)
    }

    /// Power-of-two divisor from fixed-point samples to physical units
    pub fn fixed_to_float(&self) -> u32 {
        match self.kind {
            // signed 12-bit ADC samples summed over the raw decimation
            StreamType::Physical => 1 << 13,
            StreamType::Demod => 1 << 14,
            StreamType::Result | StreamType::Correlated => {
                if self.triple.b != 0 {
                    // NCO product carries extra fractional bits
                    1 << 19
                } else {
                    1 << 15
                }
            }
            StreamType::State => 1,
        }
    }

    /// Samples per record for this stream given the global ADC record length
    pub fn record_length(&self, record_length: usize) -> usize {
        match self.kind {
            StreamType::Physical => record_length / crate::RAW_DECIMATION_FACTOR,
            StreamType::Demod => 2 * record_length / crate::DEMOD_DECIMATION_FACTOR,
            StreamType::Result | StreamType::State | StreamType::Correlated => 2,
        }
    }
}

fn classify(triple: ChannelTriple, num_raw_integrators: u32) -> StreamType {
    let ChannelTriple { b, c, .. } = triple;
    let c = c as u32;
    match (b, c) {
        (0, 0) => StreamType::Physical,
        (_, 0) => StreamType::Demod,
        (0, c) => {
            let k = num_raw_integrators;
            if c <= k {
                StreamType::Result
            } else if c <= 2 * k {
                StreamType::State
            } else {
                StreamType::Correlated
            }
        }
        // one kernel integrator per demodulated channel
        (_, 1) => StreamType::Result,
        (_, 2) => StreamType::State,
        _ => StreamType::Correlated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_packing() {
        assert_eq!(Stream::new(1, 0, 0, 2).id, StreamId(0x100));
        assert_eq!(Stream::new(1, 2, 3, 2).id, StreamId(0x123));
        assert_eq!(Stream::new(2, 15, 15, 2).id, StreamId(0x2FF));
    }

    #[test]
    fn test_type_classification() {
        assert_eq!(Stream::new(1, 0, 0, 2).kind, StreamType::Physical);
        assert_eq!(Stream::new(1, 1, 0, 2).kind, StreamType::Demod);
        assert_eq!(Stream::new(1, 0, 1, 2).kind, StreamType::Result);
        assert_eq!(Stream::new(1, 0, 2, 2).kind, StreamType::Result);
        assert_eq!(Stream::new(1, 0, 3, 2).kind, StreamType::State);
        assert_eq!(Stream::new(1, 0, 4, 2).kind, StreamType::State);
        assert_eq!(Stream::new(1, 0, 5, 2).kind, StreamType::Correlated);
        assert_eq!(Stream::new(1, 1, 1, 2).kind, StreamType::Result);
        assert_eq!(Stream::new(1, 1, 2, 2).kind, StreamType::State);
        assert_eq!(Stream::new(1, 1, 3, 2).kind, StreamType::Correlated);
    }

    #[test]
    fn test_integrator_count_moves_bands() {
        assert_eq!(Stream::new(1, 0, 3, 4).kind, StreamType::Result);
        assert_eq!(Stream::new(1, 0, 8, 4).kind, StreamType::State);
        assert_eq!(Stream::new(1, 0, 9, 4).kind, StreamType::Correlated);
    }

    #[test]
    fn test_fixed_to_float() {
        assert_eq!(Stream::new(1, 0, 0, 2).fixed_to_float(), 1 << 13);
        assert_eq!(Stream::new(1, 1, 0, 2).fixed_to_float(), 1 << 14);
        assert_eq!(Stream::new(1, 1, 1, 2).fixed_to_float(), 1 << 19);
        assert_eq!(Stream::new(1, 0, 1, 2).fixed_to_float(), 1 << 15);
        assert_eq!(Stream::new(1, 0, 3, 2).fixed_to_float(), 1);
        assert_eq!(Stream::new(1, 1, 2, 2).fixed_to_float(), 1);
    }

    #[test]
    fn test_record_length() {
        assert_eq!(Stream::new(1, 0, 0, 2).record_length(1024), 256);
        assert_eq!(Stream::new(1, 1, 0, 2).record_length(1024), 64);
        assert_eq!(Stream::new(1, 0, 1, 2).record_length(1024), 2);
        assert_eq!(Stream::new(1, 0, 3, 2).record_length(1024), 2);
        assert_eq!(Stream::new(1, 0, 5, 2).record_length(4096), 2);
    }

    #[test]
    fn test_same_triple_equal() {
        assert_eq!(Stream::new(2, 1, 1, 2), Stream::new(2, 1, 1, 2));
        assert_ne!(Stream::new(2, 1, 1, 2), Stream::new(2, 1, 2, 2));
    }

    #[test]
    fn test_triple_parse() {
        let t: ChannelTriple = "1.2.3".parse().unwrap();
        assert_eq!(t, ChannelTriple::new(1, 2, 3));
        assert_eq!(t.to_string(), "1.2.3");
        assert!("1.2".parse::<ChannelTriple>().is_err());
        assert!("1.16.0".parse::<ChannelTriple>().is_err());
        assert!("x.0.0".parse::<ChannelTriple>().is_err());
    }

    #[test]
    fn test_triple_fits_stream_id() {
        assert!(ChannelTriple::new(255, 15, 15).validate().is_ok());
        // 1.16.0 would pack to the ID of 2.0.0
        let err = ChannelTriple::new(1, 16, 0).validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(ChannelTriple::new(1, 0, 16).validate().is_err());
    }

    #[test]
    fn test_stream_id_display() {
        assert_eq!(StreamId(0x111).to_string(), "0x0111");
    }
}
