//! Tagged packet buffers
//!
//! The delivery path hands over one buffer per record, tagged with the
//! stream type it was filtered under and the stream's position within that
//! filter. Payloads are little-endian: 16-bit samples for PHYSICAL/DEMOD,
//! 32-bit for RESULT/STATE/CORRELATED.

use crate::error::{DigitizerError, Result};
use crate::stream::identity::StreamType;

/// One record-sized buffer from the packet-delivery path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedBuffer {
    /// Stream type filter the buffer was delivered under
    pub kind: StreamType,
    /// Position of the stream within that filter
    pub position: usize,
    /// Raw little-endian sample bytes
    pub payload: Vec<u8>,
}

impl TaggedBuffer {
    /// Wrap raw payload bytes
    pub fn from_bytes(kind: StreamType, position: usize, payload: Vec<u8>) -> Self {
        Self {
            kind,
            position,
            payload,
        }
    }

    /// Build a buffer of 16-bit samples
    pub fn narrow(kind: StreamType, position: usize, samples: &[i16]) -> Self {
        let payload = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::from_bytes(kind, position, payload)
    }

    /// Build a buffer of 32-bit samples
    pub fn wide(kind: StreamType, position: usize, samples: &[i32]) -> Self {
        let payload = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::from_bytes(kind, position, payload)
    }

    /// Number of whole samples in the payload at this type's width
    pub fn len(&self) -> usize {
        self.payload.len() / self.kind.sample_width()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode the payload at the width implied by the stream type
    ///
    /// Narrow samples are sign-extended so every sink works on `i32`.
    pub fn samples(&self) -> Result<Vec<i32>> {
        let width = self.kind.sample_width();
        if self.payload.len() % width != 0 {
            return Err(DigitizerError::MalformedBuffer {
                len: self.payload.len(),
                width,
            });
        }
        let samples = match width {
            2 => self
                .payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as i32)
                .collect(),
            _ => self
                .payload
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        };
        Ok(samples)
    }
}
