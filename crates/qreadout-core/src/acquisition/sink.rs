//! Length-prefixed frames for raw-mode socket forwarding
//!
//! ## Frame format
//!
//! `[u64_le byte_len][f64_le; byte_len / 8]`, one frame per record, samples
//! already divided by the stream's fixed-to-float scale.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// A byte sink shared between the engine's socket registry and a record queue
pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wrap any writer (a `TcpStream`, a file, a `Vec<u8>`) as a [`SharedSink`]
pub fn shared<W: Write + Send + 'static>(writer: W) -> SharedSink {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Write one frame and flush
///
/// A short write surfaces as [`io::ErrorKind::WriteZero`] from `write_all`.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, samples: &[f64]) -> io::Result<()> {
    let byte_len = (samples.len() * std::mem::size_of::<f64>()) as u64;
    let mut frame = Vec::with_capacity(8 + byte_len as usize);
    frame.extend_from_slice(&byte_len.to_le_bytes());
    for s in samples {
        frame.extend_from_slice(&s.to_le_bytes());
    }
    writer.write_all(&frame)?;
    writer.flush()
}

/// Read one frame written by [`write_frame`]
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<f64>> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;
    let byte_len = u64::from_le_bytes(header) as usize;
    if byte_len % 8 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} is not a whole number of f64 samples", byte_len),
        ));
    }
    let mut payload = vec![0u8; byte_len];
    reader.read_exact(&mut payload)?;
    Ok(payload
        .chunks_exact(8)
        .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}
