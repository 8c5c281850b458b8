//! Per-stream running sums for segmented averaging
//!
//! The sum buffer holds `record_length * num_segments` slots. Each arriving
//! record is added into the window at the write cursor; after `num_waveforms`
//! records the cursor moves to the next segment and wraps after the last one,
//! so round robins fold onto the same segments.
//!
//! Real (PHYSICAL) streams keep one square per sample. Complex streams keep
//! three values per I/Q pair (`re^2`, `im^2`, `re*im`), enough to rebuild the
//! 2x2 covariance of each pair.

use super::{advance_cursor, complex_variance_into};
use crate::error::{DigitizerError, Result};
use crate::stream::identity::Stream;
use rustfft::num_complex::Complex;

/// Running mean/variance accumulator for one stream
#[derive(Debug, Clone)]
pub struct Accumulator {
    stream: Stream,
    /// Samples per record for this stream
    record_length: usize,
    num_segments: usize,
    num_waveforms: usize,
    fixed_to_float: f64,
    /// Records folded into the current segment
    wfm_count: usize,
    sums: Vec<i64>,
    squares: Vec<i128>,
    cursor: usize,
    square_cursor: usize,
    records_taken: u64,
}

impl Accumulator {
    /// Create an accumulator for `stream`
    ///
    /// # Arguments
    /// * `record_length` - global ADC record length; converted to the stream's own length
    /// * `num_segments` - distinct segments kept apart while averaging
    /// * `num_waveforms` - consecutive records averaged into each segment
    pub fn new(stream: Stream, record_length: usize, num_segments: usize, num_waveforms: usize) -> Self {
        let record_length = stream.record_length(record_length);
        let num_segments = num_segments.max(1);
        let square_len = if stream.kind.is_complex() {
            record_length * num_segments * 3 / 2
        } else {
            record_length * num_segments
        };
        Self {
            stream,
            record_length,
            num_segments,
            num_waveforms: num_waveforms.max(1),
            fixed_to_float: stream.fixed_to_float() as f64,
            wfm_count: 0,
            sums: vec![0; record_length * num_segments],
            squares: vec![0; square_len],
            cursor: 0,
            square_cursor: 0,
            records_taken: 0,
        }
    }

    /// Fold one record into the running sums
    ///
    /// The record must hold exactly [`Self::record_length`] samples.
    pub fn accumulate(&mut self, record: &[i32]) -> Result<()> {
        if record.len() != self.record_length {
            return Err(DigitizerError::RecordSize {
                sid: self.stream.id,
                expected: self.record_length,
                actual: record.len(),
            });
        }

        tracing::trace!(
            sid = %self.stream.id,
            cursor = self.cursor,
            records_taken = self.records_taken,
            "Accumulating record"
        );

        let window = &mut self.sums[self.cursor..self.cursor + self.record_length];
        for (acc, &x) in window.iter_mut().zip(record) {
            *acc += x as i64;
        }

        let square_step = if self.stream.kind.is_complex() {
            let pairs = self.record_length / 2;
            let window = &mut self.squares[self.square_cursor..self.square_cursor + 3 * pairs];
            for (i, triple) in window.chunks_exact_mut(3).enumerate() {
                let z = pair(record, i);
                triple[0] += z.re * z.re;
                triple[1] += z.im * z.im;
                triple[2] += z.re * z.im;
            }
            3 * pairs
        } else {
            let window = &mut self.squares[self.square_cursor..self.square_cursor + self.record_length];
            for (acc, &x) in window.iter_mut().zip(record) {
                let x = x as i128;
                *acc += x * x;
            }
            self.record_length
        };

        self.records_taken += 1;
        self.wfm_count += 1;
        if self.wfm_count == self.num_waveforms {
            self.wfm_count = 0;
            self.cursor = advance_cursor(self.cursor, self.record_length, self.sums.len());
            self.square_cursor = if self.cursor == 0 {
                0
            } else {
                advance_cursor(self.square_cursor, square_step, self.squares.len())
            };
        }
        Ok(())
    }

    /// Zero all sums, cursors and counters
    pub fn reset(&mut self) {
        self.sums.fill(0);
        self.squares.fill(0);
        self.cursor = 0;
        self.square_cursor = 0;
        self.wfm_count = 0;
        self.records_taken = 0;
    }

    /// Records folded into each segment so far (at least 1)
    fn records_per_segment(&self) -> u64 {
        (self.records_taken / self.num_segments as u64).max(1)
    }

    /// Copy the per-segment mean, in physical units, into `out`
    ///
    /// Writes at most `out.len()` values and returns how many were written.
    pub fn snapshot(&self, out: &mut [f64]) -> usize {
        let scale = self.records_per_segment() as f64 * self.fixed_to_float;
        let written = out.len().min(self.sums.len());
        for (slot, &sum) in out.iter_mut().zip(&self.sums) {
            *slot = sum as f64 / scale;
        }
        written
    }

    /// Copy the unbiased per-segment variance into `out`
    ///
    /// Real streams get one value per sample; complex streams get
    /// `[var(re), var(im), cov(re, im)]` per pair. All zeros until every
    /// segment holds at least two records.
    pub fn snapshot_variance(&self, out: &mut [f64]) -> usize {
        let written = out.len().min(self.squares.len());
        let n = self.records_per_segment();
        if n < 2 {
            out[..written].fill(0.0);
            return written;
        }

        let n = n as f64;
        let den = (n - 1.0) * self.fixed_to_float * self.fixed_to_float;
        if self.stream.kind.is_complex() {
            complex_variance_into(
                out,
                self.sums.len() / 2,
                n,
                den,
                |i| {
                    let z = pair64(&self.sums, i);
                    Complex::new(z.re as f64, z.im as f64)
                },
                |k| self.squares[k] as f64,
            )
        } else {
            for ((slot, &sq), &sum) in out.iter_mut().zip(&self.squares).zip(&self.sums) {
                let sum = sum as f64;
                *slot = (sq as f64 - sum * sum / n) / den;
            }
            written
        }
    }

    /// Per-segment mean as a new vector
    pub fn mean(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.buffer_size()];
        self.snapshot(&mut out);
        out
    }

    /// Per-segment variance as a new vector
    pub fn variance(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.variance_buffer_size()];
        self.snapshot_variance(&mut out);
        out
    }

    /// Length of the mean snapshot
    pub fn buffer_size(&self) -> usize {
        self.sums.len()
    }

    /// Length of the variance snapshot
    pub fn variance_buffer_size(&self) -> usize {
        self.squares.len()
    }

    /// Total records folded in since construction or the last reset
    pub fn records_taken(&self) -> u64 {
        self.records_taken
    }

    /// Samples per record for this stream
    pub fn record_length(&self) -> usize {
        self.record_length
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

/// Read interleaved I/Q pair `i` of a record
fn pair(record: &[i32], i: usize) -> Complex<i128> {
    Complex::new(record[2 * i] as i128, record[2 * i + 1] as i128)
}

fn pair64(sums: &[i64], i: usize) -> Complex<i64> {
    Complex::new(sums[2 * i], sums[2 * i + 1])
}
