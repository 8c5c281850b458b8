//! N-body correlation of RESULT streams
//!
//! Each member stream appends its complex records to a private buffer. Once
//! every member holds at least one I/Q pair the correlator multiplies the
//! members' pairs position by position, divides by the combined scale, and
//! folds the product into segmented running sums the same way the
//! [`Accumulator`](super::accumulator::Accumulator) does. Consumed pairs are
//! evicted from all member buffers in lock-step.

use super::{advance_cursor, complex_variance_into};
use crate::error::{DigitizerError, Result};
use crate::stream::identity::{Stream, StreamId};
use rustfft::num_complex::Complex;
use std::collections::{HashMap, VecDeque};

/// Samples per correlated record (one I/Q pair)
const RECORD_LENGTH: usize = 2;

/// Running mean/variance of the complex product of two or more streams
#[derive(Debug, Clone)]
pub struct Correlator {
    /// Member stream IDs, sorted
    members: Vec<StreamId>,
    slots: HashMap<StreamId, usize>,
    buffers: Vec<VecDeque<i32>>,
    num_segments: usize,
    num_waveforms: usize,
    /// Product of every member's fixed-to-float scale
    scale: f64,
    wfm_count: usize,
    sums: Vec<f64>,
    squares: Vec<f64>,
    cursor: usize,
    square_cursor: usize,
    records_taken: u64,
}

impl Correlator {
    /// Create a correlator over `streams`
    ///
    /// Member order does not matter; the correlator is keyed by its sorted IDs.
    pub fn new(streams: &[Stream], num_segments: usize, num_waveforms: usize) -> Self {
        let mut streams = streams.to_vec();
        streams.sort_by_key(|s| s.id);
        let num_segments = num_segments.max(1);

        let members: Vec<StreamId> = streams.iter().map(|s| s.id).collect();
        let slots = members.iter().enumerate().map(|(i, &sid)| (sid, i)).collect();
        let scale = streams
            .iter()
            .map(|s| s.fixed_to_float() as f64)
            .product();

        Self {
            buffers: vec![VecDeque::new(); members.len()],
            members,
            slots,
            num_segments,
            num_waveforms: num_waveforms.max(1),
            scale,
            wfm_count: 0,
            sums: vec![0.0; RECORD_LENGTH * num_segments],
            squares: vec![0.0; RECORD_LENGTH * num_segments * 3 / 2],
            cursor: 0,
            square_cursor: 0,
            records_taken: 0,
        }
    }

    /// Append one record from member `sid` and correlate whatever is complete
    pub fn accumulate(&mut self, sid: StreamId, record: &[i32]) -> Result<()> {
        let slot = *self
            .slots
            .get(&sid)
            .ok_or(DigitizerError::StreamNotEnabled(sid))?;
        if record.len() != RECORD_LENGTH {
            return Err(DigitizerError::RecordSize {
                sid,
                expected: RECORD_LENGTH,
                actual: record.len(),
            });
        }
        self.buffers[slot].extend(record.iter().copied());
        self.correlate();
        Ok(())
    }

    /// Multiply every position all members have delivered
    fn correlate(&mut self) {
        let available = self.buffers.iter().map(VecDeque::len).min().unwrap_or(0);
        // whole pairs only
        let available = available - available % 2;
        if available == 0 {
            return;
        }

        for i in (0..available).step_by(2) {
            let product = self
                .buffers
                .iter()
                .fold(Complex::new(1.0, 0.0), |acc, buf| {
                    acc * Complex::new(buf[i] as f64, buf[i + 1] as f64)
                })
                / self.scale;

            self.sums[self.cursor] += product.re;
            self.sums[self.cursor + 1] += product.im;
            let sq = &mut self.squares[self.square_cursor..self.square_cursor + 3];
            sq[0] += product.re * product.re;
            sq[1] += product.im * product.im;
            sq[2] += product.re * product.im;

            self.wfm_count += 1;
            if self.wfm_count == self.num_waveforms {
                self.wfm_count = 0;
                self.cursor = advance_cursor(self.cursor, RECORD_LENGTH, self.sums.len());
                self.square_cursor = if self.cursor == 0 {
                    0
                } else {
                    advance_cursor(self.square_cursor, 3, self.squares.len())
                };
            }
        }

        for buf in &mut self.buffers {
            buf.drain(..available);
        }
        self.records_taken += (available / 2) as u64;

        tracing::trace!(
            members = ?self.members,
            records_taken = self.records_taken,
            "Correlated records"
        );
    }

    /// Zero the sums, cursors, counters and member buffers
    pub fn reset(&mut self) {
        for buf in &mut self.buffers {
            buf.clear();
        }
        self.sums.fill(0.0);
        self.squares.fill(0.0);
        self.cursor = 0;
        self.square_cursor = 0;
        self.wfm_count = 0;
        self.records_taken = 0;
    }

    fn records_per_segment(&self) -> u64 {
        (self.records_taken / self.num_segments as u64).max(1)
    }

    /// Copy the per-segment mean of the product into `out`
    pub fn snapshot(&self, out: &mut [f64]) -> usize {
        let n = self.records_per_segment() as f64;
        let written = out.len().min(self.sums.len());
        for (slot, &sum) in out.iter_mut().zip(&self.sums) {
            *slot = sum / n;
        }
        written
    }

    /// Copy `[var(re), var(im), cov(re, im)]` per segment into `out`
    pub fn snapshot_variance(&self, out: &mut [f64]) -> usize {
        let n = self.records_per_segment();
        if n < 2 {
            let written = out.len().min(self.squares.len());
            out[..written].fill(0.0);
            return written;
        }
        let n = n as f64;
        complex_variance_into(
            out,
            self.sums.len() / 2,
            n,
            n - 1.0,
            |i| Complex::new(self.sums[2 * i], self.sums[2 * i + 1]),
            |k| self.squares[k],
        )
    }

    pub fn mean(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.buffer_size()];
        self.snapshot(&mut out);
        out
    }

    pub fn variance(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.variance_buffer_size()];
        self.snapshot_variance(&mut out);
        out
    }

    pub fn buffer_size(&self) -> usize {
        self.sums.len()
    }

    pub fn variance_buffer_size(&self) -> usize {
        self.squares.len()
    }

    /// Correlated records formed so far
    pub fn records_taken(&self) -> u64 {
        self.records_taken
    }

    /// Sorted member stream IDs
    pub fn members(&self) -> &[StreamId] {
        &self.members
    }

    /// True if `sid` is one of the members
    pub fn contains(&self, sid: StreamId) -> bool {
        self.slots.contains_key(&sid)
    }

    /// Samples waiting in each member buffer, in member order
    pub fn pending(&self) -> Vec<usize> {
        self.buffers.iter().map(VecDeque::len).collect()
    }
}

#[cfg(test)]
#[allow(clippy::erasing_op, clippy::identity_op)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const SCALE: i32 = 1 << 19;

    fn assert_slice_eq(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-9);
        }
    }

    fn pair_streams() -> (Stream, Stream) {
        (Stream::new(1, 1, 1, 2), Stream::new(1, 2, 1, 2))
    }

    fn one_round_robin() -> (Correlator, StreamId, StreamId) {
        let (s1, s2) = pair_streams();
        let mut corr = Correlator::new(&[s1, s2], 2, 1);
        corr.accumulate(s1.id, &[0, 7 * SCALE]).unwrap(); // segment 1
        corr.accumulate(s2.id, &[SCALE, 6 * SCALE]).unwrap();
        corr.accumulate(s1.id, &[2 * SCALE, 5 * SCALE]).unwrap(); // segment 2
        corr.accumulate(s2.id, &[3 * SCALE, 4 * SCALE]).unwrap();
        (corr, s1.id, s2.id)
    }

    #[test]
    fn test_two_stream_mean() {
        let (corr, _, _) = one_round_robin();
        assert_eq!(corr.records_taken(), 2);
        assert_slice_eq(
            &corr.mean(),
            &[
                (0 * 1 - 7 * 6) as f64,
                (0 * 6 + 1 * 7) as f64,
                (2 * 3 - 5 * 4) as f64,
                (2 * 4 + 3 * 5) as f64,
            ],
        );
    }

    #[test]
    fn test_two_stream_zero_variance_from_one_round_robin() {
        let (corr, _, _) = one_round_robin();
        assert_slice_eq(&corr.variance(), &[0.0; 6]);
    }

    #[test]
    fn test_second_round_robin() {
        let (mut corr, sid1, sid2) = one_round_robin();
        corr.accumulate(sid1, &[4 * SCALE, 3 * SCALE]).unwrap();
        corr.accumulate(sid2, &[5 * SCALE, 2 * SCALE]).unwrap();
        corr.accumulate(sid1, &[6 * SCALE, SCALE]).unwrap();
        corr.accumulate(sid2, &[7 * SCALE, 0]).unwrap();

        assert_slice_eq(
            &corr.mean(),
            &[
                (0 * 1 - 7 * 6 + 4 * 5 - 3 * 2) as f64 / 2.0,
                (0 * 6 + 1 * 7 + 4 * 2 + 3 * 5) as f64 / 2.0,
                (2 * 3 - 5 * 4 + 6 * 7 - 1 * 0) as f64 / 2.0,
                (2 * 4 + 3 * 5 + 6 * 0 + 1 * 7) as f64 / 2.0,
            ],
        );
        assert_slice_eq(
            &corr.variance(),
            &[1568.0, 128.0, 448.0, 1568.0, 128.0, -448.0],
        );
    }

    #[test]
    fn test_three_stream_mean() {
        let (s1, s2) = pair_streams();
        let s3 = Stream::new(2, 1, 1, 2);
        let mut corr = Correlator::new(&[s1, s2, s3], 1, 1);
        corr.accumulate(s1.id, &[0, 10 * SCALE]).unwrap();
        corr.accumulate(s2.id, &[SCALE, 20 * SCALE]).unwrap();
        assert_eq!(corr.records_taken(), 0);
        corr.accumulate(s3.id, &[2 * SCALE, 30 * SCALE]).unwrap();

        assert_eq!(corr.records_taken(), 1);
        assert_slice_eq(
            &corr.mean(),
            &[
                (0 * 1 * 2 - 0 * 20 * 30 - 10 * 1 * 30 - 10 * 20 * 2) as f64,
                (-10 * 20 * 30 + 10 * 1 * 2 + 0 * 20 * 2 + 0 * 1 * 30) as f64,
            ],
        );
    }

    #[test]
    fn test_lock_step_waits_for_all_members() {
        let (s1, s2) = pair_streams();
        let mut corr = Correlator::new(&[s1, s2], 1, 1);
        corr.accumulate(s1.id, &[SCALE, 0]).unwrap();
        corr.accumulate(s1.id, &[2 * SCALE, 0]).unwrap();
        assert_eq!(corr.records_taken(), 0);
        assert_eq!(corr.pending(), vec![4, 0]);

        corr.accumulate(s2.id, &[3 * SCALE, 0]).unwrap();
        assert_eq!(corr.records_taken(), 1);
        assert_eq!(corr.pending(), vec![2, 0]);
        assert_slice_eq(&corr.mean(), &[3.0, 0.0]);
    }

    #[test]
    fn test_members_sorted_and_scale_combined() {
        let (s1, s2) = pair_streams();
        let corr = Correlator::new(&[s2, s1], 1, 1);
        assert_eq!(corr.members(), &[s1.id, s2.id]);
        assert!(corr.contains(s2.id));
        assert!(!corr.contains(StreamId(0x0100)));
        assert_abs_diff_eq!(corr.scale, 2f64.powi(38));
    }

    #[test]
    fn test_unknown_member_rejected() {
        let (s1, s2) = pair_streams();
        let mut corr = Correlator::new(&[s1, s2], 1, 1);
        let err = corr.accumulate(StreamId(0x0311), &[0, 0]).unwrap_err();
        assert!(matches!(err, DigitizerError::StreamNotEnabled(StreamId(0x0311))));
        let err = corr.accumulate(s1.id, &[0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DigitizerError::RecordSize { .. }));
    }

    #[test]
    fn test_reset_clears_member_buffers() {
        let (mut corr, sid1, sid2) = one_round_robin();
        corr.accumulate(sid1, &[SCALE, SCALE]).unwrap();
        corr.reset();
        assert_eq!(corr.records_taken(), 0);
        assert_eq!(corr.pending(), vec![0, 0]);
        assert_slice_eq(&corr.mean(), &[0.0; 4]);

        corr.accumulate(sid2, &[SCALE, 0]).unwrap();
        corr.accumulate(sid1, &[2 * SCALE, 0]).unwrap();
        assert_slice_eq(&corr.mean(), &[2.0, 0.0, 0.0, 0.0]);
    }
}
