//! Running statistics over acquired records
//!
//! - Per-stream mean and variance over a segmented circular buffer ([`accumulator`])
//! - N-body complex products across result streams ([`correlator`])
//!
//! Both keep raw sums and sums of squares and reconstruct unbiased variances
//! at snapshot time instead of making a second pass over the data.

pub mod accumulator;
pub mod correlator;

use rustfft::num_complex::Complex;

/// Write the 3-slot complex variance layout `[var(re), var(im), cov(re, im)]` per pair
///
/// `sum(i)` is the running sum of pair `i`, `square(k)` slot `k` of the
/// sum-of-squares buffer, `n` the records per segment and `den` the full
/// normalization `(n - 1) * scale^2`. Returns the number of values written.
pub(crate) fn complex_variance_into(
    out: &mut [f64],
    pairs: usize,
    n: f64,
    den: f64,
    sum: impl Fn(usize) -> Complex<f64>,
    square: impl Fn(usize) -> f64,
) -> usize {
    let written = out.len().min(pairs * 3);
    for (k, slot) in out.iter_mut().take(written).enumerate() {
        let s = sum(k / 3);
        let correction = match k % 3 {
            0 => s.re * s.re,
            1 => s.im * s.im,
            _ => s.re * s.im,
        } / n;
        *slot = (square(k) - correction) / den;
    }
    written
}

/// Advance a segment cursor by `step`, wrapping to the start at `len`
pub(crate) fn advance_cursor(cursor: usize, step: usize, len: usize) -> usize {
    let next = cursor + step;
    if next >= len {
        0
    } else {
        next
    }
}
