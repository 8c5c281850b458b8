//! n-choose-r index combinations in lexicographic order
//!
//! Used once per acquisition setup to enumerate the result-stream sets that
//! get an N-body correlator.

/// All combinations of `r` indices drawn from `0..n`, lexicographically ordered
///
/// Returns an empty list when `n < r`. `r == 0` yields the single empty combination.
///
/// # Example
/// ```
/// use qreadout_core::stream::combinations::combinations;
///
/// assert_eq!(combinations(3, 2), vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
/// ```
pub fn combinations(n: usize, r: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    if n < r {
        return out;
    }
    let mut s: Vec<usize> = (0..r).collect();
    out.push(s.clone());
    if r == 0 {
        return out;
    }

    while s[0] < n - r {
        // bump the rightmost index that still has room, then reset the tail
        let mut i = r - 1;
        while s[i] == n - r + i {
            i -= 1;
        }
        s[i] += 1;
        for j in i + 1..r {
            s[j] = s[j - 1] + 1;
        }
        out.push(s.clone());
    }
    out
}
