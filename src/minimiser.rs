//! Canonical minimiser extraction.
//!
//! A sequence maps to an ordered list of 64-bit minimiser hashes under
//! (k, w, seed): the canonical (strand-minimum) seeded k-mer code that is
//! minimal within a sliding window of `w - k + 1` consecutive k-mers. The
//! same routine feeds both the index builder and the query side, so the
//! seed adjustment must match bit-for-bit between the two.

use std::collections::VecDeque;

/// Base seed shared with the index builder. `adjust_seed` narrows it to the
/// used bit width so small k does not leave the upper hash bits constant.
pub const SEED: u64 = 0x8F3F_73B5_CF1C_9ADE;

/// Number of kmer slots the window deque usually needs.
const DEFAULT_WINDOW_CAPACITY: usize = 64;

// 2-bit DNA4 codes. Anything outside ACGT degrades to A, matching the
// upstream sequence reader's handling of ambiguous bases.
const BASE_CODE_LUT: [u8; 256] = {
    let mut lut = [0u8; 256];
    lut[b'C' as usize] = 1;
    lut[b'c' as usize] = 1;
    lut[b'G' as usize] = 2;
    lut[b'g' as usize] = 2;
    lut[b'T' as usize] = 3;
    lut[b't' as usize] = 3;
    lut
};

#[inline(always)]
fn base_code(byte: u8) -> u64 {
    BASE_CODE_LUT[byte as usize] as u64
}

/// Narrow the shared seed to the `2k` bits a k-mer code occupies.
#[inline]
pub fn adjust_seed(k: usize) -> u64 {
    debug_assert!(k >= 1 && k <= 32);
    SEED >> (64 - 2 * k)
}

/// Reusable scratch state for minimiser extraction.
///
/// One workspace per worker thread; `minimisers` holds the result of the
/// most recent `extract_into` call.
pub struct MinimiserWorkspace {
    window: VecDeque<(usize, u64)>,
    pub minimisers: Vec<u64>,
}

impl MinimiserWorkspace {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(DEFAULT_WINDOW_CAPACITY),
            minimisers: Vec::with_capacity(DEFAULT_WINDOW_CAPACITY),
        }
    }
}

impl Default for MinimiserWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the canonical minimisers of `seq` into `ws.minimisers`.
///
/// Each k-mer position carries the minimum of its forward and
/// reverse-complement 2-bit codes, both XOR-ed with `seed`. Per window of
/// `w - k + 1` k-mer positions the minimum value is reported; a new value is
/// emitted when the window minimum strictly improves or when the previously
/// reported occurrence slides out of the window, so an equal-valued run
/// re-emits once per window width rather than once per position. Sequences
/// shorter than `w` yield an empty list.
pub fn extract_into(seq: &[u8], k: usize, w: usize, seed: u64, ws: &mut MinimiserWorkspace) {
    ws.minimisers.clear();
    ws.window.clear();

    let len = seq.len();
    if len < w || k == 0 || w < k {
        return;
    }

    let kmers_per_window = w - k + 1;
    let num_kmers = len - k + 1;
    let mask = if k == 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 };
    let rc_shift = 2 * (k - 1);

    let mut fwd: u64 = 0;
    let mut rc: u64 = 0;
    let mut reported: Option<(usize, u64)> = None;

    for i in 0..(k - 1) {
        let code = base_code(seq[i]);
        fwd = (fwd << 2) | code;
        rc = (rc >> 2) | ((3 - code) << rc_shift);
    }

    for pos in 0..num_kmers {
        let code = base_code(seq[pos + k - 1]);
        fwd = ((fwd << 2) | code) & mask;
        rc = (rc >> 2) | ((3 - code) << rc_shift);

        let hash = (fwd ^ seed).min(rc ^ seed);

        while let Some(&(p, _)) = ws.window.front() {
            if p + kmers_per_window <= pos {
                ws.window.pop_front();
            } else {
                break;
            }
        }
        // Equal values evict older entries, so the front occurrence is the
        // youngest minimum and persists for a full window width.
        while let Some(&(_, v)) = ws.window.back() {
            if v >= hash {
                ws.window.pop_back();
            } else {
                break;
            }
        }
        ws.window.push_back((pos, hash));

        if pos + 1 >= kmers_per_window {
            if let Some(&(front_pos, front_hash)) = ws.window.front() {
                let emit = match reported {
                    None => true,
                    Some((rep_pos, rep_hash)) => {
                        front_hash < rep_hash || rep_pos + kmers_per_window <= pos
                    }
                };
                if emit {
                    ws.minimisers.push(front_hash);
                    reported = Some((front_pos, front_hash));
                }
            }
        }
    }
}

/// Convenience wrapper allocating a fresh workspace.
pub fn extract(seq: &[u8], k: usize, w: usize, seed: u64) -> Vec<u64> {
    let mut ws = MinimiserWorkspace::new();
    extract_into(seq, k, w, seed, &mut ws);
    ws.minimisers
}
