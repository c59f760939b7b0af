//! Range-partitioning worker dispatch.
//!
//! A record range `[0, n)` is split into `threads` contiguous sub-ranges —
//! the first `threads - 1` of width `n / threads`, the last absorbing the
//! remainder — and each runs as one rayon scope task. All tasks are joined
//! before returning; the first failure wins, later ones are logged. The
//! elapsed wall time is returned for the caller's compute counter.

use std::time::Instant;

use crate::error::{FirstErrorCapture, Result};

/// Contiguous partition of `[0, num_records)` into `threads` ranges.
pub fn split_ranges(num_records: usize, threads: usize) -> Vec<(usize, usize)> {
    let threads = threads.max(1);
    let per_thread = num_records / threads;
    (0..threads)
        .map(|i| {
            let lo = per_thread * i;
            let hi = if i == threads - 1 {
                num_records
            } else {
                per_thread * (i + 1)
            };
            (lo, hi)
        })
        .collect()
}

/// Run `worker(lo, hi)` over the partition of `[0, num_records)`.
pub fn run_partitioned<W>(num_records: usize, threads: usize, worker: W) -> Result<f64>
where
    W: Fn(usize, usize) -> Result<()> + Sync,
{
    let start = Instant::now();
    let errors = FirstErrorCapture::new();

    rayon::scope(|scope| {
        for (lo, hi) in split_ranges(num_records, threads) {
            let worker = &worker;
            let errors = &errors;
            scope.spawn(move |_| {
                if let Err(e) = worker(lo, hi) {
                    let msg = e.to_string();
                    if !errors.store(e) {
                        log::warn!("worker failed after first error: {}", msg);
                    }
                }
            });
        }
    });

    let elapsed = start.elapsed().as_secs_f64();
    match errors.take() {
        Some(e) => Err(e),
        None => Ok(elapsed),
    }
}

/// Like [`run_partitioned`], but additionally hands each task the matching
/// disjoint sub-slice of `items`, so per-record state can be mutated without
/// locks. `worker(lo, slice)` receives the range start and
/// `&mut items[lo..hi]`.
pub fn run_partitioned_mut<T, W>(items: &mut [T], threads: usize, worker: W) -> Result<f64>
where
    T: Send,
    W: Fn(usize, &mut [T]) -> Result<()> + Sync,
{
    let start = Instant::now();
    let errors = FirstErrorCapture::new();
    let ranges = split_ranges(items.len(), threads);

    rayon::scope(|scope| {
        let mut rest = items;
        for (lo, hi) in ranges {
            let (slice, tail) = std::mem::take(&mut rest).split_at_mut(hi - lo);
            rest = tail;
            let worker = &worker;
            let errors = &errors;
            scope.spawn(move |_| {
                if let Err(e) = worker(lo, slice) {
                    let msg = e.to_string();
                    if !errors.store(e) {
                        log::warn!("worker failed after first error: {}", msg);
                    }
                }
            });
        }
    });

    let elapsed = start.elapsed().as_secs_f64();
    match errors.take() {
        Some(e) => Err(e),
        None => Ok(elapsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SkuaError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_split_last_range_absorbs_remainder() {
        assert_eq!(split_ranges(10, 4), vec![(0, 2), (2, 4), (4, 6), (6, 10)]);
        assert_eq!(split_ranges(9, 3), vec![(0, 3), (3, 6), (6, 9)]);
        assert_eq!(split_ranges(5, 1), vec![(0, 5)]);
    }

    #[test]
    fn test_split_degenerate_inputs() {
        // Fewer records than threads: leading ranges are empty.
        assert_eq!(split_ranges(2, 4), vec![(0, 0), (0, 0), (0, 0), (0, 2)]);
        assert_eq!(split_ranges(0, 3), vec![(0, 0), (0, 0), (0, 0)]);
    }

    #[test]
    fn test_every_index_visited_once() {
        let visited = AtomicUsize::new(0);
        let elapsed = run_partitioned(100, 7, |lo, hi| {
            visited.fetch_add(hi - lo, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(visited.load(Ordering::SeqCst), 100);
        assert!(elapsed >= 0.0);
    }

    #[test]
    fn test_first_error_propagates() {
        let err = run_partitioned(10, 4, |lo, _hi| {
            if lo == 0 {
                Err(SkuaError::validation("boom"))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_mut_slices_are_disjoint_and_aligned() {
        let mut items: Vec<usize> = vec![0; 25];
        run_partitioned_mut(&mut items, 4, |lo, slice| {
            for (j, item) in slice.iter_mut().enumerate() {
                *item = lo + j;
            }
            Ok(())
        })
        .unwrap();
        let expected: Vec<usize> = (0..25).collect();
        assert_eq!(items, expected);
    }

    #[test]
    fn test_mut_with_empty_input() {
        let mut items: Vec<u8> = Vec::new();
        let elapsed = run_partitioned_mut(&mut items, 3, |_, _| Ok(())).unwrap();
        assert!(elapsed >= 0.0);
    }
}
