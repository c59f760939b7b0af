//! Per-query hit thresholds.
//!
//! The oracle turns a query's minimiser count into the minimum per-bin count
//! that implies a true hit. Three modes, in priority order: an explicit
//! fractional threshold, the exact k-mer lemma when no windowing is in
//! effect, and otherwise a precomputed table indexed by how many minimisers
//! the query produced above the minimum expected for the pattern length.
//! Table thresholds carry a fixed `+2` margin from the upstream model; the
//! margin lives here, not in the table, so a model swap touches one place.
//!
//! The table is deterministic in `(p, w, k, e, tau)` and cached on disk next
//! to the index; a missing or stale cache triggers recomputation.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SkuaError};

const CACHE_MAGIC: &[u8; 4] = b"SKTH";
const CACHE_VERSION: u32 = 1;

/// Fixed margin added to every table-derived threshold.
const TABLE_MARGIN: usize = 2;

/// Model inputs. All in bases except `errors` and `tau`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdParams {
    pub pattern_size: usize,
    pub window_size: usize,
    pub kmer_size: usize,
    pub errors: usize,
    pub tau: f64,
}

impl ThresholdParams {
    pub fn kmers_per_window(&self) -> usize {
        self.window_size - self.kmer_size + 1
    }

    pub fn kmers_per_pattern(&self) -> usize {
        self.pattern_size - self.kmer_size + 1
    }

    pub fn min_minimisers(&self) -> usize {
        let kpw = self.kmers_per_window();
        let kpp = self.kmers_per_pattern();
        if kpw == 1 {
            kpp
        } else {
            div_ceil(kpp, kpw)
        }
    }

    pub fn max_minimisers(&self) -> usize {
        self.pattern_size - self.window_size + 1
    }

    /// Shared k-mer lower bound for `p`-length patterns at `e` errors:
    /// `p + 1 - (e+1)*k`, floored at zero.
    pub fn kmer_lemma(&self) -> usize {
        (self.pattern_size + 1).saturating_sub((self.errors + 1) * self.kmer_size)
    }

    fn validate(&self) -> Result<()> {
        if self.kmer_size == 0 || self.kmer_size > self.window_size {
            return Err(SkuaError::validation(format!(
                "k-mer size {} must be in 1..=window size {}",
                self.kmer_size, self.window_size
            )));
        }
        if self.window_size > self.pattern_size {
            return Err(SkuaError::validation(format!(
                "window size {} exceeds pattern size {}",
                self.window_size, self.pattern_size
            )));
        }
        if !(self.tau > 0.0 && self.tau < 1.0) {
            return Err(SkuaError::validation(format!(
                "tau must lie in (0, 1) (got {})",
                self.tau
            )));
        }
        Ok(())
    }
}

#[inline]
fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Minimum shared-minimiser counts for each observed minimiser count in
/// `[min_minimisers, max_minimisers]`.
///
/// Surrogate model: each of `e` errors removes at most the minimisers whose
/// k-mer span it touches, on average `ceil(n*k / kmers_per_pattern)` of the
/// `n` observed; the threshold is the `tau`-scaled surviving count. Monotone
/// non-increasing in `errors` and non-decreasing in `tau`.
pub fn precompute_thresholds(params: &ThresholdParams) -> Vec<u64> {
    let kpp = params.kmers_per_pattern();
    (params.min_minimisers()..=params.max_minimisers())
        .map(|n| {
            let destroyed_per_error = div_ceil(n * params.kmer_size, kpp);
            let surviving = n.saturating_sub(params.errors * destroyed_per_error);
            (params.tau * surviving as f64).ceil() as u64
        })
        .collect()
}

// --- DISK CACHE ---

/// Cache side-file for `params`, keyed next to the index file.
pub fn cache_path(index: &Path, params: &ThresholdParams) -> PathBuf {
    let mut name = index.as_os_str().to_owned();
    name.push(format!(
        ".thresholds_p{}_w{}_k{}_e{}_tau{}",
        params.pattern_size,
        params.window_size,
        params.kmer_size,
        params.errors,
        params.tau
    ));
    PathBuf::from(name)
}

fn read_cache(path: &Path, params: &ThresholdParams) -> Option<Vec<u64>> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).ok()?;
    if &magic != CACHE_MAGIC {
        return None;
    }

    let mut buf4 = [0u8; 4];
    let mut buf8 = [0u8; 8];
    reader.read_exact(&mut buf4).ok()?;
    if u32::from_le_bytes(buf4) != CACHE_VERSION {
        return None;
    }

    let mut read_u64 = |reader: &mut BufReader<File>| -> Option<u64> {
        reader.read_exact(&mut buf8).ok()?;
        Some(u64::from_le_bytes(buf8))
    };

    let stored = ThresholdParams {
        pattern_size: read_u64(&mut reader)? as usize,
        window_size: read_u64(&mut reader)? as usize,
        kmer_size: read_u64(&mut reader)? as usize,
        errors: read_u64(&mut reader)? as usize,
        tau: f64::from_bits(read_u64(&mut reader)?),
    };
    if stored != *params {
        return None;
    }

    let len = read_u64(&mut reader)? as usize;
    let expected = params.max_minimisers() - params.min_minimisers() + 1;
    if len != expected {
        return None;
    }
    let mut table = Vec::with_capacity(len);
    for _ in 0..len {
        table.push(read_u64(&mut reader)?);
    }
    Some(table)
}

fn write_cache(path: &Path, params: &ThresholdParams, table: &[u64]) -> Result<()> {
    let file = File::create(path).map_err(|e| SkuaError::io(path, "create", e))?;
    let mut writer = BufWriter::new(file);
    let err = |e| SkuaError::io(path, "write", e);

    writer.write_all(CACHE_MAGIC).map_err(err)?;
    writer.write_all(&CACHE_VERSION.to_le_bytes()).map_err(err)?;
    for value in [
        params.pattern_size as u64,
        params.window_size as u64,
        params.kmer_size as u64,
        params.errors as u64,
        params.tau.to_bits(),
        table.len() as u64,
    ] {
        writer.write_all(&value.to_le_bytes()).map_err(err)?;
    }
    for &value in table {
        writer.write_all(&value.to_le_bytes()).map_err(err)?;
    }
    writer.flush().map_err(err)?;
    Ok(())
}

// --- ORACLE ---

/// Query-side threshold oracle, fixed for one invocation.
pub struct Thresholder {
    explicit: Option<f64>,
    kmers_per_window: usize,
    min_minimisers: usize,
    max_minimisers: usize,
    kmer_lemma: usize,
    table: Vec<u64>,
}

impl Thresholder {
    /// Build the oracle. The table is only materialised when the table
    /// branch is reachable (windowing in effect, no explicit threshold);
    /// `cache` names the side-file to reuse or fill.
    pub fn new(
        params: &ThresholdParams,
        explicit: Option<f64>,
        cache: Option<&Path>,
    ) -> Result<Self> {
        params.validate()?;
        if let Some(t) = explicit {
            if !(0.0..=1.0).contains(&t) {
                return Err(SkuaError::validation(format!(
                    "explicit threshold must lie in [0, 1] (got {})",
                    t
                )));
            }
        }

        let needs_table = explicit.is_none() && params.kmers_per_window() > 1;
        let table = if needs_table {
            let table = match cache.and_then(|path| read_cache(path, params)) {
                Some(table) => table,
                None => {
                    let table = precompute_thresholds(params);
                    if let Some(path) = cache {
                        if let Err(e) = write_cache(path, params, &table) {
                            log::warn!("could not store threshold cache: {}", e);
                        }
                    }
                    table
                }
            };
            let expected = params.max_minimisers() - params.min_minimisers() + 1;
            if table.len() != expected {
                return Err(SkuaError::threshold(format!(
                    "model produced {} entries, expected {}",
                    table.len(),
                    expected
                )));
            }
            table
        } else {
            Vec::new()
        };

        Ok(Self {
            explicit,
            kmers_per_window: params.kmers_per_window(),
            min_minimisers: params.min_minimisers(),
            max_minimisers: params.max_minimisers(),
            kmer_lemma: params.kmer_lemma(),
            table,
        })
    }

    /// Minimum per-bin count implying a hit for a query with
    /// `minimiser_count` minimisers.
    pub fn threshold(&self, minimiser_count: usize) -> usize {
        if let Some(t) = self.explicit {
            (minimiser_count as f64 * t) as usize
        } else if self.kmers_per_window == 1 {
            self.kmer_lemma
        } else {
            let span = self.max_minimisers - self.min_minimisers;
            let index = minimiser_count.saturating_sub(self.min_minimisers).min(span);
            self.table[index] as usize + TABLE_MARGIN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params(p: usize, w: usize, k: usize, e: usize, tau: f64) -> ThresholdParams {
        ThresholdParams {
            pattern_size: p,
            window_size: w,
            kmer_size: k,
            errors: e,
            tau,
        }
    }

    #[test]
    fn test_explicit_threshold_floors() {
        let t = Thresholder::new(&params(100, 24, 20, 2, 0.99), Some(0.5), None).unwrap();
        assert_eq!(t.threshold(10), 5);
        assert_eq!(t.threshold(11), 5);
        assert_eq!(t.threshold(0), 0);

        let t = Thresholder::new(&params(100, 24, 20, 2, 0.99), Some(0.33), None).unwrap();
        assert_eq!(t.threshold(10), 3);
    }

    #[test]
    fn test_no_windowing_uses_kmer_lemma() {
        // w == k: threshold equals p + 1 - (e+1)*k regardless of count.
        let t = Thresholder::new(&params(50, 20, 20, 1, 0.99), None, None).unwrap();
        assert_eq!(t.threshold(5), 50 + 1 - 2 * 20);
        assert_eq!(t.threshold(500), 50 + 1 - 2 * 20);

        // Lemma floors at zero for large error budgets.
        let t = Thresholder::new(&params(50, 20, 20, 5, 0.99), None, None).unwrap();
        assert_eq!(t.threshold(5), 0);
    }

    #[test]
    fn test_table_branch_carries_margin() {
        let p = params(100, 24, 20, 0, 0.9999);
        let t = Thresholder::new(&p, None, None).unwrap();
        // e == 0: the model keeps all n minimisers, so the threshold is
        // ceil(tau * n) + margin.
        let n = p.min_minimisers() + 3;
        let expected = (0.9999f64 * n as f64).ceil() as usize + 2;
        assert_eq!(t.threshold(n), expected);
    }

    #[test]
    fn test_table_index_clamps() {
        let p = params(100, 24, 20, 1, 0.99);
        let t = Thresholder::new(&p, None, None).unwrap();
        // Below the expected minimum: first entry.
        assert_eq!(t.threshold(0), t.threshold(p.min_minimisers()));
        // Above the possible maximum: last entry.
        assert_eq!(
            t.threshold(p.max_minimisers() + 100),
            t.threshold(p.max_minimisers())
        );
    }

    #[test]
    fn test_more_errors_never_raise_threshold() {
        for e in 0..4 {
            let a = Thresholder::new(&params(100, 24, 20, e, 0.99), None, None).unwrap();
            let b = Thresholder::new(&params(100, 24, 20, e + 1, 0.99), None, None).unwrap();
            for n in 0..=90 {
                assert!(b.threshold(n) <= a.threshold(n), "e={} n={}", e, n);
            }
        }
    }

    #[test]
    fn test_higher_tau_never_lowers_threshold() {
        let lo = Thresholder::new(&params(100, 24, 20, 2, 0.5), None, None).unwrap();
        let hi = Thresholder::new(&params(100, 24, 20, 2, 0.999), None, None).unwrap();
        for n in 0..=90 {
            assert!(hi.threshold(n) >= lo.threshold(n), "n={}", n);
        }
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempdir().unwrap();
        let p = params(100, 24, 20, 2, 0.99);
        let cache = cache_path(&dir.path().join("ref.skua"), &p);

        let fresh = Thresholder::new(&p, None, Some(&cache)).unwrap();
        assert!(cache.exists());
        let cached = Thresholder::new(&p, None, Some(&cache)).unwrap();
        for n in 0..=90 {
            assert_eq!(fresh.threshold(n), cached.threshold(n));
        }
    }

    #[test]
    fn test_stale_cache_recomputed() {
        let dir = tempdir().unwrap();
        let p1 = params(100, 24, 20, 2, 0.99);
        let p2 = params(100, 24, 20, 3, 0.99);
        let cache = dir.path().join("shared.cache");

        let _ = Thresholder::new(&p1, None, Some(&cache)).unwrap();
        // Same file, different parameters: the stored table must be ignored.
        assert!(read_cache(&cache, &p2).is_none());
        let t2 = Thresholder::new(&p2, None, Some(&cache)).unwrap();
        let direct = Thresholder::new(&p2, None, None).unwrap();
        for n in 0..=90 {
            assert_eq!(t2.threshold(n), direct.threshold(n));
        }
    }

    #[test]
    fn test_parameter_validation() {
        assert!(Thresholder::new(&params(10, 20, 5, 0, 0.9), None, None).is_err());
        assert!(Thresholder::new(&params(50, 10, 20, 0, 0.9), None, None).is_err());
        assert!(Thresholder::new(&params(50, 20, 10, 0, 1.5), None, None).is_err());
        assert!(Thresholder::new(&params(50, 20, 10, 0, 0.9), Some(1.5), None).is_err());
    }
}
