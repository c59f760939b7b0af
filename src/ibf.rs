//! Interleaved Bloom filter over reference bins.
//!
//! The filter is a bit matrix of `bin_size` rows. Each row holds one
//! membership bit per bin, packed so all bins of a row share consecutive
//! words; a single hash therefore updates every bin's count in one
//! word-parallel pass. Two read-only layouts answer queries identically:
//! the plain word matrix, and a rank-compressed form that stores only the
//! non-zero words behind an occupancy bitmap.

use crate::error::{Result, SkuaError};

/// Sanity limit on bins, mirroring the loader's allocation guard.
pub const MAX_BIN_COUNT: u32 = 1_000_000;

/// Sanity limit on hash functions per filter.
pub const MAX_HASH_COUNT: u32 = 8;

// --- HASHING ---

/// MurMurHash3 64-bit finaliser. Minimiser codes are highly structured;
/// without this the double-hashing rows of nearby k-mers collide.
#[inline]
fn mix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Row of hash function `i` via double hashing: h1 + i*h2 mod bin_size.
#[inline]
fn hash_row(hash: u64, i: u64, bin_size: u64) -> usize {
    let mixed = mix64(hash);
    let h2 = (mixed >> 32) | 1;
    (mixed.wrapping_add(i.wrapping_mul(h2)) % bin_size) as usize
}

/// Optimal row count for `max_elements` entries per bin at `fp_rate`:
/// m = -n * ln(p) / ln(2)^2.
pub fn optimal_bin_size(max_elements: u64, fp_rate: f64) -> u64 {
    let ln2_sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
    let bits = (-(max_elements.max(1) as f64) * fp_rate.ln() / ln2_sq).ceil() as u64;
    bits.max(64)
}

#[inline]
fn words_for_bins(bin_count: u32) -> usize {
    (bin_count as usize + 63) / 64
}

#[inline]
fn tail_mask(bin_count: u32) -> u64 {
    match bin_count % 64 {
        0 => u64::MAX,
        r => (1u64 << r) - 1,
    }
}

// --- UNCOMPRESSED LAYOUT ---

/// Plain word-matrix layout. Mutable while the builder inserts; read-only
/// during search.
#[derive(Debug)]
pub struct InterleavedBloomFilter {
    bin_count: u32,
    hash_count: u32,
    bin_size: u64,
    words_per_row: usize,
    data: Vec<u64>,
}

/// Check filter dimensions and return the total word count of the matrix.
fn validate_dims(bin_count: u32, bin_size: u64, hash_count: u32) -> Result<usize> {
    if bin_count == 0 || bin_count > MAX_BIN_COUNT {
        return Err(SkuaError::validation(format!(
            "bin count must be in 1..={} (got {})",
            MAX_BIN_COUNT, bin_count
        )));
    }
    if hash_count == 0 || hash_count > MAX_HASH_COUNT {
        return Err(SkuaError::validation(format!(
            "hash count must be in 1..={} (got {})",
            MAX_HASH_COUNT, hash_count
        )));
    }
    if bin_size == 0 {
        return Err(SkuaError::validation("bin size must be non-zero"));
    }
    (bin_size as usize)
        .checked_mul(words_for_bins(bin_count))
        .ok_or_else(|| SkuaError::validation("filter dimensions overflow"))
}

impl InterleavedBloomFilter {
    pub fn new(bin_count: u32, bin_size: u64, hash_count: u32) -> Result<Self> {
        let total = validate_dims(bin_count, bin_size, hash_count)?;
        let words_per_row = words_for_bins(bin_count);
        Ok(Self {
            bin_count,
            hash_count,
            bin_size,
            words_per_row,
            data: vec![0u64; total],
        })
    }

    /// Rebuild from raw parts (loader side). The word vector length must
    /// match the header dimensions.
    pub(crate) fn from_words(
        bin_count: u32,
        bin_size: u64,
        hash_count: u32,
        data: Vec<u64>,
    ) -> Result<Self> {
        let mut filter = Self::new(bin_count, bin_size, hash_count)?;
        if data.len() != filter.data.len() {
            return Err(SkuaError::validation(format!(
                "filter payload holds {} words, dimensions require {}",
                data.len(),
                filter.data.len()
            )));
        }
        filter.data = data;
        Ok(filter)
    }

    pub fn bin_count(&self) -> u32 {
        self.bin_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bin_size(&self) -> u64 {
        self.bin_size
    }

    pub(crate) fn words(&self) -> &[u64] {
        &self.data
    }

    /// Set the membership bits of `hash` for `bin`.
    pub fn insert(&mut self, hash: u64, bin: u32) {
        debug_assert!(bin < self.bin_count);
        let word = (bin / 64) as usize;
        let bit = 1u64 << (bin % 64);
        for i in 0..self.hash_count as u64 {
            let row = hash_row(hash, i, self.bin_size);
            self.data[row * self.words_per_row + word] |= bit;
        }
    }

    /// Membership test for a single bin (all hash rows set).
    pub fn contains(&self, hash: u64, bin: u32) -> bool {
        let word = (bin / 64) as usize;
        let bit = 1u64 << (bin % 64);
        (0..self.hash_count as u64).all(|i| {
            let row = hash_row(hash, i, self.bin_size);
            self.data[row * self.words_per_row + word] & bit != 0
        })
    }

    /// Produce the rank-compressed read-only form.
    pub fn compress(&self) -> CompressedFilter {
        let total_words = self.data.len();
        let occupancy_len = (total_words + 63) / 64;
        let mut occupancy = vec![0u64; occupancy_len];
        let mut words = Vec::new();
        for (i, &w) in self.data.iter().enumerate() {
            if w != 0 {
                occupancy[i / 64] |= 1u64 << (i % 64);
                words.push(w);
            }
        }
        CompressedFilter {
            bin_count: self.bin_count,
            hash_count: self.hash_count,
            bin_size: self.bin_size,
            words_per_row: self.words_per_row,
            rank: build_rank(&occupancy),
            occupancy,
            words,
        }
    }
}

// --- COMPRESSED LAYOUT ---

fn build_rank(occupancy: &[u64]) -> Vec<u64> {
    let mut rank = Vec::with_capacity(occupancy.len());
    let mut acc = 0u64;
    for &w in occupancy {
        rank.push(acc);
        acc += w.count_ones() as u64;
    }
    rank
}

/// Read-only rank-compressed layout: an occupancy bitmap over matrix words,
/// a per-word popcount directory, and only the non-zero words stored.
#[derive(Debug)]
pub struct CompressedFilter {
    bin_count: u32,
    hash_count: u32,
    bin_size: u64,
    words_per_row: usize,
    occupancy: Vec<u64>,
    rank: Vec<u64>,
    words: Vec<u64>,
}

impl CompressedFilter {
    /// Rebuild from the serialized occupancy bitmap and packed words; the
    /// rank directory is derived, and the word count must match the bitmap's
    /// population.
    pub(crate) fn from_parts(
        bin_count: u32,
        bin_size: u64,
        hash_count: u32,
        occupancy: Vec<u64>,
        words: Vec<u64>,
    ) -> Result<Self> {
        let total_words = validate_dims(bin_count, bin_size, hash_count)?;
        let expected_occupancy = (total_words + 63) / 64;
        if occupancy.len() != expected_occupancy {
            return Err(SkuaError::validation(format!(
                "occupancy bitmap holds {} words, dimensions require {}",
                occupancy.len(),
                expected_occupancy
            )));
        }
        let population: u64 = occupancy.iter().map(|w| w.count_ones() as u64).sum();
        if population != words.len() as u64 {
            return Err(SkuaError::validation(format!(
                "occupancy bitmap marks {} words, payload holds {}",
                population,
                words.len()
            )));
        }
        Ok(Self {
            bin_count,
            hash_count,
            bin_size,
            words_per_row: words_for_bins(bin_count),
            rank: build_rank(&occupancy),
            occupancy,
            words,
        })
    }

    pub fn bin_count(&self) -> u32 {
        self.bin_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bin_size(&self) -> u64 {
        self.bin_size
    }

    pub(crate) fn occupancy(&self) -> &[u64] {
        &self.occupancy
    }

    pub(crate) fn packed_words(&self) -> &[u64] {
        &self.words
    }

    #[inline]
    fn word_at(&self, idx: usize) -> u64 {
        let block = idx / 64;
        let offset = idx % 64;
        let occ = self.occupancy[block];
        if occ & (1u64 << offset) == 0 {
            return 0;
        }
        let below = (occ & ((1u64 << offset) - 1)).count_ones() as u64;
        self.words[(self.rank[block] + below) as usize]
    }
}

// --- ROW ACCESS DISPATCH ---

trait RowRead {
    fn fill_row(&self, row: usize, acc: &mut [u64]);
    fn and_row(&self, row: usize, acc: &mut [u64]);
}

impl RowRead for InterleavedBloomFilter {
    #[inline]
    fn fill_row(&self, row: usize, acc: &mut [u64]) {
        let base = row * self.words_per_row;
        acc.copy_from_slice(&self.data[base..base + self.words_per_row]);
    }

    #[inline]
    fn and_row(&self, row: usize, acc: &mut [u64]) {
        let base = row * self.words_per_row;
        for (a, &w) in acc.iter_mut().zip(&self.data[base..base + self.words_per_row]) {
            *a &= w;
        }
    }
}

impl RowRead for CompressedFilter {
    #[inline]
    fn fill_row(&self, row: usize, acc: &mut [u64]) {
        let base = row * self.words_per_row;
        for (i, a) in acc.iter_mut().enumerate() {
            *a = self.word_at(base + i);
        }
    }

    #[inline]
    fn and_row(&self, row: usize, acc: &mut [u64]) {
        let base = row * self.words_per_row;
        for (i, a) in acc.iter_mut().enumerate() {
            if *a != 0 {
                *a &= self.word_at(base + i);
            }
        }
    }
}

// --- FILTER VARIANT ---

/// The two read-only filter layouts behind one dispatch point. The search
/// orchestrator branches on the variant once at entry; the counting kernel
/// is monomorphised per layout.
#[derive(Debug)]
pub enum Filter {
    Uncompressed(InterleavedBloomFilter),
    Compressed(CompressedFilter),
}

impl Filter {
    pub fn bin_count(&self) -> u32 {
        match self {
            Filter::Uncompressed(f) => f.bin_count(),
            Filter::Compressed(f) => f.bin_count(),
        }
    }

    pub fn hash_count(&self) -> u32 {
        match self {
            Filter::Uncompressed(f) => f.hash_count(),
            Filter::Compressed(f) => f.hash_count(),
        }
    }

    pub fn bin_size(&self) -> u64 {
        match self {
            Filter::Uncompressed(f) => f.bin_size(),
            Filter::Compressed(f) => f.bin_size(),
        }
    }

    fn words_per_row(&self) -> usize {
        match self {
            Filter::Uncompressed(f) => f.words_per_row,
            Filter::Compressed(f) => f.words_per_row,
        }
    }
}

// --- COUNT VECTOR ---

/// Per-bin hit counters, 8-bit and saturating. Additive across `bulk_count`
/// calls so partial counts from filter parts can be summed.
#[derive(Clone, Debug, PartialEq)]
pub struct CountVector {
    counts: Vec<u8>,
}

impl CountVector {
    pub fn new(bin_count: u32) -> Self {
        Self {
            counts: vec![0u8; bin_count as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.counts
    }

    fn clear(&mut self) {
        self.counts.fill(0);
    }

    /// `self += other`, element-wise and saturating at 255.
    pub fn saturating_add_assign(&mut self, other: &CountVector) {
        debug_assert_eq!(self.counts.len(), other.counts.len());
        for (a, &b) in self.counts.iter_mut().zip(&other.counts) {
            *a = a.saturating_add(b);
        }
    }
}

// --- COUNTING AGENT ---

/// Per-thread counting scratch. Each worker owns one agent; the row
/// accumulator and count vector are reused across records, so `bulk_count`
/// allocates nothing on the hot path.
pub struct CountingAgent<'a> {
    filter: &'a Filter,
    acc: Vec<u64>,
    tail: u64,
    counts: CountVector,
}

impl<'a> CountingAgent<'a> {
    pub fn new(filter: &'a Filter) -> Self {
        Self {
            filter,
            acc: vec![0u64; filter.words_per_row()],
            tail: tail_mask(filter.bin_count()),
            counts: CountVector::new(filter.bin_count()),
        }
    }

    /// Count, for every bin, how many of `hashes` the filter reports present
    /// under all hash functions. The returned vector is owned by the agent
    /// and valid until the next call.
    pub fn bulk_count(&mut self, hashes: &[u64]) -> &CountVector {
        self.counts.clear();
        let bin_size = self.filter.bin_size();
        let hash_count = self.filter.hash_count() as u64;
        match self.filter {
            Filter::Uncompressed(f) => count_into(
                f,
                hashes,
                bin_size,
                hash_count,
                &mut self.acc,
                self.tail,
                &mut self.counts.counts,
            ),
            Filter::Compressed(f) => count_into(
                f,
                hashes,
                bin_size,
                hash_count,
                &mut self.acc,
                self.tail,
                &mut self.counts.counts,
            ),
        }
        &self.counts
    }
}

fn count_into<F: RowRead>(
    filter: &F,
    hashes: &[u64],
    bin_size: u64,
    hash_count: u64,
    acc: &mut [u64],
    tail: u64,
    counts: &mut [u8],
) {
    for &hash in hashes {
        filter.fill_row(hash_row(hash, 0, bin_size), acc);
        for i in 1..hash_count {
            filter.and_row(hash_row(hash, i, bin_size), acc);
        }
        if let Some(last) = acc.last_mut() {
            *last &= tail;
        }
        // Word-parallel accumulation: one pass per 64 bins, visiting only
        // the surviving bits.
        for (word_idx, &word) in acc.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let bin = word_idx * 64 + bits.trailing_zeros() as usize;
                counts[bin] = counts[bin].saturating_add(1);
                bits &= bits - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_filter(compressed: bool) -> Filter {
        let mut ibf = InterleavedBloomFilter::new(4, 512, 2).unwrap();
        // bin 0: {10, 20, 30}; bin 1: {20}; bin 2: {10, 40}; bin 3: empty
        for h in [10, 20, 30] {
            ibf.insert(h, 0);
        }
        ibf.insert(20, 1);
        ibf.insert(10, 2);
        ibf.insert(40, 2);
        if compressed {
            Filter::Compressed(ibf.compress())
        } else {
            Filter::Uncompressed(ibf)
        }
    }

    #[test]
    fn test_insert_contains() {
        let mut ibf = InterleavedBloomFilter::new(3, 1024, 3).unwrap();
        ibf.insert(42, 1);
        assert!(ibf.contains(42, 1));
        assert!(!ibf.contains(42, 0));
        assert!(!ibf.contains(43, 1));
    }

    /// Expected counts via the scalar per-bin membership path, which the
    /// word-parallel kernel must agree with exactly.
    fn scalar_counts(ibf: &InterleavedBloomFilter, probes: &[u64]) -> Vec<u8> {
        (0..ibf.bin_count())
            .map(|bin| probes.iter().filter(|&&h| ibf.contains(h, bin)).count() as u8)
            .collect()
    }

    #[test]
    fn test_bulk_count_matches_scalar_membership() {
        let probes = [10u64, 20, 30, 40];
        let Filter::Uncompressed(ibf) = sample_filter(false) else {
            unreachable!()
        };
        let expected = scalar_counts(&ibf, &probes);
        assert!(expected[0] >= 3 && expected[2] >= 2);

        let filter = Filter::Uncompressed(ibf);
        let mut agent = CountingAgent::new(&filter);
        assert_eq!(agent.bulk_count(&probes).as_slice(), expected.as_slice());
    }

    #[test]
    fn test_bulk_count_additive() {
        let Filter::Uncompressed(ibf) = sample_filter(false) else {
            unreachable!()
        };
        let expected = scalar_counts(&ibf, &[10, 20, 30, 40]);

        let filter = Filter::Uncompressed(ibf);
        let mut agent = CountingAgent::new(&filter);
        let mut total = CountVector::new(filter.bin_count());
        total.saturating_add_assign(agent.bulk_count(&[10, 20]));
        total.saturating_add_assign(agent.bulk_count(&[30, 40]));
        assert_eq!(total.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_compressed_layout_identical() {
        let plain = sample_filter(false);
        let packed = sample_filter(true);
        let probes: Vec<u64> = (0..200).map(|i| i * 7 + 3).collect();
        let mut a = CountingAgent::new(&plain);
        let mut b = CountingAgent::new(&packed);
        assert_eq!(
            a.bulk_count(&probes).as_slice(),
            b.bulk_count(&probes).as_slice()
        );
    }

    #[test]
    fn test_counters_saturate() {
        let mut ibf = InterleavedBloomFilter::new(1, 256, 2).unwrap();
        ibf.insert(7, 0);
        let filter = Filter::Uncompressed(ibf);
        let mut agent = CountingAgent::new(&filter);
        let hashes = vec![7u64; 300];
        let counts = agent.bulk_count(&hashes);
        assert_eq!(counts.as_slice(), &[255]);

        let mut total = CountVector::new(1);
        total.saturating_add_assign(counts);
        total.saturating_add_assign(agent.bulk_count(&hashes));
        assert_eq!(total.as_slice(), &[255]);
    }

    #[test]
    fn test_dimension_validation() {
        assert!(InterleavedBloomFilter::new(0, 64, 2).is_err());
        assert!(InterleavedBloomFilter::new(4, 0, 2).is_err());
        assert!(InterleavedBloomFilter::new(4, 64, 0).is_err());
        assert!(InterleavedBloomFilter::new(4, 64, MAX_HASH_COUNT + 1).is_err());
    }

    #[test]
    fn test_optimal_bin_size_grows_with_elements() {
        let small = optimal_bin_size(10, 0.05);
        let large = optimal_bin_size(1000, 0.05);
        assert!(small >= 64);
        assert!(large > small);
    }
}
