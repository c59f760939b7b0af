//! Index construction.
//!
//! Builds the filter the search side consumes: one bin per reference FASTA
//! file, minimisers extracted with the same (k, w, seed) scheme as queries.
//! All parts of a partitioned index share the bin coordinate space and a
//! single bin size derived from the largest bin, so per-part counts add up
//! to exactly the single-filter counts.

use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::{Path, PathBuf};

use needletail::parse_fastx_reader;

use crate::error::{Result, SkuaError};
use crate::ibf::{optimal_bin_size, Filter, InterleavedBloomFilter, MAX_HASH_COUNT};
use crate::index_io::{part_path, save_filter};
use crate::minimiser::{adjust_seed, extract_into, MinimiserWorkspace};

/// Validated build invocation parameters.
#[derive(Debug, Clone)]
pub struct BuildArguments {
    /// One bin per file, bin index = position in this list.
    pub references: Vec<PathBuf>,
    pub output: PathBuf,
    pub kmer_size: usize,
    pub window_size: usize,
    pub hash_count: u32,
    /// Target false-positive rate used to derive the bin size.
    pub fp_rate: f64,
    /// Explicit bin size override (rows); skips the fp-rate derivation.
    pub bin_size: Option<u64>,
    pub parts: usize,
    pub compressed: bool,
}

impl BuildArguments {
    pub fn validate(&self) -> Result<()> {
        if self.references.is_empty() {
            return Err(SkuaError::validation("at least one reference file is required"));
        }
        if self.kmer_size == 0 || self.kmer_size > 32 {
            return Err(SkuaError::validation(format!(
                "k-mer size must be in 1..=32 (got {})",
                self.kmer_size
            )));
        }
        if self.kmer_size > self.window_size {
            return Err(SkuaError::validation(format!(
                "window size {} must be at least k-mer size {}",
                self.window_size, self.kmer_size
            )));
        }
        if self.hash_count == 0 || self.hash_count > MAX_HASH_COUNT {
            return Err(SkuaError::validation(format!(
                "hash count must be in 1..={} (got {})",
                MAX_HASH_COUNT, self.hash_count
            )));
        }
        if !(self.fp_rate > 0.0 && self.fp_rate < 1.0) {
            return Err(SkuaError::validation(format!(
                "false-positive rate must lie in (0, 1) (got {})",
                self.fp_rate
            )));
        }
        if self.parts == 0 || self.parts > self.references.len() {
            return Err(SkuaError::validation(format!(
                "part count must be in 1..={} (got {})",
                self.references.len(),
                self.parts
            )));
        }
        Ok(())
    }
}

/// Contiguous bin ranges per part; the first `bins % parts` parts are one
/// bin wider.
fn partition_bins(bins: usize, parts: usize) -> Vec<Range<usize>> {
    let base = bins / parts;
    let extra = bins % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut lo = 0;
    for i in 0..parts {
        let width = base + usize::from(i < extra);
        ranges.push(lo..lo + width);
        lo += width;
    }
    ranges
}

/// All minimisers of one reference file, sorted and deduplicated.
fn reference_minimisers(
    path: &Path,
    kmer_size: usize,
    window_size: usize,
    seed: u64,
    ws: &mut MinimiserWorkspace,
) -> Result<Vec<u64>> {
    let file = File::open(path).map_err(|e| SkuaError::io(path, "open", e))?;
    let mut reader = parse_fastx_reader(BufReader::new(file))
        .map_err(|e| SkuaError::format(path, format!("not a FASTA/FASTQ stream: {}", e)))?;

    let mut minimisers = Vec::new();
    while let Some(record) = reader.next() {
        let rec = record
            .map_err(|e| SkuaError::format(path, format!("invalid reference record: {}", e)))?;
        extract_into(&rec.seq(), kmer_size, window_size, seed, ws);
        minimisers.extend_from_slice(&ws.minimisers);
    }
    minimisers.sort_unstable();
    minimisers.dedup();
    Ok(minimisers)
}

fn fill_part(
    bin_count: u32,
    bin_size: u64,
    hash_count: u32,
    bins: &[Vec<u64>],
    range: Range<usize>,
    compressed: bool,
) -> Result<Filter> {
    let mut ibf = InterleavedBloomFilter::new(bin_count, bin_size, hash_count)?;
    for bin in range {
        for &hash in &bins[bin] {
            ibf.insert(hash, bin as u32);
        }
    }
    Ok(if compressed {
        Filter::Compressed(ibf.compress())
    } else {
        Filter::Uncompressed(ibf)
    })
}

/// Build the index described by `args` and write it to disk.
pub fn build(args: &BuildArguments) -> Result<()> {
    args.validate()?;
    let seed = adjust_seed(args.kmer_size);

    let mut ws = MinimiserWorkspace::new();
    let mut bins = Vec::with_capacity(args.references.len());
    for path in &args.references {
        let minimisers =
            reference_minimisers(path, args.kmer_size, args.window_size, seed, &mut ws)?;
        log::info!("{}: {} minimiser(s)", path.display(), minimisers.len());
        bins.push(minimisers);
    }

    let bin_count = bins.len() as u32;
    let max_elements = bins.iter().map(Vec::len).max().unwrap_or(0) as u64;
    let bin_size = args
        .bin_size
        .unwrap_or_else(|| optimal_bin_size(max_elements, args.fp_rate));
    log::info!(
        "{} bin(s), bin size {} row(s), {} hash function(s), {} part(s)",
        bin_count,
        bin_size,
        args.hash_count,
        args.parts
    );

    if args.parts == 1 {
        let filter = fill_part(
            bin_count,
            bin_size,
            args.hash_count,
            &bins,
            0..bins.len(),
            args.compressed,
        )?;
        save_filter(&filter, &args.output)?;
    } else {
        for (part, range) in partition_bins(bins.len(), args.parts).into_iter().enumerate() {
            let filter = fill_part(
                bin_count,
                bin_size,
                args.hash_count,
                &bins,
                range,
                args.compressed,
            )?;
            save_filter(&filter, &part_path(&args.output, part))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibf::CountingAgent;
    use crate::index_io::load_filter;
    use crate::minimiser::extract;
    use tempfile::tempdir;

    fn sample_build(dir: &Path, parts: usize) -> BuildArguments {
        let refs = ["ACGTACGTACGTACGTACGT", "TTGGCCAATTGGCCAATTGG"];
        let mut references = Vec::new();
        for (i, seq) in refs.iter().enumerate() {
            let path = dir.join(format!("ref{}.fa", i));
            std::fs::write(&path, format!(">r{}\n{}\n", i, seq)).unwrap();
            references.push(path);
        }
        BuildArguments {
            references,
            output: dir.join("ref.skua"),
            kmer_size: 5,
            window_size: 8,
            hash_count: 2,
            fp_rate: 0.05,
            bin_size: Some(4096),
            parts,
            compressed: false,
        }
    }

    #[test]
    fn test_partition_bins_widths() {
        let ranges = partition_bins(4, 3);
        assert_eq!(ranges, vec![0..2, 2..3, 3..4]);
        assert_eq!(partition_bins(6, 2), vec![0..3, 3..6]);
        assert_eq!(partition_bins(3, 3), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_built_index_answers_queries() {
        let dir = tempdir().unwrap();
        let args = sample_build(dir.path(), 1);
        build(&args).unwrap();

        let (filter, _) = load_filter(&args.output, false).unwrap();
        assert_eq!(filter.bin_count(), 2);

        // Every minimiser of reference 0 must count for bin 0.
        let seed = adjust_seed(args.kmer_size);
        let mins = extract(b"ACGTACGTACGTACGTACGT", 5, 8, seed);
        assert!(!mins.is_empty());
        let mut agent = CountingAgent::new(&filter);
        let counts = agent.bulk_count(&mins);
        assert_eq!(counts.as_slice()[0] as usize, mins.len());
    }

    #[test]
    fn test_partitioned_build_writes_all_parts() {
        let dir = tempdir().unwrap();
        let args = sample_build(dir.path(), 2);
        build(&args).unwrap();

        for part in 0..2 {
            let path = part_path(&args.output, part);
            let (filter, _) = load_filter(&path, false).unwrap();
            // Every part spans the full bin coordinate space.
            assert_eq!(filter.bin_count(), 2);
        }
        assert!(!args.output.exists());
    }

    #[test]
    fn test_validation_rejects_bad_arguments() {
        let dir = tempdir().unwrap();
        let mut args = sample_build(dir.path(), 1);
        args.references.clear();
        assert!(args.validate().is_err());

        let mut args = sample_build(dir.path(), 1);
        args.parts = 3;
        assert!(args.validate().is_err());

        let mut args = sample_build(dir.path(), 1);
        args.window_size = 2;
        assert!(args.validate().is_err());

        let mut args = sample_build(dir.path(), 1);
        args.fp_rate = 0.0;
        assert!(args.validate().is_err());
    }
}
