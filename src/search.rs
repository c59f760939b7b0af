//! Search orchestration.
//!
//! Composes the reader, loader, dispatcher, counting agents, threshold
//! oracle, and synchronised writer under two modes picked once at entry:
//! single-filter (`parts == 1`) and multi-part. Both modes produce identical
//! per-record hit sets for the same logical index; only the loading schedule
//! differs. Per chunk the multi-part mode runs
//! `LOAD_0 → COUNT_0 → (LOAD_i → COUNT_i)* → LOAD_LAST → OUTPUT`, fusing the
//! final part's counting with output so each record's minimiser vector is
//! materialised exactly once in the pass that needs its length.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, SkuaError};
use crate::ibf::{CountVector, CountingAgent, Filter};
use crate::index_io::{join_loader, load_filter, part_path, spawn_loader};
use crate::minimiser::{adjust_seed, extract_into, MinimiserWorkspace};
use crate::parallel::{run_partitioned, run_partitioned_mut};
use crate::reader::{ChunkedReader, QueryRecord};
use crate::threshold::{cache_path, ThresholdParams, Thresholder};
use crate::writer::SyncWriter;

/// Validated search invocation parameters.
#[derive(Debug, Clone)]
pub struct SearchArguments {
    pub index: PathBuf,
    pub query: PathBuf,
    pub output: PathBuf,
    pub kmer_size: usize,
    pub window_size: usize,
    pub pattern_size: usize,
    pub errors: usize,
    pub tau: f64,
    /// Explicit fractional threshold; overrides the model when set.
    pub threshold: Option<f64>,
    pub threads: usize,
    pub parts: usize,
    pub compressed: bool,
    pub write_timings: bool,
    pub chunk_size: usize,
}

impl SearchArguments {
    /// Reject invalid parameters before any I/O happens.
    pub fn validate(&self) -> Result<()> {
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
        if self.window_size > self.pattern_size {
            return Err(SkuaError::validation(format!(
                "pattern size {} must be at least window size {}",
                self.pattern_size, self.window_size
            )));
        }
        if !(self.tau > 0.0 && self.tau < 1.0) {
            return Err(SkuaError::validation(format!(
                "tau must lie in (0, 1) (got {})",
                self.tau
            )));
        }
        if let Some(t) = self.threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(SkuaError::validation(format!(
                    "threshold must lie in [0, 1] (got {})",
                    t
                )));
            }
        }
        if self.threads == 0 {
            return Err(SkuaError::validation("thread count must be at least 1"));
        }
        if self.parts == 0 {
            return Err(SkuaError::validation("part count must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(SkuaError::validation("chunk size must be at least 1"));
        }
        Ok(())
    }

    fn threshold_params(&self) -> ThresholdParams {
        ThresholdParams {
            pattern_size: self.pattern_size,
            window_size: self.window_size,
            kmer_size: self.kmer_size,
            errors: self.errors,
            tau: self.tau,
        }
    }
}

/// Wall-clock totals per phase, written to `<output>.time` on request.
#[derive(Debug, Default, Clone)]
pub struct SearchTimings {
    pub ibf_io: f64,
    pub reads_io: f64,
    pub compute: f64,
}

impl SearchTimings {
    /// Write the timing side-file next to `output`.
    pub fn write_sidecar(&self, output: &Path) -> Result<()> {
        let mut name = output.as_os_str().to_owned();
        name.push(".time");
        let path = PathBuf::from(name);
        let mut file = File::create(&path).map_err(|e| SkuaError::io(&path, "create", e))?;
        write!(
            file,
            "IBF I/O\tReads I/O\tCompute\n{:.2}\t{:.2}\t{:.2}",
            self.ibf_io, self.reads_io, self.compute
        )
        .map_err(|e| SkuaError::io(&path, "write", e))
    }
}

/// Run a search invocation to completion (or first fatal error).
pub fn search(args: &SearchArguments) -> Result<SearchTimings> {
    args.validate()?;

    let params = args.threshold_params();
    let cache = cache_path(&args.index, &params);
    let thresholder = Thresholder::new(&params, args.threshold, Some(&cache))?;

    log::info!(
        "searching {} against {} ({} part(s), {} thread(s), {})",
        args.query.display(),
        args.index.display(),
        args.parts,
        args.threads,
        if args.compressed {
            "compressed"
        } else {
            "uncompressed"
        },
    );

    let timings = if args.parts == 1 {
        search_single(args, &thresholder)?
    } else {
        search_multipart(args, &thresholder)?
    };

    if args.write_timings {
        timings.write_sidecar(&args.output)?;
    }
    log::info!(
        "done: IBF I/O {:.2}s, reads I/O {:.2}s, compute {:.2}s",
        timings.ibf_io,
        timings.reads_io,
        timings.compute
    );
    Ok(timings)
}

/// Append `id`, a tab, and every bin index whose count reaches the
/// threshold, ascending, comma-terminated. Zero passing bins leave the bare
/// `id\t\n` line.
fn format_result_line(line: &mut String, id: &str, counts: &[u8], threshold: usize) {
    line.clear();
    line.push_str(id);
    line.push('\t');
    for (bin, &count) in counts.iter().enumerate() {
        if count as usize >= threshold {
            line.push_str(&bin.to_string());
            line.push(',');
        }
    }
    line.push('\n');
}

fn ensure_bin_count(filter: &Filter, expected: u32, path: &Path) -> Result<()> {
    if filter.bin_count() != expected {
        return Err(SkuaError::format(
            path,
            format!(
                "part indexes {} bins, other parts index {}",
                filter.bin_count(),
                expected
            ),
        ));
    }
    Ok(())
}

// --- SINGLE-FILTER MODE ---

fn search_single(args: &SearchArguments, thresholder: &Thresholder) -> Result<SearchTimings> {
    let mut timings = SearchTimings::default();
    let seed = adjust_seed(args.kmer_size);

    let mut reader = ChunkedReader::open(&args.query, args.chunk_size)?;
    let writer = SyncWriter::create(&args.output)?;

    // The one filter deserialises while the first chunk is read. The loader
    // is joined even when the read fails, so no task outlives the call.
    let loader = spawn_loader(args.index.clone(), args.compressed)?;
    let first_chunk = reader.next_chunk();
    let loaded = join_loader(loader);
    let mut records = first_chunk?;
    let (filter, load_time) = loaded?;
    timings.ibf_io += load_time;

    while !records.is_empty() {
        log::info!("chunk of {} record(s)", records.len());
        let worker = |lo: usize, hi: usize| -> Result<()> {
            let mut agent = CountingAgent::new(&filter);
            let mut ws = MinimiserWorkspace::new();
            let mut line = String::with_capacity(128);
            for rec in &records[lo..hi] {
                extract_into(&rec.seq, args.kmer_size, args.window_size, seed, &mut ws);
                if ws.minimisers.is_empty() {
                    format_result_line(&mut line, &rec.id, &[], 0);
                } else {
                    let counts = agent.bulk_count(&ws.minimisers);
                    let threshold = thresholder.threshold(ws.minimisers.len());
                    format_result_line(&mut line, &rec.id, counts.as_slice(), threshold);
                }
                writer.write(&line)?;
            }
            Ok(())
        };
        timings.compute += run_partitioned(records.len(), args.threads, worker)?;
        records = reader.next_chunk()?;
    }

    timings.reads_io = reader.io_seconds();
    writer.finish()?;
    Ok(timings)
}

// --- MULTI-PART MODE ---

/// One counting pass of `filter` over all records, accumulating into the
/// per-record count vectors.
fn count_pass(
    filter: &Filter,
    records: &[QueryRecord],
    counts: &mut [CountVector],
    args: &SearchArguments,
    seed: u64,
) -> Result<f64> {
    run_partitioned_mut(counts, args.threads, |lo, slice| {
        let mut agent = CountingAgent::new(filter);
        let mut ws = MinimiserWorkspace::new();
        for (j, total) in slice.iter_mut().enumerate() {
            let rec = &records[lo + j];
            extract_into(&rec.seq, args.kmer_size, args.window_size, seed, &mut ws);
            total.saturating_add_assign(agent.bulk_count(&ws.minimisers));
        }
        Ok(())
    })
}

fn search_multipart(args: &SearchArguments, thresholder: &Thresholder) -> Result<SearchTimings> {
    let mut timings = SearchTimings::default();
    let seed = adjust_seed(args.kmer_size);

    let mut reader = ChunkedReader::open(&args.query, args.chunk_size)?;
    let writer = SyncWriter::create(&args.output)?;

    while reader.has_next()? {
        // Part 0 deserialises while this chunk materialises; join before
        // surfacing either failure.
        let loader = spawn_loader(part_path(&args.index, 0), args.compressed)?;
        let chunk = reader.next_chunk();
        let loaded = join_loader(loader);
        let records = chunk?;
        let (filter, load_time) = loaded?;
        timings.ibf_io += load_time;
        log::info!("chunk of {} record(s)", records.len());

        let bin_count = filter.bin_count();
        let mut counts: Vec<CountVector> = records
            .iter()
            .map(|_| CountVector::new(bin_count))
            .collect();

        timings.compute += count_pass(&filter, &records, &mut counts, args, seed)?;

        for part in 1..args.parts - 1 {
            let path = part_path(&args.index, part);
            let (filter, load_time) = load_filter(&path, args.compressed)?;
            timings.ibf_io += load_time;
            ensure_bin_count(&filter, bin_count, &path)?;
            timings.compute += count_pass(&filter, &records, &mut counts, args, seed)?;
        }

        // The final part is fused with output: its bulk count happens in the
        // same pass that measures the minimiser count and emits the line.
        let last_path = part_path(&args.index, args.parts - 1);
        let (filter, load_time) = load_filter(&last_path, args.compressed)?;
        timings.ibf_io += load_time;
        ensure_bin_count(&filter, bin_count, &last_path)?;

        let output_worker = |lo: usize, slice: &mut [CountVector]| -> Result<()> {
            let mut agent = CountingAgent::new(&filter);
            let mut ws = MinimiserWorkspace::new();
            let mut line = String::with_capacity(128);
            for (j, total) in slice.iter_mut().enumerate() {
                let rec = &records[lo + j];
                extract_into(&rec.seq, args.kmer_size, args.window_size, seed, &mut ws);
                if ws.minimisers.is_empty() {
                    format_result_line(&mut line, &rec.id, &[], 0);
                } else {
                    total.saturating_add_assign(agent.bulk_count(&ws.minimisers));
                    let threshold = thresholder.threshold(ws.minimisers.len());
                    format_result_line(&mut line, &rec.id, total.as_slice(), threshold);
                }
                writer.write(&line)?;
            }
            Ok(())
        };
        timings.compute += run_partitioned_mut(&mut counts, args.threads, output_worker)?;
    }

    timings.reads_io = reader.io_seconds();
    writer.finish()?;
    Ok(timings)
}
