use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use skua::build::{build, BuildArguments};
use skua::logging::init_logger;
use skua::reader::DEFAULT_CHUNK_SIZE;
use skua::search::{search, SearchArguments};

#[derive(Parser)]
#[command(name = "skua")]
#[command(about = "Interleaved-Bloom-Filter search over minimiser-indexed reference bins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a single or partitioned filter from reference FASTA files
    Build {
        /// Output filter file (partitioned builds write `<output>_<part>`)
        #[arg(short, long)]
        output: PathBuf,
        /// Reference files, one bin each, in bin-index order
        #[arg(short, long, required = true)]
        reference: Vec<PathBuf>,
        /// K-mer size
        #[arg(long, default_value_t = 20)]
        k: usize,
        /// Minimiser window size in bases
        #[arg(short, long, default_value_t = 24)]
        window: usize,
        /// Bloom hash functions per filter
        #[arg(long, default_value_t = 2)]
        hash: u32,
        /// Target false-positive rate for the derived bin size
        #[arg(long, default_value_t = 0.05)]
        fp_rate: f64,
        /// Explicit bin size in rows, overriding the fp-rate derivation
        #[arg(long)]
        bin_size: Option<u64>,
        /// Number of filter parts
        #[arg(short, long, default_value_t = 1)]
        parts: usize,
        /// Store the rank-compressed read-only layout
        #[arg(short, long)]
        compressed: bool,
    },

    /// Search queries against a filter, reporting hit bins per record
    Search {
        /// Filter file, or path prefix of a partitioned filter
        #[arg(short, long)]
        index: PathBuf,
        /// FASTA/FASTQ query file
        #[arg(short, long)]
        query: PathBuf,
        /// Result file, one line per query record
        #[arg(short, long)]
        output: PathBuf,
        /// K-mer size the index was built with
        #[arg(long, default_value_t = 20)]
        k: usize,
        /// Minimiser window size the index was built with
        #[arg(short, long, default_value_t = 24)]
        window: usize,
        /// Pattern (query segment) size for the threshold model
        #[arg(long, default_value_t = 100)]
        pattern: usize,
        /// Error budget for the threshold model
        #[arg(short, long, default_value_t = 2)]
        errors: usize,
        /// Threshold model confidence
        #[arg(long, default_value_t = 0.99)]
        tau: f64,
        /// Explicit fractional threshold, bypassing the model
        #[arg(long)]
        threshold: Option<f64>,
        /// Worker threads
        #[arg(short, long, default_value_t = 1)]
        threads: usize,
        /// Number of filter parts
        #[arg(short, long, default_value_t = 1)]
        parts: usize,
        /// The index uses the rank-compressed layout
        #[arg(short, long)]
        compressed: bool,
        /// Write phase timings to `<output>.time`
        #[arg(long)]
        write_timings: bool,
        /// Query records per chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Commands::Build {
            output,
            reference,
            k,
            window,
            hash,
            fp_rate,
            bin_size,
            parts,
            compressed,
        } => {
            let args = BuildArguments {
                references: reference,
                output,
                kmer_size: k,
                window_size: window,
                hash_count: hash,
                fp_rate,
                bin_size,
                parts,
                compressed,
            };
            build(&args)?;
        }

        Commands::Search {
            index,
            query,
            output,
            k,
            window,
            pattern,
            errors,
            tau,
            threshold,
            threads,
            parts,
            compressed,
            write_timings,
            chunk_size,
        } => {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .ok();
            let args = SearchArguments {
                index,
                query,
                output,
                kmer_size: k,
                window_size: window,
                pattern_size: pattern,
                errors,
                tau,
                threshold,
                threads,
                parts,
                compressed,
                write_timings,
                chunk_size,
            };
            search(&args)?;
        }
    }
    Ok(())
}
