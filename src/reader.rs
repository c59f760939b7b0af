//! Chunked streaming of query records.
//!
//! The query file is read in chunks of at most `chunk_size` records; each
//! chunk is materialised in memory and its record order is the order results
//! must appear in the output. A single-record lookahead lets the caller ask
//! whether another chunk exists before spending time on it, so filter loads
//! can overlap chunk materialisation.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use needletail::{parse_fastx_reader, FastxReader};

use crate::error::{Result, SkuaError};

/// Default records per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * (1 << 20);

/// One query sequence, immutable after read.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub id: String,
    pub seq: Vec<u8>,
}

pub struct ChunkedReader {
    reader: Box<dyn FastxReader>,
    path: PathBuf,
    chunk_size: usize,
    peeked: Option<QueryRecord>,
    io_time: f64,
}

impl std::fmt::Debug for ChunkedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedReader")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("peeked", &self.peeked)
            .field("io_time", &self.io_time)
            .finish()
    }
}

impl ChunkedReader {
    /// Open a FASTA or FASTQ query file.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SkuaError::validation("chunk size must be non-zero"));
        }
        let file = File::open(path).map_err(|e| SkuaError::io(path, "open", e))?;
        let reader = parse_fastx_reader(BufReader::new(file))
            .map_err(|e| SkuaError::format(path, format!("not a FASTA/FASTQ stream: {}", e)))?;
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            chunk_size,
            peeked: None,
            io_time: 0.0,
        })
    }

    fn fetch(&mut self) -> Result<Option<QueryRecord>> {
        let start = Instant::now();
        let record = match self.reader.next() {
            None => None,
            Some(Err(e)) => {
                return Err(SkuaError::format(
                    &self.path,
                    format!("invalid query record: {}", e),
                ))
            }
            Some(Ok(rec)) => Some(QueryRecord {
                id: String::from_utf8_lossy(rec.id()).into_owned(),
                seq: rec.seq().into_owned(),
            }),
        };
        self.io_time += start.elapsed().as_secs_f64();
        Ok(record)
    }

    /// Whether at least one more record exists. Pulls a single record into
    /// the lookahead slot.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.fetch()?;
        }
        Ok(self.peeked.is_some())
    }

    /// Materialise the next chunk, at most `chunk_size` records in input
    /// order. An empty vector signals end of input.
    pub fn next_chunk(&mut self) -> Result<Vec<QueryRecord>> {
        let mut records = Vec::new();
        if let Some(rec) = self.peeked.take() {
            records.push(rec);
        }
        while records.len() < self.chunk_size {
            match self.fetch()? {
                Some(rec) => records.push(rec),
                None => break,
            }
        }
        Ok(records)
    }

    /// Total wall seconds spent pulling records so far.
    pub fn io_seconds(&self) -> f64 {
        self.io_time
    }
}
