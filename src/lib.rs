//! skua: an Interleaved-Bloom-Filter search engine for minimiser-indexed
//! reference bins.
//!
//! A reference collection is split into bins and indexed by the canonical
//! minimisers of its sequences; a search streams query records in chunks,
//! counts per-bin minimiser membership in bulk, and reports every bin whose
//! count reaches a per-query threshold. Partitioned indexes are searched
//! part by part with overlapped loading; per-part counts add up to the
//! single-filter result.

pub mod build;
pub mod error;
pub mod ibf;
pub mod index_io;
pub mod logging;
pub mod minimiser;
pub mod parallel;
pub mod reader;
pub mod search;
pub mod threshold;
pub mod writer;

pub use error::{Result, SkuaError};
