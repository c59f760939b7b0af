//! Unified error type for the skua library.
//!
//! Library code returns `SkuaError` with enough context to print a single
//! useful diagnostic line; the CLI layer wraps it in `anyhow::Result`.
//!
//! # Error Categories
//!
//! - **Io**: file system operations (open, read, write), with path context
//! - **Format**: corrupt index or cache archives (magic bytes, structure)
//! - **Version**: archive version mismatch
//! - **Validation**: invalid search or build parameters
//! - **Threshold**: threshold model failures

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Unified error type for the skua library.
#[derive(Debug)]
pub enum SkuaError {
    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Corrupt archive (bad magic bytes, truncated payload, invalid structure).
    Format { path: PathBuf, detail: String },

    /// Archive version mismatch.
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// Invalid parameters (violated search invariants).
    Validation(String),

    /// Threshold model failure.
    Threshold(String),
}

impl fmt::Display for SkuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkuaError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            SkuaError::Format { path, detail } => {
                write!(f, "Corrupt archive '{}': {}", path.display(), detail)
            }
            SkuaError::Version {
                path,
                found,
                expected,
            } => {
                write!(
                    f,
                    "Unsupported archive version {} in '{}' (expected {})",
                    found,
                    path.display(),
                    expected
                )
            }
            SkuaError::Validation(msg) => write!(f, "Invalid parameters: {}", msg),
            SkuaError::Threshold(msg) => write!(f, "Threshold model error: {}", msg),
        }
    }
}

impl std::error::Error for SkuaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkuaError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convenience type alias for Results using SkuaError.
pub type Result<T> = std::result::Result<T, SkuaError>;

// ============================================================================
// Helper constructors
// ============================================================================

impl SkuaError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        SkuaError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create a corrupt-archive error.
    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        SkuaError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a version-mismatch error.
    pub fn version(path: impl Into<PathBuf>, found: u32, expected: u32) -> Self {
        SkuaError::Version {
            path: path.into(),
            found,
            expected,
        }
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        SkuaError::Validation(msg.into())
    }

    /// Create a threshold model error.
    pub fn threshold(msg: impl Into<String>) -> Self {
        SkuaError::Threshold(msg.into())
    }
}

// ============================================================================
// Thread-safe first-error capture
// ============================================================================

/// Stores the first error observed across a set of worker threads.
///
/// The dispatcher joins all workers before returning; workers that fail after
/// the first error are logged by the caller, not stored. Uses an atomic flag
/// so losers of the race never touch the mutex slot.
pub struct FirstErrorCapture {
    has_error: AtomicBool,
    error: Mutex<Option<SkuaError>>,
}

impl FirstErrorCapture {
    /// Create a new, empty error capture.
    pub fn new() -> Self {
        Self {
            has_error: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Store an error, but only if no error has been stored yet.
    /// Returns true if this error was stored.
    pub fn store(&self, err: SkuaError) -> bool {
        if self
            .has_error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Ok(mut guard) = self.error.lock() {
                *guard = Some(err);
            }
            true
        } else {
            false
        }
    }

    /// Retrieve the stored error, if any.
    pub fn take(&self) -> Option<SkuaError> {
        if self.has_error.load(Ordering::SeqCst) {
            self.error.lock().ok().and_then(|mut g| g.take())
        } else {
            None
        }
    }

    /// Check whether an error has been stored.
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }
}

impl Default for FirstErrorCapture {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
