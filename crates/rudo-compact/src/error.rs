//! Recoverable errors on the mutator-facing surface.
//!
//! Everything inside a collection is fatal by assertion. Only heap setup,
//! klass registration and allocation report errors to the caller.

use std::fmt;
use std::io;

/// Errors returned by heap construction, klass registration and allocation.
#[derive(Debug)]
pub enum HeapError {
    /// The OS refused to reserve the backing store.
    Reserve(io::Error),
    /// No region (or run of regions) can satisfy the request.
    OutOfMemory {
        /// Size of the failed request in words.
        requested_words: usize,
    },
    /// A klass definition, redefinition or lookup was rejected.
    InvalidKlass(String),
    /// The requested heap geometry is unusable.
    InvalidGeometry(String),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserve(err) => write!(f, "failed to reserve heap: {err}"),
            Self::OutOfMemory { requested_words } => {
                write!(f, "out of heap memory allocating {requested_words} words")
            }
            Self::InvalidKlass(msg) => write!(f, "invalid klass: {msg}"),
            Self::InvalidGeometry(msg) => write!(f, "invalid heap geometry: {msg}"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reserve(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for HeapError {
    fn from(err: io::Error) -> Self {
        Self::Reserve(err)
    }
}
