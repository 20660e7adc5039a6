//! Heap error types.

use std::error::Error;
use std::fmt;

/// Errors returned by [`Heap`](crate::Heap) operations.
///
/// A page without room is not an error: the heap moves on to another
/// page. Misuse of pointers (foreign, misaligned, freed twice) panics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The operating system refused to reserve or commit a new region.
    OutOfMemory {
        /// Rounded size of the allocation that needed the region.
        requested: usize,
    },
    /// The size is zero or larger than the heap allows.
    InvalidSize {
        /// Size passed by the caller.
        size: usize,
        /// Largest size the heap accepts.
        max: usize,
    },
    /// A [`HeapConfig`](crate::HeapConfig) value is out of range.
    InvalidConfig {
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: cannot commit a region for {requested} bytes")
            }
            Self::InvalidSize { size, max } => {
                write!(f, "invalid allocation size {size}, must be in 1..={max}")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid heap configuration: {reason}")
            }
        }
    }
}

impl Error for HeapError {}

#[cfg(test)]
mod tests {
    use super::HeapError;

    #[test]
    fn display() {
        let err = HeapError::InvalidSize { size: 0, max: 2048 };
        assert_eq!(err.to_string(), "invalid allocation size 0, must be in 1..=2048");

        let err = HeapError::OutOfMemory { requested: 65536 };
        assert!(err.to_string().contains("65536"));
    }
}
