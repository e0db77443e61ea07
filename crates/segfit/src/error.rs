//! Allocation error types.

use snafu::Snafu;

/// Errors reported by allocate and resize.
///
/// Both variants are recoverable: an invalid request is simply refused, and
/// exhaustion clears once the caller frees other blocks.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    /// The requested size was zero or above [`MAX_REQUEST`](crate::MAX_REQUEST).
    #[snafu(display("invalid request size: {size} bytes"))]
    InvalidRequest {
        /// The offending request size.
        size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// No free block large enough for the rounded request exists.
    #[snafu(display("segment exhausted: no free block holds {needed} bytes"))]
    Exhausted {
        /// The rounded payload size that could not be satisfied.
        needed: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}
