//! Crate-wide error type.

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Describes the general category of a datatype/pack/progress failure.
///
/// Mirrors the taxonomy a caller needs to decide what to do next: `NotSupported` means "flatten
/// the type and retry on the sequential path", `BadArgs` means the constructor call itself was
/// invalid, and the rest are terminal for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid constructor parameters, or a required output pointer was null.
    BadArgs,

    /// Host or device allocation failure.
    OutOfMemory,

    /// The backend does not support this datatype, or the type is larger than a temporary slab.
    ///
    /// Callers must fall back to flattening the type and packing on the sequential path.
    NotSupported,

    /// An invariant was violated. Only raised from `debug_assert!`-guarded paths.
    Internal,

    /// A wrapped driver-level error. The opaque backend code is retained for inspection.
    BackendError(i32),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::BackendError(code) => write!(f, "BackendError({code})"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl StdError for Error {}

pub type Result<T> = std::result::Result<T, Error>;
