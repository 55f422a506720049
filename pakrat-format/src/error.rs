use std::sync::Arc;

pub type PakratResult<T> = Result<T, PakratError>;

/// Error kinds shared by the format parsers and the runtime caches.
///
/// Everything here is fatal. The runtime is a closed world: a malformed table,
/// a missing file, or a refcount underflow means broken packaging output or a
/// caller bug, never a transient condition worth retrying.
#[derive(Debug, Clone)]
pub enum PakratError {
    /// Bad packaging output: truncated tables, out-of-range indices, duplicate
    /// ids, cyclic dependencies.
    Configuration(String),
    /// An id the manifest does not know, or a storage file that is absent.
    NotFound(String),
    /// Caller-discipline defects: refcount underflow, double loads, unloading
    /// a handle the cache does not own.
    InvariantViolation(String),
    IoError(Arc<std::io::Error>),
}

impl std::error::Error for PakratError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            PakratError::Configuration(_) => None,
            PakratError::NotFound(_) => None,
            PakratError::InvariantViolation(_) => None,
            PakratError::IoError(ref e) => Some(&**e),
        }
    }
}

impl core::fmt::Display for PakratError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            PakratError::Configuration(ref msg) => write!(fmt, "configuration error: {}", msg),
            PakratError::NotFound(ref msg) => write!(fmt, "not found: {}", msg),
            PakratError::InvariantViolation(ref msg) => {
                write!(fmt, "invariant violation: {}", msg)
            }
            PakratError::IoError(ref e) => e.fmt(fmt),
        }
    }
}

impl From<std::io::Error> for PakratError {
    fn from(error: std::io::Error) -> Self {
        PakratError::IoError(Arc::new(error))
    }
}
