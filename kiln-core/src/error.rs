use std::path::PathBuf;

use thiserror::Error;

use crate::options::{OptionKey, ValueKind};

/// Errors signaled synchronously by `Context` calls.
///
/// Compilation problems are never returned through this type; they are
/// recorded as diagnostics and polled from the sink.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("unit `{name}` was not found at {}", .path.display())]
    UnitNotFound { name: String, path: PathBuf },
    #[error("{} is already part of this compilation", .0.display())]
    DuplicateUnit(PathBuf),
    #[error("{0} is not valid UTF-8")]
    EncodingError(&'static str),
    #[error("the pipeline has finished; no more units can be added")]
    PipelineClosed,
    #[error("the pipeline was already started")]
    AlreadyStarted,
    #[error("options cannot be changed after the pipeline has started")]
    OptionsFrozen,
    #[error("option {key:?} expects a {expected} value but received a {found} value")]
    OptionType {
        key: OptionKey,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("invalid value for option {key:?}: {reason}")]
    InvalidOption { key: OptionKey, reason: String },
    #[error("diagnostic index {index} is out of range (count is {count})")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("output buffer holds {actual} bytes but the module is {expected} bytes")]
    BufferSizeMismatch { expected: usize, actual: usize },
}
