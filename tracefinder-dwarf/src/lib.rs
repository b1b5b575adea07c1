pub(crate) mod cfi;
pub(crate) mod die;
pub(crate) mod finder;
pub(crate) mod lazy;
pub mod line_list;
pub(crate) mod lines;
pub(crate) mod location;
pub mod probe;
pub(crate) mod source;

pub use finder::DebugInfo;
pub use line_list::LineList;
pub use probe::{
    ArgSpec, Config, FieldAccess, LineRange, LineRangeSpec, ProbePoint, ProbeRequest, ProbeSpec,
    TraceArg, TraceEvent, TracePoint,
};

use thiserror::Error;

/// Default cap on the number of probe records produced by one request.
pub const DEFAULT_MAX_TRACE_EVENTS: usize = 128;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object parsing error: {0}")]
    Object(#[from] object::Error),

    #[error("DWARF parsing error: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("No debug information found")]
    NoDebugInfo,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid probe request: {0}")]
    Invalid(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Mapping for DWARF register number {0} missing on this architecture")]
    MissingRegisterName(u16),

    #[error("Too many (> {0}) probe points found")]
    TooManyProbes(usize),
}

pub type Result<T> = std::result::Result<T, ProbeError>;
