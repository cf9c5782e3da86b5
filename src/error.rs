//! Error handling utils.

use crate::schedule::ScheduleParseError;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The nd-range passed to a dispatch is malformed or exceeds a device
    /// limit. Raised before any work-item runs.
    #[error("nd-range error: {0}")]
    NdRange(String),

    /// The requested local memory exceeds the device limit. Raised before
    /// any work-item runs.
    #[error("accessor error: {0}")]
    Accessor(String),

    /// One or more work-items panicked. Panic messages are kept in the
    /// order the panics were caught; the remaining work-items ran to
    /// completion before this was reported.
    #[error("kernel panicked in {} work-item(s), first: {}", .0.len(), first_panic(.0))]
    Kernel(Vec<String>),

    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("failed to decode system configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("{0}")]
    Schedule(#[from] ScheduleParseError),
}

fn first_panic(panics: &[String]) -> &str {
    panics.first().map(String::as_str).unwrap_or("<no message>")
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::NdRange(_) => "NdRange",
            Self::Accessor(_) => "Accessor",
            Self::Kernel(_) => "Kernel",
            Self::IO(_) => "IO",
            Self::Config(_) => "Config",
            Self::Schedule(_) => "Schedule",
        }
    }
}
