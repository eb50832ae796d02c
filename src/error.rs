//! Crate-level error types.

use std::fmt;
use std::path::PathBuf;

use crate::frame::SlotState;
use crate::gpu::GpuError;

/// Errors produced by the prism crate.
#[derive(Debug)]
pub enum PrismError {
    /// A device call failed.
    Gpu(GpuError),
    /// A pass program could not be read from disk.
    ShaderLoad {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// A pass requested a program that was never loaded.
    MissingShader(String),
    /// Generic I/O failure.
    Io(std::io::Error),
    /// TOML options parsing/serialization failure.
    OptionsParse(String),
    /// The scene needs more binding-table entries than were allocated.
    CapacityExceeded {
        /// What overflowed (e.g. `"sub-meshes"`).
        what: &'static str,
        /// Entries the scene needs.
        requested: usize,
        /// Entries available.
        capacity: usize,
    },
    /// A frame-slot operation was called out of order.
    SlotState {
        /// Operation attempted.
        operation: &'static str,
        /// State the slot was in.
        state: SlotState,
    },
    /// A scene object references an asset that does not exist.
    InvalidScene(String),
    /// Viewer event-loop failure.
    Viewer(String),
}

impl fmt::Display for PrismError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu(e) => write!(f, "GPU error: {e}"),
            Self::ShaderLoad { path, source } => {
                write!(f, "failed to load shader {}: {source}", path.display())
            }
            Self::MissingShader(name) => {
                write!(f, "shader {name} was not loaded")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OptionsParse(msg) => {
                write!(f, "options parse error: {msg}")
            }
            Self::CapacityExceeded {
                what,
                requested,
                capacity,
            } => write!(
                f,
                "scene needs {requested} {what} but only {capacity} fit the \
                 binding table"
            ),
            Self::SlotState { operation, state } => {
                write!(f, "frame slot cannot {operation} while {state:?}")
            }
            Self::InvalidScene(msg) => write!(f, "invalid scene: {msg}"),
            Self::Viewer(msg) => write!(f, "viewer error: {msg}"),
        }
    }
}

impl std::error::Error for PrismError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gpu(e) => Some(e),
            Self::ShaderLoad { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for PrismError {
    fn from(e: GpuError) -> Self {
        Self::Gpu(e)
    }
}

impl From<std::io::Error> for PrismError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
