use common::{EffectKind, PixelFormat};
use thiserror::Error;

use crate::backend::{BackendError, OpenSharedError};

/// Why an engine call did not produce a result.
///
/// Every variant is recoverable: the caller keeps showing the previous
/// texture contents and tries again on a later frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("No GPU device available")]
    NoDevice,

    #[error("No destination texture")]
    MissingDestination,

    #[error("Effect {0} has no program source")]
    EmptySource(EffectKind),

    #[error("Failed to compile {kind} program: {source}")]
    Compile {
        kind: EffectKind,
        #[source]
        source: BackendError,
    },

    #[error("Failed to create {view} view: {source}")]
    ViewCreation {
        view: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("Failed to allocate parameter buffer: {0}")]
    BufferAllocation(#[source] BackendError),

    #[error("Format {0} cannot be written by compute programs on this device")]
    UnsupportedFormat(PixelFormat),

    #[error("Failed to open shared handle: {0}")]
    OpenShared(#[from] OpenSharedError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Failed to save texture: {0}")]
    Save(String),
}
