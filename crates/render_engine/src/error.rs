//! Error types for the graphics runtime
//!
//! All fallible initialization APIs return [`GfxResult`]. Vulkan results that
//! are not recoverable at the call site are wrapped in [`GraphicsError::Api`].

use ash::vk;
use thiserror::Error;

/// Graphics runtime error type
#[derive(Error, Debug)]
pub enum GraphicsError {
    /// Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The unique identifier of the resource
        id: u32,
    },

    /// Named object could not be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Device or staging memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Runtime initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shader module failed to load or reflect
    #[error("Shader error: {0}")]
    Shader(String),

    /// Operation aborted (shutdown in progress)
    #[error("Operation aborted")]
    Abort,

    /// Unclassified failure
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type for graphics runtime operations
pub type GfxResult<T> = Result<T, GraphicsError>;

impl From<vk::Result> for GraphicsError {
    fn from(result: vk::Result) -> Self {
        GraphicsError::Api(result)
    }
}

/// Outcome of an acquire or present call on the viewport.
///
/// `ERROR_OUT_OF_DATE_KHR` and `SUBOPTIMAL_KHR` are not errors at this
/// layer; they request a swapchain rebuild on the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The image was presented (or acquired) successfully
    Ok,
    /// The swapchain must be recreated before the next frame
    NeedsRecreate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_conversion() {
        let err: GraphicsError = vk::Result::ERROR_DEVICE_LOST.into();
        match err {
            GraphicsError::Api(result) => assert_eq!(result, vk::Result::ERROR_DEVICE_LOST),
            _ => panic!("expected Api variant"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = GraphicsError::ResourceNotFound { id: 42 };
        assert_eq!(err.to_string(), "Resource not found: 42");
    }
}
