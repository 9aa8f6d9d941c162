// Errors raised while building GPU state for a splat cloud

use thiserror::Error;

pub type SplatResult<T> = Result<T, SplatRenderError>;

/// Fatal problems detected before any pipeline state is built for a cloud.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("point cloud has no primitives")]
    EmptyPointCloud,

    #[error("point cloud has {count} primitives, the device supports at most {limit}")]
    TooManyPrimitives { count: usize, limit: usize },

    #[error("{buffer} buffer needs {required} bytes, the device allows {limit}")]
    BufferTooLarge {
        buffer: &'static str,
        required: u64,
        limit: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplatRenderError {
    #[error("invalid splat configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("GPU device lost: {0}")]
    DeviceLost(String),
}
