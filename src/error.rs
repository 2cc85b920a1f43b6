//! Error types for Dolomite

use thiserror::Error;

/// Main error type for Dolomite operations
#[derive(Error, Debug)]
pub enum Error {
    /// No adapter is registered for the requested format tag
    #[error("Unsupported format: the model_type `{0}` is not yet supported")]
    UnsupportedFormat(String),

    /// A configuration value the conversion depends on is absent
    #[error("Missing configuration: `{0}` is required but was not found")]
    MissingConfiguration(String),

    /// The configuration cannot be expressed in the target format
    #[error("Incompatible configuration for {format}: {reason}")]
    IncompatibleConfiguration {
        /// Target format tag
        format: String,
        /// What is not representable
        reason: String,
    },

    /// A feature dimension does not fit in one fused kernel block
    #[error("Feature dimension {features} exceeds the maximum fused block size {block_size}")]
    FeatureDimensionTooLarge {
        /// Requested feature dimension
        features: usize,
        /// Largest block the kernel can address
        block_size: usize,
    },

    /// A tensor shape disagrees with the declared configuration
    #[error("Shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name
        name: String,
        /// Shape implied by the configuration
        expected: Vec<usize>,
        /// Shape found in the checkpoint
        actual: Vec<usize>,
    },

    /// Repeated key/value heads of one group are not identical
    #[error("Key/value heads of group {group} in `{name}` are not identical copies")]
    HeadGroupMismatch {
        /// Tensor name
        name: String,
        /// Index of the offending key/value group
        group: usize,
    },

    /// A tensor required by the layout is absent from the checkpoint
    #[error("Missing tensor: `{0}`")]
    MissingTensor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint container error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Remote source resolution error
    #[error("Hub error: {0}")]
    Hub(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Dolomite operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an unsupported format error
    pub fn unsupported_format(tag: impl Into<String>) -> Self {
        Self::UnsupportedFormat(tag.into())
    }

    /// Create a missing configuration error
    pub fn missing_configuration(field: impl Into<String>) -> Self {
        Self::MissingConfiguration(field.into())
    }

    /// Create an incompatible configuration error
    pub fn incompatible(format: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IncompatibleConfiguration {
            format: format.into(),
            reason: reason.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a missing tensor error
    pub fn missing_tensor(name: impl Into<String>) -> Self {
        Self::MissingTensor(name.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a hub error
    pub fn hub(msg: impl Into<String>) -> Self {
        Self::Hub(msg.into())
    }
}

#[cfg(feature = "fused")]
impl From<dolomite_simd::KernelError> for Error {
    fn from(err: dolomite_simd::KernelError) -> Self {
        use dolomite_simd::KernelError;
        match err {
            KernelError::FeatureDimensionTooLarge { features, block_size } => {
                Self::FeatureDimensionTooLarge { features, block_size }
            }
            KernelError::LengthMismatch {
                buffer,
                expected,
                actual,
            } => Self::shape_mismatch(buffer, &[expected], &[actual]),
            KernelError::EmptyFeatures => Self::config("feature dimension must be greater than zero"),
        }
    }
}
