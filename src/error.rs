//! Pipeline error taxonomy

use thiserror::Error;

/// Coarse classification used by the driver to decide between retrying,
/// rebuilding and terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The stream negotiation was invalidated underneath us (rotation change,
    /// global reconfiguration). The caller rebuilds the pipeline.
    StructuralChange,
    /// The accelerator reported temporary power or resource unavailability.
    TransientResourceExhaustion,
    /// Unsupported resolution, format, device or invalid configuration.
    ConfigurationError,
    /// Anything else from the accelerator or video channel.
    FatalDriverError,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("video channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("unsupported stream format: {0}")]
    FormatUnsupported(String),

    #[error("stream changed structurally: {0}")]
    StructuralChange(String),

    #[error("no accelerator device named {0:?}")]
    DeviceNotFound(String),

    #[error("failed to load model: {0}")]
    LoadFailed(String),

    #[error("accelerator power not available")]
    PowerUnavailable,

    #[error("accelerator power still not available after {attempts} attempts")]
    PowerExhausted { attempts: u32 },

    #[error("tensor binding table is full ({capacity} slots)")]
    BindingTableFull { capacity: usize },

    #[error("job graph has not been built for the current stream")]
    GraphNotBuilt,

    #[error("accelerator driver error: {0}")]
    Driver(String),

    #[error("channel driver error: {0}")]
    Channel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StructuralChange(_) => ErrorKind::StructuralChange,
            Error::PowerUnavailable => ErrorKind::TransientResourceExhaustion,
            Error::FormatUnsupported(_)
            | Error::DeviceNotFound(_)
            | Error::InvalidConfig(_)
            | Error::Config(_) => ErrorKind::ConfigurationError,
            Error::ChannelUnavailable(_)
            | Error::LoadFailed(_)
            | Error::PowerExhausted { .. }
            | Error::BindingTableFull { .. }
            | Error::GraphNotBuilt
            | Error::Driver(_)
            | Error::Channel(_)
            | Error::Io(_) => ErrorKind::FatalDriverError,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientResourceExhaustion
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
