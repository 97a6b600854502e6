//! Error types and handling for subframe

/// Result type alias for subframe operations
pub type Result<T> = std::result::Result<T, SubframeError>;

/// Error types for the sub-timeframe assembler and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum SubframeError {
    /// I/O related errors (memfd, mmap, /proc reads)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Invalid parameters or configuration, fatal at construction
    #[error("Invalid configuration: {parameter} - {message}")]
    Config { parameter: String, message: String },

    /// System resource pre-flight check failed
    #[error("Resource check failed: {resource} has {available} bytes free, {requested} required")]
    ResourceCheck {
        resource: String,
        requested: u64,
        available: u64,
    },

    /// Page pool has no free page
    #[error("Pool exhausted: {pool}")]
    PoolExhausted { pool: String },

    /// Parent page has less room than a child allocation needs
    #[error("No room: requested {requested}, available {available}")]
    NoRoom { requested: usize, available: usize },

    /// A DataSet could not be formatted into an STF message
    #[error("Format failure: {message}")]
    FormatFailure { message: String },

    /// A DataSet violated stream consistency (e.g. mixed timeframe ids)
    #[error("Stream consistency: {message}")]
    StreamConsistency { message: String },

    /// Downstream multi-part send failed
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Worker pipeline rejected input (FIFO full)
    #[error("Pipeline full: dropping timeframe {timeframe_id}")]
    PipelineFull { timeframe_id: u64 },

    /// Operation not supported by this consumer
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },
}

impl SubframeError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a pool exhaustion error
    pub fn pool_exhausted(pool: impl Into<String>) -> Self {
        Self::PoolExhausted { pool: pool.into() }
    }

    /// Create a no-room error
    pub fn no_room(requested: usize, available: usize) -> Self {
        Self::NoRoom {
            requested,
            available,
        }
    }

    /// Create a format failure error
    pub fn format_failure(message: impl Into<String>) -> Self {
        Self::FormatFailure {
            message: message.into(),
        }
    }

    /// Create a stream consistency error
    pub fn stream_consistency(message: impl Into<String>) -> Self {
        Self::StreamConsistency {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for SubframeError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}
