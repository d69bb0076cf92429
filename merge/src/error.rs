//! Merge error taxonomy.
//!
//! Every failure aborts the run before anything is published. The kind only
//! tells the caller whether waiting for the next scheduled run will help.

use hyaline_artifact_store::StoreError;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error kind for structured logging and exit status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Listing, download or upload failed; the next run retries wholesale.
    TransientIo,
    /// The external fold failed or produced invalid output.
    Fold,
    /// Misconfiguration or a corrupt checkpoint lineage; retrying won't help.
    Configuration,
}

impl ErrorKind {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientIo => "TRANSIENT_IO_ERROR",
            Self::Fold => "FOLD_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
        }
    }

    /// Process exit status reported for this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration => 2,
            Self::TransientIo => 3,
            Self::Fold => 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("transient I/O error: {message}")]
    TransientIo {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("fold error: {message}")]
    Fold {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl MergeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientIo { .. } => ErrorKind::TransientIo,
            Self::Fold { .. } => ErrorKind::Fold,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientIo {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn fold(message: impl Into<String>) -> Self {
        Self::Fold {
            message: message.into(),
            source: None,
        }
    }

    pub fn fold_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Fold {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Classify a store failure: misconfiguration is fatal, everything else
    /// is transient.
    pub fn from_store(context: impl Into<String>, err: StoreError) -> Self {
        let context = context.into();
        let message = format!("{context}: {err}");
        if err.is_config() {
            Self::config_with_source(message, err)
        } else {
            Self::transient_with_source(message, err)
        }
    }

    /// Local filesystem failure in the work directory.
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        let context = context.into();
        Self::transient_with_source(format!("{context}: {err}"), err)
    }
}

impl From<StoreError> for MergeError {
    fn from(err: StoreError) -> Self {
        Self::from_store("artifact store", err)
    }
}

/// Result type for merge operations
pub type Result<T> = std::result::Result<T, MergeError>;
