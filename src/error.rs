//! Error types for the expose controller
//!
//! Errors carry enough context to be logged on their own. The reconciler
//! uses the classification helpers on [`Error`] to decide whether a failed
//! key is re-queued with backoff, treated as already satisfied, or dropped.

use thiserror::Error;

/// HTTP status the API server returns for a missing object
const STATUS_NOT_FOUND: u16 = 404;

/// HTTP status the API server returns when a create collides with an existing object
const STATUS_CONFLICT: u16 = 409;

/// Status reason distinguishing a create collision from an update conflict
const REASON_ALREADY_EXISTS: &str = "AlreadyExists";

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A reconciliation key could not be derived or parsed
    #[error("invalid key {key:?}: {message}")]
    InvalidKey {
        /// The offending key as text
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// The local cache did not finish its initial listing
    #[error("cache sync error: {message}")]
    CacheSync {
        /// Description of what failed
        message: String,
    },

    /// Startup configuration could not be resolved
    #[error("configuration error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred (e.g. "build_service", "worker")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a cache sync error
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// True if the API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(resp) } if resp.code == STATUS_NOT_FOUND)
    }

    /// True if a create failed because an object with that name already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::Kube { source: kube::Error::Api(resp) }
                if resp.code == STATUS_CONFLICT && resp.reason == REASON_ALREADY_EXISTS
        )
    }

    /// Whether a key that failed with this error should be re-queued with backoff
    ///
    /// Malformed keys and configuration problems never heal on their own;
    /// everything else (network, conflicts, throttling, server errors) may.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } | Self::CacheSync { .. } | Self::Internal { .. } => true,
            Self::InvalidKey { .. } | Self::Config { .. } => false,
        }
    }
}
