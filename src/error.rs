//! Error types for ignis

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for rollout operations
///
/// Every variant returned from the provisioning path is fatal for the run:
/// the scheduler stops dispatching nodes that have not started yet. Degraded
/// but acceptable outcomes (an eviction wait that timed out) are reported as
/// values, never as errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Remote command or file transfer failure
    #[error("transport error on {host}: {source}")]
    Transport {
        /// Host the operation targeted
        host: String,
        /// The underlying transport failure
        #[source]
        source: TransportError,
    },

    /// A retried operation kept failing until its deadline
    #[error("{operation} on node {node} did not succeed within {deadline:?}: {last_error}")]
    RetryExhausted {
        /// Node the operation was run for
        node: String,
        /// Name of the retried operation
        operation: String,
        /// Deadline that elapsed
        deadline: Duration,
        /// Message of the last failed attempt
        last_error: String,
    },

    /// The run was cancelled while an operation was in flight
    #[error("{operation} on node {node} cancelled")]
    Cancelled {
        /// Node the operation was run for
        node: String,
        /// Name of the interrupted operation
        operation: String,
    },

    /// An etcd member stayed unhealthy after reboot
    #[error("etcd member {node} not healthy after {observations} observations")]
    QuorumUnhealthy {
        /// The etcd node
        node: String,
        /// Number of unhealthy observations made
        observations: u32,
    },

    /// A node expected in the cluster is missing
    #[error("node {0} not found in cluster")]
    NodeNotFound(String),

    /// Cluster topology is invalid or references unknown hosts
    #[error("topology error: {0}")]
    Topology(String),

    /// Invalid settings
    #[error("validation error: {0}")]
    Validation(String),

    /// Local filesystem error
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being read or written
        path: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Template rendering error
    #[error("template error: {0}")]
    Template(String),

    /// Certificate issuance error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// A hostname did not resolve to an address
    #[error("failed to resolve {host}: {message}")]
    Resolution {
        /// The hostname looked up
        host: String,
        /// What went wrong
        message: String,
    },

    /// A pooled worker task failed or panicked
    #[error("worker {node} failed: {message}")]
    WorkerFailed {
        /// The worker node
        node: String,
        /// What went wrong
        message: String,
    },
}

impl Error {
    /// Create a resolution error for the given host
    pub fn resolution(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a transport error for the given host
    pub fn transport(host: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            host: host.into(),
            source,
        }
    }

    /// Create a topology error with the given message
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an I/O error for the given path
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Whether this error was caused by run cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this error must stop the whole run
    ///
    /// Every failure on the provisioning path is fatal. A cancellation only
    /// reflects a stop that was already requested.
    pub fn is_fatal(&self) -> bool {
        !self.is_cancellation()
    }

    /// Node this error concerns, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Transport { host, .. } | Self::Resolution { host, .. } => Some(host),
            Self::RetryExhausted { node, .. }
            | Self::Cancelled { node, .. }
            | Self::QuorumUnhealthy { node, .. }
            | Self::WorkerFailed { node, .. } => Some(node),
            Self::NodeNotFound(node) => Some(node),
            _ => None,
        }
    }
}
