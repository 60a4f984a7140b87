//! Ignis - rolling boot-configuration updates for a bare-metal Kubernetes fleet
//!
//! Ignis renders per-node ignition configuration, works out which nodes have
//! drifted from it, and re-provisions them role by role: etcd one node at a
//! time behind a quorum gate, the apiserver, a bounded pool of workers that
//! are drained first and must rejoin, and finally prometheus.
//!
//! # Modules
//!
//! - [`topology`] - Cluster topology (role to nodes) loaded from YAML
//! - [`config`] - Run settings and fixed remote paths
//! - [`policy`] - Per-role provisioning policy table
//! - [`retry`] - Deadline-bounded, cancellable retry executor
//! - [`transport`] - Remote command execution and file transfer over ssh
//! - [`cluster`] - Kubernetes node lifecycle operations
//! - [`drain`] - Cordon, taint and bounded eviction wait
//! - [`health`] - Etcd quorum and node rejoin gates
//! - [`provision`] - Per-node provisioning state machine
//! - [`schedule`] - Role ordering and the worker pool
//! - [`select`] - Checksum-based selection of nodes needing change
//! - [`analyze`] - Drift report between installed and generated configuration
//! - [`generate`] - Template rendering of per-node configuration
//! - [`pki`] - Certificate issuance for generated configuration
//! - [`resolve`] - Hostname resolution for template variables
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod analyze;
pub mod cluster;
pub mod config;
pub mod drain;
pub mod error;
pub mod generate;
pub mod health;
pub mod pki;
pub mod policy;
pub mod provision;
pub mod resolve;
pub mod retry;
pub mod schedule;
pub mod select;
pub mod topology;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
