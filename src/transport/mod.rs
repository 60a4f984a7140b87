//! Remote execution and file transfer
//!
//! The orchestrator never holds a session open: every call authenticates on
//! its own. [`RemoteTransport`] is the seam, [`SshTransport`] the production
//! implementation built on the system `ssh` and `scp` binaries.

mod ssh;

pub use ssh::SshTransport;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Failure of a single remote operation
#[derive(Debug, Error)]
pub enum TransportError {
    /// The local client binary could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The remote command ran and reported failure
    #[error("command '{command}' failed (status {status:?}): {output}")]
    CommandFailed {
        /// The remote command line
        command: String,
        /// Exit status, if one was reported
        status: Option<i32>,
        /// Combined diagnostic output
        output: String,
    },

    /// The connection went away without an exit status
    ///
    /// Expected after a reboot command.
    #[error("remote command exited without exit status or exit signal")]
    ConnectionDropped,

    /// The remote command did not finish in time
    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout {
        /// The remote command line
        command: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Copying a file to or from the host failed
    #[error("transfer {from} -> {to} failed: {message}")]
    Transfer {
        /// Source location
        from: String,
        /// Destination location
        to: String,
        /// Error message
        message: String,
    },
}

/// Per-call authenticated access to a host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command, discarding its output
    async fn execute_command(&self, host: &str, command: &str) -> Result<(), TransportError>;

    /// Run a command and return its standard output
    async fn execute_command_with_output(
        &self,
        host: &str,
        command: &str,
    ) -> Result<String, TransportError>;

    /// Copy a local file to a remote path
    async fn upload_file(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError>;

    /// Copy a remote file to a local path
    async fn download_file(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError>;

    /// Reboot the host
    ///
    /// A dropped connection is a successful reboot, not an error.
    async fn reboot(&self, host: &str) -> Result<(), TransportError>;
}
