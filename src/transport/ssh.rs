//! [`RemoteTransport`] over the system OpenSSH client

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{RemoteTransport, TransportError};

/// Timeout applied to every remote command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout applied to every scp transfer
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Seconds ssh waits for the TCP connection
const CONNECT_TIMEOUT_SECS: u32 = 10;

/// Keepalive probing: a silent peer is dropped after interval * count seconds
const SERVER_ALIVE_INTERVAL_SECS: u32 = 5;
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

/// Exit status ssh uses for its own (connection level) failures
const SSH_CONNECTION_ERROR: i32 = 255;

const REBOOT_COMMAND: &str = "sudo systemctl reboot";

/// Shells out to `ssh`/`scp` with a fixed user and identity file
#[derive(Clone, Debug)]
pub struct SshTransport {
    user: String,
    identity_file: PathBuf,
}

impl SshTransport {
    /// Create a transport authenticating as `user` with `identity_file`
    pub fn new(user: impl Into<String>, identity_file: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            identity_file: identity_file.into(),
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.identity_file.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
            "-o".to_string(),
            format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}"),
            "-o".to_string(),
            format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}"),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ]
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push(self.destination(host));
        args.push(command.to_string());
        args
    }

    async fn run_ssh(&self, host: &str, command: &str) -> Result<String, TransportError> {
        debug!(host = %host, command = %command, "running remote command");
        let output = Command::new("ssh")
            .args(self.ssh_args(host, command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                program: "ssh".to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let mut diagnostic = String::from_utf8_lossy(&output.stderr).to_string();
        diagnostic.push_str(&String::from_utf8_lossy(&output.stdout));
        Err(classify_failure(command, output.status.code(), &diagnostic))
    }

    async fn run_scp(&self, from: String, to: String) -> Result<(), TransportError> {
        let mut args = self.common_args();
        args.push("-q".to_string());
        args.push(from.clone());
        args.push(to.clone());

        let output = Command::new("scp")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                program: "scp".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(TransportError::Transfer {
                from,
                to,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Await `operation`, failing with [`TransportError::Timeout`] after `timeout`
///
/// Dropping the timed-out future kills the child process.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    description: &str,
    operation: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            command: description.to_string(),
            timeout,
        }),
    }
}

/// Map a failed ssh invocation onto a [`TransportError`]
///
/// ssh reports a vanished peer either by dying without a status or with
/// status 255 and a closed-connection message.
pub(crate) fn classify_failure(command: &str, status: Option<i32>, output: &str) -> TransportError {
    let dropped = match status {
        None => true,
        Some(SSH_CONNECTION_ERROR) => {
            let lower = output.to_lowercase();
            lower.contains("closed by remote host")
                || lower.contains("connection closed")
                || lower.contains("without exit status")
        }
        Some(_) => false,
    };

    if dropped {
        TransportError::ConnectionDropped
    } else {
        TransportError::CommandFailed {
            command: command.to_string(),
            status,
            output: output.trim().to_string(),
        }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn execute_command(&self, host: &str, command: &str) -> Result<(), TransportError> {
        bounded(COMMAND_TIMEOUT, command, self.run_ssh(host, command))
            .await
            .map(|_| ())
    }

    async fn execute_command_with_output(
        &self,
        host: &str,
        command: &str,
    ) -> Result<String, TransportError> {
        bounded(COMMAND_TIMEOUT, command, self.run_ssh(host, command)).await
    }

    async fn upload_file(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let to = format!("{}:{}", self.destination(host), remote_path);
        bounded(
            TRANSFER_TIMEOUT,
            &format!("scp {} {to}", local_path.display()),
            self.run_scp(local_path.display().to_string(), to.clone()),
        )
        .await?;
        info!(host = %host, remote_path = %remote_path, "uploaded file");
        Ok(())
    }

    async fn download_file(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError> {
        let from = format!("{}:{}", self.destination(host), remote_path);
        let result = bounded(
            TRANSFER_TIMEOUT,
            &format!("scp {from} {}", local_path.display()),
            self.run_scp(from.clone(), local_path.display().to_string()),
        )
        .await;

        if result.is_err() {
            // scp may leave an empty file behind
            if let Ok(meta) = tokio::fs::metadata(local_path).await {
                if meta.len() == 0 {
                    let _ = tokio::fs::remove_file(local_path).await;
                }
            }
        }
        result
    }

    async fn reboot(&self, host: &str) -> Result<(), TransportError> {
        match self.execute_command(host, REBOOT_COMMAND).await {
            Ok(()) | Err(TransportError::ConnectionDropped) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args_carry_identity_and_destination() {
        let transport = SshTransport::new("deployer", "./id_deployer_rsa");
        let args = transport.ssh_args("worker-1.example.com", "uptime");

        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "./id_deployer_rsa");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ServerAliveInterval=5".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=3".to_string()));
        assert_eq!(args[args.len() - 2], "deployer@worker-1.example.com");
        assert_eq!(args[args.len() - 1], "uptime");
    }

    #[test]
    fn test_missing_status_is_a_dropped_connection() {
        assert!(matches!(
            classify_failure(REBOOT_COMMAND, None, ""),
            TransportError::ConnectionDropped
        ));
    }

    #[test]
    fn test_closed_connection_is_a_dropped_connection() {
        let err = classify_failure(
            REBOOT_COMMAND,
            Some(255),
            "Connection to worker-1 closed by remote host.\n",
        );
        assert!(matches!(err, TransportError::ConnectionDropped));
    }

    #[test]
    fn test_unreachable_host_is_a_command_failure() {
        let err = classify_failure(
            "uptime",
            Some(255),
            "ssh: connect to host worker-1 port 22: No route to host",
        );
        match err {
            TransportError::CommandFailed { status, output, .. } => {
                assert_eq!(status, Some(255));
                assert!(output.contains("No route to host"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_failure_keeps_status_and_output() {
        let err = classify_failure("sudo mv a b", Some(1), "mv: cannot stat 'a'\n");
        assert!(err.to_string().contains("sudo mv a b"));
        assert!(err.to_string().contains("cannot stat"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_operation_times_out() {
        let err = bounded(
            COMMAND_TIMEOUT,
            "etcdctl endpoint health",
            std::future::pending::<Result<String, TransportError>>(),
        )
        .await
        .unwrap_err();

        match err {
            TransportError::Timeout { command, timeout } => {
                assert_eq!(command, "etcdctl endpoint health");
                assert_eq!(timeout, COMMAND_TIMEOUT);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_operation_is_not_cut_short() {
        let output = bounded(TRANSFER_TIMEOUT, "scp", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, TransportError>("done".to_string())
        })
        .await
        .unwrap();
        assert_eq!(output, "done");
    }
}
