//! Remote sessions over the external `ssh` binary.
//!
//! Two capabilities, selected by configuration: `PasswordSession` feeds the
//! image's password through the SSH_ASKPASS mechanism and exists only for
//! bootstrap; `KeySession` authenticates with the workspace keypair and
//! carries every later operation. Host-key checking is disabled throughout:
//! the target is ephemeral and was created seconds ago.

use crate::error::InstanceError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

const CONNECT_TIMEOUT_SECS: u32 = 5;

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run one shell command in the guest, returning its exit status.
    async fn exec(&self, command: &str) -> Result<ExitStatus, InstanceError>;
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub port: u16,
    pub username: String,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@127.0.0.1", self.username)
    }
}

fn common_args(target: &SshTarget) -> Vec<String> {
    vec![
        "-p".to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
    ]
}

/// Password-authenticated session used only during bootstrap, while the
/// guest has nothing but its stock credentials.
pub struct PasswordSession {
    target: SshTarget,
    askpass: PathBuf,
}

impl PasswordSession {
    pub fn new(target: SshTarget, askpass: PathBuf) -> Self {
        Self { target, askpass }
    }

    fn args(&self) -> Vec<String> {
        let mut args = common_args(&self.target);
        args.extend([
            "-o".to_string(),
            "PreferredAuthentications=password".to_string(),
            "-o".to_string(),
            "NumberOfPasswordPrompts=1".to_string(),
        ]);
        args
    }
}

#[async_trait]
impl RemoteSession for PasswordSession {
    async fn exec(&self, command: &str) -> Result<ExitStatus, InstanceError> {
        let output = Command::new("ssh")
            .args(self.args())
            .arg(self.target.destination())
            .arg(command)
            // With no tty and SSH_ASKPASS_REQUIRE=force, ssh reads the
            // password from the helper instead of prompting.
            .env("SSH_ASKPASS", &self.askpass)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env("DISPLAY", ":0")
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            tracing::debug!(
                "password session attempt failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status)
    }
}

/// Key-authenticated session for everything after bootstrap.
pub struct KeySession {
    target: SshTarget,
    identity: PathBuf,
}

impl KeySession {
    pub fn new(target: SshTarget, identity: PathBuf) -> Self {
        Self { target, identity }
    }

    fn args(&self) -> Vec<String> {
        let mut args = common_args(&self.target);
        args.extend([
            "-i".to_string(),
            self.identity.display().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]);
        args
    }

    /// Open an interactive shell on the caller's terminal.
    pub async fn interactive(&self) -> Result<ExitStatus, InstanceError> {
        let status = Command::new("ssh")
            .args(self.args())
            .arg("-t")
            .arg(self.target.destination())
            .status()
            .await?;
        Ok(status)
    }
}

#[async_trait]
impl RemoteSession for KeySession {
    async fn exec(&self, command: &str) -> Result<ExitStatus, InstanceError> {
        // Output flows straight through to the caller.
        let status = Command::new("ssh")
            .args(self.args())
            .arg(self.target.destination())
            .arg(command)
            .status()
            .await?;
        Ok(status)
    }
}

/// Quote one argument for the guest's shell, the same way the original
/// `sudo` wrapper did: single quotes around everything, embedded quotes
/// escaped.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'=' | b'@'))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}
