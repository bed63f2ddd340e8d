//! Spawns and supervises the hypervisor process.
//!
//! The child runs with the workspace as its working directory so the
//! relative socket paths in the argument list resolve there. Readiness is
//! the existence of both control sockets; shutdown is a graceful QMP quit
//! with a forced kill as fallback.

use crate::error::InstanceError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Supervisor {
    child: Child,
    qmp_socket: PathBuf,
    serial_socket: PathBuf,
    stopped: bool,
}

impl Supervisor {
    pub fn spawn(
        binary: &str,
        args: &[String],
        workdir: &Path,
        qmp_socket: PathBuf,
        serial_socket: PathBuf,
    ) -> Result<Supervisor, InstanceError> {
        tracing::debug!("{} {}", binary, args.join(" "));

        let child = Command::new(binary)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Last-resort backstop: a panic or abort must not leak a VM.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InstanceError::Startup(format!("cannot spawn {}: {}", binary, e)))?;

        tracing::info!(pid = child.id(), "hypervisor started");

        Ok(Supervisor {
            child,
            qmp_socket,
            serial_socket,
            stopped: false,
        })
    }

    /// Wait until both control sockets exist. The process being alive is
    /// not enough: it may not have bound its control interface yet.
    pub async fn wait_ready(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), InstanceError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.qmp_socket.exists() && self.serial_socket.exists() {
                return Ok(());
            }

            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(InstanceError::Startup(format!(
                    "hypervisor exited during startup: {}",
                    status
                )));
            }

            if Instant::now() >= deadline {
                return Err(InstanceError::Startup(format!(
                    "control sockets not created within {}s",
                    timeout.as_secs()
                )));
            }

            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(InstanceError::Cancelled),
            }
        }
    }

    /// Stop the hypervisor: ask nicely over QMP, wait a bounded time for
    /// exit, then kill. Never fails; safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        // An unreachable socket means the process is already gone (or never
        // bound its control interface); skip the grace period in that case.
        let grace = match self.quit_via_qmp().await {
            Ok(()) => {
                tracing::debug!("sent quit over control socket");
                GRACEFUL_EXIT_WAIT
            }
            Err(e) => {
                tracing::debug!("graceful shutdown unavailable: {}", e);
                POLL_INTERVAL
            }
        };

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("hypervisor exited: {}", status);
            }
            Ok(Err(e)) => {
                tracing::warn!("error waiting for hypervisor exit: {}", e);
            }
            Err(_) => {
                tracing::warn!("hypervisor did not exit in time, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!("kill failed: {}", e);
                }
            }
        }
    }

    async fn quit_via_qmp(&self) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(&self.qmp_socket).await?;
        stream
            .write_all(b"{\"execute\": \"qmp_capabilities\"}\n")
            .await?;
        stream.write_all(b"{\"execute\": \"quit\"}\n").await?;
        stream.shutdown().await?;
        Ok(())
    }
}
