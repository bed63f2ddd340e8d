//! One-time credential injection and share mounting against a freshly
//! booted guest.
//!
//! Boot time varies wildly and the guest's sshd comes up late, so the only
//! workable strategy is to knock until someone answers: attempt the full
//! install script over a password session, back off on failure, and give
//! up only when the deadline passes. Transient connection failures are the
//! one error class this tool silently retries.

use crate::cmdline::mount_tag;
use crate::error::InstanceError;
use crate::session::RemoteSession;
use crate::types::Share;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Guest device of the swap disk: the second virtio disk after the root
/// overlay.
const SWAP_DEVICE: &str = "/dev/vdb";

/// The fixed command sequence run inside the guest: install the public key
/// for every later session, mount each shared folder, enable swap.
pub fn install_script(public_key: &str, shares: &[Share], swap: bool) -> String {
    let mut steps = vec![
        "mkdir -p ~/.ssh".to_string(),
        "chmod 700 ~/.ssh".to_string(),
        format!("printf '%s\\n' '{}' >> ~/.ssh/authorized_keys", public_key),
        "chmod 600 ~/.ssh/authorized_keys".to_string(),
    ];

    for (i, share) in shares.iter().enumerate() {
        steps.push(format!("sudo mkdir -p {}", share.mountpoint));
        steps.push(format!(
            "sudo mount -t 9p -o trans=virtio,version=9p2000.L,msize=104857600 {} {}",
            mount_tag(i),
            share.mountpoint
        ));
    }

    if swap {
        steps.push(format!("sudo mkswap {}", SWAP_DEVICE));
        steps.push(format!("sudo swapon {}", SWAP_DEVICE));
    }

    steps.join(" && ")
}

/// Run the install script until it succeeds or `timeout` elapses.
pub async fn run(
    session: &dyn RemoteSession,
    script: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), InstanceError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        // A spawn failure (ssh itself missing) is not transient and
        // propagates immediately; a non-zero exit is the guest not being
        // ready yet.
        let status = session.exec(script).await?;
        if status.success() {
            tracing::info!("bootstrap complete after {} attempt(s)", attempts);
            return Ok(());
        }
        tracing::debug!("bootstrap attempt {} failed: {}", attempts, status);

        if Instant::now() + RETRY_DELAY >= deadline {
            return Err(InstanceError::BootstrapTimeout {
                elapsed: started.elapsed(),
            });
        }

        tokio::select! {
            _ = sleep(RETRY_DELAY) => {}
            _ = cancel.cancelled() => return Err(InstanceError::Cancelled),
        }
    }
}
