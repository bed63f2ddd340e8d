//! The instance lifecycle orchestrator.
//!
//! Order matters and is load-bearing: the workspace must exist before the
//! hypervisor spawns, the control sockets must exist before anything talks
//! to them, bootstrap must finish before the caller's command runs, and
//! the hypervisor must be confirmed stopped before the workspace is
//! removed. `launch` owns the front half and tears down on its own
//! failures; `shutdown` owns the back half and runs on every exit path.

use crate::bootstrap;
use crate::cmdline;
use crate::console;
use crate::error::InstanceError;
use crate::keys;
use crate::paths::Paths;
use crate::session::{KeySession, PasswordSession, RemoteSession, SshTarget, shell_join};
use crate::supervisor::Supervisor;
use crate::types::InstanceOptions;
use crate::workspace::Workspace;
use kiln_image::{ImageRepository, Login, MachineSpec, valid_size_spec};
use std::net::TcpListener;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Instance {
    options: InstanceOptions,
    login: Login,
    workspace: Workspace,
    supervisor: Supervisor,
    ssh_port: Option<u16>,
}

impl Instance {
    /// Boot an instance of `options.image` and, when remote access is on,
    /// bootstrap it to the point where key-authenticated sessions work.
    ///
    /// On any failure after the hypervisor spawned, teardown has already
    /// run when this returns.
    pub async fn launch(
        paths: &Paths,
        options: InstanceOptions,
        cancel: &CancellationToken,
    ) -> Result<Instance, InstanceError> {
        let options = validate(options)?;

        let repo = ImageRepository::new(&paths.images);
        let image_config = repo.config(&options.image).await?;
        let login = image_config.credentials();
        let machine = MachineSpec::for_host(&repo.image_dir(&options.image))?;

        let mut workspace = Workspace::create(&paths.var).await?;
        workspace
            .provision_overlay(&repo.disk_path(&options.image))
            .await?;
        if let Some(size) = &options.swap {
            workspace.provision_swap(size).await?;
        }

        let ssh_port = if options.remote_access {
            Some(pick_ssh_port(&options)?)
        } else {
            None
        };

        let args = cmdline::build_qemu_args(&options, &image_config, &machine, ssh_port)?;

        tracing::info!(
            image = %options.image,
            memory_mib = options.memory_mib,
            smp = options.smp,
            "launching instance"
        );

        let mut supervisor = Supervisor::spawn(
            &machine.binary,
            &args,
            workspace.path(),
            workspace.qmp_socket(),
            workspace.serial_socket(),
        )?;

        if let Err(e) = supervisor.wait_ready(READY_TIMEOUT, cancel).await {
            supervisor.shutdown().await;
            return Err(e);
        }

        let mut instance = Instance {
            options,
            login,
            workspace,
            supervisor,
            ssh_port,
        };

        if let Some(port) = instance.ssh_port {
            let askpass = match instance.workspace.write_askpass(&instance.login.password).await {
                Ok(path) => path,
                Err(e) => {
                    instance.supervisor.shutdown().await;
                    return Err(e);
                }
            };

            let session = PasswordSession::new(
                SshTarget {
                    port,
                    username: instance.login.username.clone(),
                },
                askpass,
            );
            let script = bootstrap::install_script(
                keys::PUBLIC_KEY,
                &instance.options.shares,
                instance.workspace.has_swap(),
            );

            if let Err(e) =
                bootstrap::run(&session, &script, bootstrap::DEFAULT_TIMEOUT, cancel).await
            {
                instance.supervisor.shutdown().await;
                return Err(e);
            }
        }

        Ok(instance)
    }

    fn key_session(&self) -> Result<KeySession, InstanceError> {
        let port = self.ssh_port.ok_or_else(|| {
            InstanceError::Config("remote access is disabled for this instance".to_string())
        })?;
        Ok(KeySession::new(
            SshTarget {
                port,
                username: self.login.username.clone(),
            },
            self.workspace.private_key(),
        ))
    }

    /// Run one command in the guest under sudo, output passed through.
    /// A non-zero remote status is `RemoteExit` so callers can propagate
    /// it as their own exit code.
    pub async fn exec(&self, argv: &[String]) -> Result<(), InstanceError> {
        let command = format!("sudo {}", shell_join(argv));
        let status = self.key_session()?.exec(&command).await?;

        if status.success() {
            Ok(())
        } else {
            Err(InstanceError::RemoteExit(status.code().unwrap_or(1)))
        }
    }

    /// Open an interactive shell in the guest.
    pub async fn login(&self) -> Result<(), InstanceError> {
        let status = self.key_session()?.interactive().await?;
        if status.success() {
            Ok(())
        } else {
            Err(InstanceError::RemoteExit(status.code().unwrap_or(1)))
        }
    }

    /// Attach the caller's terminal to the serial console. Works without
    /// remote access.
    pub async fn console(&self, cancel: &CancellationToken) -> Result<(), InstanceError> {
        let socket = self.workspace.serial_socket();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || console::attach(&socket, &cancel))
            .await
            .map_err(|e| InstanceError::Io(std::io::Error::other(e)))?
    }

    /// Tear the instance down: stop the hypervisor, optionally commit the
    /// overlay back into the base image, then remove the workspace.
    pub async fn shutdown(mut self) -> Result<(), InstanceError> {
        self.supervisor.shutdown().await;

        if self.options.persist {
            if let Err(e) = self.workspace.commit().await {
                // Keep the overlay around rather than silently dropping
                // the changes the caller asked to keep.
                let kept = self.workspace.keep();
                return Err(InstanceError::Resource(format!(
                    "commit failed ({}), workspace kept at {}",
                    e,
                    kept.display()
                )));
            }
            tracing::info!("committed changes back to {}", self.options.image);
        }

        Ok(())
    }
}

fn validate(options: InstanceOptions) -> Result<InstanceOptions, InstanceError> {
    let mut options = options;

    if options.memory_mib == 0 {
        return Err(InstanceError::Config("memory must be non-zero".to_string()));
    }
    if options.smp == 0 {
        return Err(InstanceError::Config("smp must be non-zero".to_string()));
    }
    if let Some(size) = &options.swap
        && !valid_size_spec(size)
    {
        return Err(InstanceError::Config(format!("bad swap size {:?}", size)));
    }

    for share in &mut options.shares {
        if !share.host_path.is_dir() {
            return Err(InstanceError::Resource(format!(
                "share path is not a directory: {}",
                share.host_path.display()
            )));
        }
        share.host_path = std::path::absolute(&share.host_path)?;
    }
    for media in options.cdroms.iter_mut().chain(options.usb_storage.iter_mut()) {
        if !media.is_file() {
            return Err(InstanceError::Resource(format!(
                "media file missing: {}",
                media.display()
            )));
        }
        *media = std::path::absolute(&*media)?;
    }

    Ok(options)
}

/// Pick the host port forwarded to the guest's SSH port: let the kernel
/// hand out a free ephemeral port, re-drawing if it happens to collide
/// with a forward the caller declared.
fn pick_ssh_port(options: &InstanceOptions) -> Result<u16, InstanceError> {
    let declared: Vec<u16> = options
        .tcp_forwards
        .iter()
        .chain(&options.udp_forwards)
        .map(|f| f.host_port)
        .collect();

    for _ in 0..16 {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| InstanceError::Resource(format!("cannot allocate ssh port: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| InstanceError::Resource(format!("cannot allocate ssh port: {}", e)))?
            .port();
        drop(listener);

        if !declared.contains(&port) {
            return Ok(port);
        }
    }

    Err(InstanceError::Resource(
        "cannot allocate an ssh port distinct from the declared forwards".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ssh_port_avoids_declared_forwards() {
        let mut options = InstanceOptions::new("img");
        options.tcp_forwards = vec!["42657:8000".parse().unwrap()];
        options.udp_forwards = vec!["5353:53".parse().unwrap()];

        for _ in 0..32 {
            let port = pick_ssh_port(&options).unwrap();
            assert!(port != 42657 && port != 5353);
            assert!(port >= 1024);
        }
    }

    #[test]
    fn validate_rejects_bad_swap_spec() {
        let mut options = InstanceOptions::new("img");
        options.swap = Some("lots".to_string());

        let err = validate(options).unwrap_err();
        assert!(matches!(err, InstanceError::Config(_)));
    }

    #[test]
    fn validate_rejects_zero_resources() {
        let mut options = InstanceOptions::new("img");
        options.memory_mib = 0;
        assert!(matches!(
            validate(options).unwrap_err(),
            InstanceError::Config(_)
        ));

        let mut options = InstanceOptions::new("img");
        options.smp = 0;
        assert!(matches!(
            validate(options).unwrap_err(),
            InstanceError::Config(_)
        ));
    }

    #[test]
    fn validate_requires_share_directories() {
        let mut options = InstanceOptions::new("img");
        options.shares = vec!["/nonexistent/host:/mnt/shared".parse().unwrap()];

        let err = validate(options).unwrap_err();
        assert!(matches!(err, InstanceError::Resource(_)));
    }

    #[test]
    fn validate_absolutizes_share_paths() {
        let mut options = InstanceOptions::new("img");
        options.shares = vec![crate::types::Share {
            host_path: std::path::PathBuf::from("."),
            mountpoint: "/mnt/shared".to_string(),
        }];

        let validated = validate(options).unwrap();
        assert!(validated.shares[0].host_path.is_absolute());
    }

    #[tokio::test]
    async fn launch_with_unknown_image_is_clean() {
        let data = TempDir::new().unwrap();
        let paths = Paths::new(data.path());
        let cancel = CancellationToken::new();

        let err = Instance::launch(&paths, InstanceOptions::new("missing"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstanceError::Image(kiln_image::ImageError::NotFound(_))
        ));

        // Nothing was allocated: the var root is empty or absent.
        let leftovers = std::fs::read_dir(paths.var)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}
