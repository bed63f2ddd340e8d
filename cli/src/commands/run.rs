use clap::Args;
use kiln_instance::{DisplayMode, Instance, InstanceError, InstanceOptions, Paths};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Options shared by every instance-launching subcommand.
#[derive(Args)]
pub struct InstanceArgs {
    /// Image to boot (default: the host platform's cloud image)
    #[arg(long)]
    image: Option<String>,

    /// Shared directory as HOST_PATH:GUEST_MOUNTPOINT (repeatable)
    #[arg(long = "share")]
    shares: Vec<String>,

    /// Guest memory in MiB
    #[arg(short = 'm', long, default_value_t = 512)]
    memory: u32,

    /// Number of guest CPUs
    #[arg(short = 's', long, default_value_t = 1)]
    smp: u32,

    /// TCP port forward as HOST:GUEST or BIND:HOST:GUEST (repeatable)
    #[arg(long = "tcp")]
    tcp: Vec<String>,

    /// UDP port forward as HOST:GUEST or BIND:HOST:GUEST (repeatable)
    #[arg(long = "udp")]
    udp: Vec<String>,

    /// Expose a VNC display on loopback instead of running headless
    #[arg(long)]
    vnc: bool,

    /// Attach an ISO image as a CD-ROM drive (repeatable)
    #[arg(long = "cdrom")]
    cdroms: Vec<PathBuf>,

    /// Attach a disk image as USB mass storage (repeatable)
    #[arg(long = "usb-storage")]
    usb_storage: Vec<PathBuf>,

    /// Attach a swap disk of the given size (e.g. 300M)
    #[arg(long)]
    swap: Option<String>,

    /// Merge disk changes back into the base image on shutdown
    #[arg(long)]
    persist: bool,
}

impl InstanceArgs {
    fn into_options(self, remote_access: bool) -> Result<InstanceOptions, InstanceError> {
        let image = self.image.unwrap_or_else(kiln_image::default_image_name);

        let mut options = InstanceOptions::new(image);
        options.memory_mib = self.memory;
        options.smp = self.smp;
        options.tcp_forwards = self.tcp.iter().map(|s| s.parse()).collect::<Result<_, _>>()?;
        options.udp_forwards = self.udp.iter().map(|s| s.parse()).collect::<Result<_, _>>()?;
        options.shares = self
            .shares
            .iter()
            .map(|s| s.parse())
            .collect::<Result<_, _>>()?;
        options.cdroms = self.cdroms;
        options.usb_storage = self.usb_storage;
        options.display = if self.vnc {
            DisplayMode::Vnc
        } else {
            DisplayMode::Headless
        };
        options.swap = self.swap;
        options.persist = self.persist;
        options.remote_access = remote_access;
        Ok(options)
    }
}

/// Cancel the token on SIGINT/SIGTERM so every wait loop unwinds through
/// the normal teardown path instead of the process dying mid-run.
fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("cannot install SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        tracing::info!("interrupted, shutting down");
        token.cancel();
    });

    cancel
}

/// Tear down, then turn the action's result into this process's outcome.
/// A remote exit status becomes our own exit code, but only after
/// teardown has finished.
fn finish(
    result: Result<(), InstanceError>,
    teardown: Result<(), InstanceError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Err(InstanceError::RemoteExit(code)) => {
            if let Err(e) = teardown {
                eprintln!("warning: {}", e);
            }
            std::process::exit(code);
        }
        Err(e) => Err(e.into()),
        Ok(()) => {
            teardown?;
            Ok(())
        }
    }
}

pub async fn run_command(
    paths: &Paths,
    args: InstanceArgs,
    command: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = args.into_options(true)?;
    let cancel = cancel_on_signal();

    let instance = Instance::launch(paths, options, &cancel).await?;
    let result = instance.exec(&command).await;
    let teardown = instance.shutdown().await;
    finish(result, teardown)
}

pub async fn login_command(
    paths: &Paths,
    args: InstanceArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = args.into_options(true)?;
    let cancel = cancel_on_signal();

    let instance = Instance::launch(paths, options, &cancel).await?;
    let result = instance.login().await;
    let teardown = instance.shutdown().await;
    finish(result, teardown)
}

pub async fn console_command(
    paths: &Paths,
    args: InstanceArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    // No bootstrap: the console works against images with no usable
    // network stack at all.
    let options = args.into_options(false)?;
    let cancel = cancel_on_signal();

    let instance = Instance::launch(paths, options, &cancel).await?;
    let result = instance.console(&cancel).await;
    let teardown = instance.shutdown().await;
    finish(result, teardown)
}
