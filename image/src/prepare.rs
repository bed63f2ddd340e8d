//! Build a base cloud image for this host: download the upstream Ubuntu
//! cloud image, convert it into a fresh repository entry, and boot it once
//! with a cloud-init seed disk so it settles into a known state (password
//! login enabled, cloud-init and the apt timers disabled) before powering
//! itself off.

use crate::error::ImageError;
use crate::platform::{self, MachineSpec, Platform};
use crate::qemu_img;
use crate::repository::ImageRepository;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const BASE_DISK_SIZE: &str = "10G";

const CLOUD_INIT_USER_DATA: &str = "\
#cloud-config
password: ubuntu
chpasswd: { expire: False }
ssh_pwauth: True
runcmd:
  - \"touch /etc/cloud/cloud-init.disabled\"
  - \"systemctl disable apt-daily.service\"
  - \"systemctl disable apt-daily.timer\"
  - \"poweroff\"
";

/// Prepare the named platform (or the host default) as a repository image.
/// Returns the image name.
pub async fn prepare(
    repo: &ImageRepository,
    platform_name: Option<&str>,
    cache_dir: &Path,
) -> Result<String, ImageError> {
    let platform = match platform_name {
        Some(name) => platform::by_name(name)
            .ok_or_else(|| ImageError::UnsupportedArch(name.to_string()))?,
        None => platform::for_host_arch(platform::host_arch())
            .ok_or_else(|| ImageError::UnsupportedArch(platform::host_arch().to_string()))?,
    };

    let dir = match repo.image_dir(platform.name) {
        dir if dir.exists() => return Err(ImageError::AlreadyExists(platform.name.to_string())),
        dir => dir,
    };

    fs::create_dir_all(cache_dir).await?;
    let upstream = download_cached(cache_dir, platform.image_url).await?;
    let firmware = match platform.firmware {
        Some(fw) => Some((fw.file, download_cached(cache_dir, fw.url).await?)),
        None => None,
    };

    fs::create_dir_all(&dir).await?;
    if let Err(e) = build_image(repo, platform, &dir, &upstream, firmware).await {
        let _ = fs::remove_dir_all(&dir).await;
        return Err(e);
    }

    tracing::info!("prepared image {}", platform.name);
    Ok(platform.name.to_string())
}

async fn build_image(
    repo: &ImageRepository,
    platform: &Platform,
    dir: &Path,
    upstream: &Path,
    firmware: Option<(&str, PathBuf)>,
) -> Result<(), ImageError> {
    if let Some((file, cached)) = firmware {
        fs::copy(&cached, dir.join(file)).await?;
    }

    let disk = repo.disk_path(platform.name);
    qemu_img::convert(upstream, &disk).await?;
    qemu_img::resize(&disk, BASE_DISK_SIZE).await?;

    let user_data = dir.join("user-data.yml");
    let seed = dir.join("seed.img");
    fs::write(&user_data, CLOUD_INIT_USER_DATA).await?;
    cloud_localds(&seed, &user_data).await?;

    seed_boot(platform, dir, &disk, &seed).await?;

    fs::remove_file(&seed).await?;
    fs::remove_file(&user_data).await?;
    Ok(())
}

/// Fetch a URL into the cache directory, skipping the download when a
/// previous run already has it.
async fn download_cached(cache_dir: &Path, url: &str) -> Result<PathBuf, ImageError> {
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ImageError::Download(format!("no file name in {}", url)))?;
    let target = cache_dir.join(file_name);

    if target.is_file() {
        tracing::debug!("using cached {}", target.display());
        return Ok(target);
    }

    tracing::info!("downloading {}", url);
    let mut response = reqwest::get(url).await?.error_for_status()?;

    // Download to a partial file so an interrupted fetch is never mistaken
    // for a complete one.
    let partial = cache_dir.join(format!("{}.partial", file_name));
    let mut file = fs::File::create(&partial).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    fs::rename(&partial, &target).await?;
    Ok(target)
}

async fn cloud_localds(seed: &Path, user_data: &Path) -> Result<(), ImageError> {
    let output = Command::new("cloud-localds")
        .arg(seed)
        .arg(user_data)
        .output()
        .await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ImageError::DiskCommand {
            command: "cloud-localds".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Boot the freshly converted disk once, in the foreground with the serial
/// console on the terminal, until cloud-init powers the guest off.
async fn seed_boot(
    platform: &Platform,
    dir: &Path,
    disk: &Path,
    seed: &Path,
) -> Result<(), ImageError> {
    let accelerated = Path::new("/dev/kvm").exists();
    let machine = MachineSpec::from_platform(platform, dir, accelerated);

    let mut cmd = Command::new(&machine.binary);
    cmd.args(&machine.base_args)
        .args(["-nographic", "-m", "512"])
        .args(["-netdev", "user,id=user"])
        .args(["-device", machine.net_device.as_str()])
        .arg("-drive")
        .arg(format!("if=virtio,format=qcow2,file={}", disk.display()))
        .arg("-drive")
        .arg(format!("if=virtio,format=raw,file={}", seed.display()))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    tracing::info!("seeding {} (guest will power off when done)", platform.name);
    let status = cmd.status().await?;

    if status.success() {
        Ok(())
    } else {
        Err(ImageError::DiskCommand {
            command: machine.binary,
            stderr: format!("seed boot exited with {}", status),
        })
    }
}
