//! Thin wrappers over the external `qemu-img` binary.
//!
//! All disk allocation goes through here: blank base disks, copy-on-write
//! overlays, and committing an overlay back into its backing file.

use crate::error::ImageError;
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;

pub const DISK_FORMAT: &str = "qcow2";

async fn run(args: Vec<OsString>) -> Result<(), ImageError> {
    tracing::debug!("qemu-img {:?}", args);

    let output = Command::new("qemu-img").args(&args).output().await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ImageError::DiskCommand {
            command: format!("qemu-img {:?}", args),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn blank_args(path: &Path, format: &str, size: &str) -> Vec<OsString> {
    vec![
        "create".into(),
        "-f".into(),
        format.into(),
        path.into(),
        size.into(),
    ]
}

fn overlay_args(path: &Path, backing: &Path) -> Vec<OsString> {
    vec![
        "create".into(),
        "-f".into(),
        DISK_FORMAT.into(),
        "-b".into(),
        backing.into(),
        "-F".into(),
        DISK_FORMAT.into(),
        path.into(),
    ]
}

/// Allocate a new empty qcow2 disk of the given size (e.g. "10G").
pub async fn create_blank(path: &Path, size: &str) -> Result<(), ImageError> {
    run(blank_args(path, DISK_FORMAT, size)).await
}

/// Allocate a raw disk, used for per-instance swap.
pub async fn create_raw(path: &Path, size: &str) -> Result<(), ImageError> {
    run(blank_args(path, "raw", size)).await
}

/// Create a copy-on-write overlay whose backing file is `backing`. The
/// backing path is recorded as given, so callers pass it absolute.
pub async fn create_overlay(path: &Path, backing: &Path) -> Result<(), ImageError> {
    run(overlay_args(path, backing)).await
}

/// Merge an overlay's changes back into its backing file.
pub async fn commit_overlay(path: &Path) -> Result<(), ImageError> {
    run(vec!["commit".into(), path.into()]).await
}

pub async fn convert(src: &Path, dst: &Path) -> Result<(), ImageError> {
    run(vec![
        "convert".into(),
        "-O".into(),
        DISK_FORMAT.into(),
        src.into(),
        dst.into(),
    ])
    .await
}

pub async fn resize(path: &Path, size: &str) -> Result<(), ImageError> {
    run(vec!["resize".into(), path.into(), size.into()]).await
}

/// Check a size spec the way qemu-img will accept it: digits with an
/// optional binary-unit suffix.
pub fn valid_size_spec(spec: &str) -> bool {
    let spec = spec.strip_suffix(['k', 'K', 'M', 'G', 'T']).unwrap_or(spec);
    !spec.is_empty() && spec.bytes().all(|b| b.is_ascii_digit())
}
