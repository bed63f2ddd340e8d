//! The on-disk image repository: one directory per image under a common
//! root, holding a `disk.img` base disk and an optional `config.json`
//! sidecar.
//!
//! Images are independent entities. The only relationship between them is
//! fork lineage: a forked image's disk is a copy-on-write child of its
//! parent's disk at fork time. Concurrent mutation of the same image name
//! (e.g. `fork` racing `remove`) is undefined; distinct names never
//! interfere.

use crate::error::ImageError;
use crate::qemu_img;
use crate::types::{ImageConfig, ImageInfo};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const DISK_FILE: &str = "disk.img";
pub const CONFIG_FILE: &str = "config.json";

pub struct ImageRepository {
    root: PathBuf,
}

impl ImageRepository {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.image_dir(name).join(DISK_FILE)
    }

    fn check_name(name: &str) -> Result<(), ImageError> {
        let ok = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\0');
        if ok {
            Ok(())
        } else {
            Err(ImageError::InvalidName(name.to_string()))
        }
    }

    fn ensure_exists(&self, name: &str) -> Result<PathBuf, ImageError> {
        Self::check_name(name)?;
        let dir = self.image_dir(name);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(ImageError::NotFound(name.to_string()))
        }
    }

    fn ensure_absent(&self, name: &str) -> Result<PathBuf, ImageError> {
        Self::check_name(name)?;
        let dir = self.image_dir(name);
        if dir.exists() {
            Err(ImageError::AlreadyExists(name.to_string()))
        } else {
            Ok(dir)
        }
    }

    /// Allocate a new image with an empty base disk of the given size.
    pub async fn create(&self, name: &str, size: &str) -> Result<(), ImageError> {
        let dir = self.ensure_absent(name)?;
        fs::create_dir_all(&dir).await?;

        if let Err(e) = qemu_img::create_blank(&self.disk_path(name), size).await {
            let _ = fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        tracing::info!("created image {} ({})", name, size);
        Ok(())
    }

    /// Create a new image whose disk is a copy-on-write child of `base`'s
    /// disk. Sidecar files are hard-linked, not copied, so a fork is cheap.
    pub async fn fork(&self, base: &str, new: &str) -> Result<(), ImageError> {
        let base_dir = self.ensure_exists(base)?;
        let new_dir = self.ensure_absent(new)?;

        let backing = self.disk_path(base);
        if !backing.is_file() {
            return Err(ImageError::NotFound(base.to_string()));
        }

        fs::create_dir_all(&new_dir).await?;

        let result = async {
            qemu_img::create_overlay(&self.disk_path(new), &backing).await?;

            let mut entries = fs::read_dir(&base_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name() == DISK_FILE || !entry.file_type().await?.is_file() {
                    continue;
                }
                fs::hard_link(entry.path(), new_dir.join(entry.file_name())).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&new_dir).await;
            return Err(e);
        }

        tracing::info!("forked image {} from {}", new, base);
        Ok(())
    }

    /// Delete every file under the image directory, then the directory.
    pub async fn remove(&self, name: &str) -> Result<(), ImageError> {
        let dir = self.ensure_exists(name)?;
        fs::remove_dir_all(&dir).await?;
        tracing::info!("removed image {}", name);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ImageInfo>, ImageError> {
        let mut images = Vec::new();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let disk = entry.path().join(DISK_FILE);
            let Ok(meta) = fs::metadata(&disk).await else {
                continue;
            };
            images.push(ImageInfo {
                name,
                disk_size: meta.len(),
            });
        }

        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    /// Load the image's sidecar config, or defaults when there is none.
    pub async fn config(&self, name: &str) -> Result<ImageConfig, ImageError> {
        let dir = self.ensure_exists(name)?;
        let path = dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(ImageConfig::default());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Serialize the image directory as a gzipped tar stream.
    pub fn export(&self, name: &str, writer: impl Write) -> Result<(), ImageError> {
        let dir = self.ensure_exists(name)?;

        let encoder = GzEncoder::new(writer, Compression::default());
        let mut archive = tar::Builder::new(encoder);
        archive.append_dir_all(".", &dir)?;
        archive.into_inner()?.finish()?;

        Ok(())
    }

    /// Materialize an image from a gzipped tar stream produced by `export`.
    pub fn import(&self, name: &str, reader: impl Read) -> Result<(), ImageError> {
        let dir = self.ensure_absent(name)?;
        std::fs::create_dir_all(&dir)?;

        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        archive.set_overwrite(true);
        if let Err(e) = archive.unpack(&dir) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e.into());
        }

        tracing::info!("imported image {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_image(repo: &ImageRepository, name: &str, disk: &[u8], config: Option<&str>) {
        let dir = repo.image_dir(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(DISK_FILE), disk).unwrap();
        if let Some(config) = config {
            std::fs::write(dir.join(CONFIG_FILE), config).unwrap();
        }
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());
        seed_image(
            &repo,
            "base",
            b"not really a qcow2",
            Some(r#"{"login": {"username": "root", "password": "hunter2"}}"#),
        );

        let mut archive = Vec::new();
        repo.export("base", &mut archive).unwrap();
        repo.import("copy", archive.as_slice()).unwrap();

        let original = std::fs::read(repo.disk_path("base")).unwrap();
        let copied = std::fs::read(repo.disk_path("copy")).unwrap();
        assert_eq!(original, copied);

        let config = repo.config("copy").await.unwrap();
        assert_eq!(config.credentials().username, "root");
        assert_eq!(config.credentials().password, "hunter2");
    }

    #[tokio::test]
    async fn import_rejects_existing_name() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());
        seed_image(&repo, "base", b"disk", None);

        let mut archive = Vec::new();
        repo.export("base", &mut archive).unwrap();

        let err = repo.import("base", archive.as_slice()).unwrap_err();
        assert!(matches!(err, ImageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn export_of_missing_image_fails() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());

        let err = repo.export("nope", Vec::new()).unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_deletes_directory() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());
        seed_image(&repo, "gone", b"disk", None);

        repo.remove("gone").await.unwrap();
        assert!(!repo.image_dir("gone").exists());

        let err = repo.remove("gone").await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_reports_disk_sizes() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());
        seed_image(&repo, "small", b"1234", None);
        seed_image(&repo, "big", &[0u8; 4096], None);
        // A stray non-image directory is ignored.
        std::fs::create_dir_all(root.path().join("lost+found")).unwrap();

        let images = repo.list().await.unwrap();
        let names: Vec<_> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["big", "small"]);
        assert_eq!(images[0].disk_size, 4096);
        assert_eq!(images[1].disk_size, 4);
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());
        seed_image(&repo, "plain", b"disk", None);

        let config = repo.config("plain").await.unwrap();
        assert_eq!(config.credentials().username, "ubuntu");
        assert_eq!(config.credentials().password, "ubuntu");
        assert!(config.qemu_args.is_empty());
    }

    #[tokio::test]
    async fn config_passes_extra_args_through() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());
        seed_image(
            &repo,
            "tuned",
            b"disk",
            Some(r#"{"qemu-args": ["-device", "virtio-rng-pci"]}"#),
        );

        let config = repo.config("tuned").await.unwrap();
        assert_eq!(config.qemu_args, ["-device", "virtio-rng-pci"]);
    }

    #[tokio::test]
    async fn fork_requires_existing_base_and_fresh_name() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());
        seed_image(&repo, "base", b"disk", None);

        let err = repo.fork("missing", "child").await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));

        let err = repo.fork("base", "base").await.unwrap_err();
        assert!(matches!(err, ImageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn names_with_separators_are_rejected() {
        let root = TempDir::new().unwrap();
        let repo = ImageRepository::new(root.path());

        for name in ["", ".", "..", "a/b"] {
            let err = repo.remove(name).await.unwrap_err();
            assert!(matches!(err, ImageError::InvalidName(_)), "{:?}", name);
        }
    }
}
