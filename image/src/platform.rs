//! Data-driven platform descriptors.
//!
//! One table row per supported platform: which hypervisor binary to run,
//! how its machine is wired, which upstream cloud image seeds it, and
//! whether it needs a firmware blob. Everything that varies by
//! architecture is looked up here.

use crate::error::ImageError;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct Firmware {
    /// File name inside the image directory.
    pub file: &'static str,
    pub url: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Platform {
    pub name: &'static str,
    pub host_arch: &'static str,
    pub qemu_binary: &'static str,
    /// Machine-model arguments, before any CPU or accelerator selection.
    pub machine_args: &'static [&'static str],
    /// CPU model when hardware virtualization is available.
    pub cpu_accelerated: Option<&'static str>,
    /// CPU model to fall back to under pure emulation.
    pub cpu_emulated: Option<&'static str>,
    /// User-mode network device attached to the `user` netdev.
    pub net_device: &'static str,
    pub firmware: Option<Firmware>,
    pub image_url: &'static str,
}

pub const PLATFORMS: &[Platform] = &[
    Platform {
        name: "cloud-x86_64",
        host_arch: "x86_64",
        qemu_binary: "qemu-system-x86_64",
        machine_args: &[],
        cpu_accelerated: None,
        cpu_emulated: None,
        net_device: "virtio-net-pci,netdev=user",
        firmware: None,
        image_url: "https://cloud-images.ubuntu.com/server/releases/16.04/release/\
                    ubuntu-16.04-server-cloudimg-amd64-disk1.img",
    },
    Platform {
        name: "cloud-arm64",
        host_arch: "aarch64",
        qemu_binary: "qemu-system-aarch64",
        machine_args: &["-machine", "virt"],
        cpu_accelerated: Some("host"),
        cpu_emulated: Some("cortex-a53"),
        net_device: "virtio-net-pci,netdev=user,romfile=",
        firmware: Some(Firmware {
            file: "firmware.fd",
            url: "https://releases.linaro.org/components/kernel/uefi-linaro/15.12/\
                  release/qemu64/QEMU_EFI.fd",
        }),
        image_url: "https://cloud-images.ubuntu.com/server/releases/16.04/release/\
                    ubuntu-16.04-server-cloudimg-arm64-uefi1.img",
    },
];

pub fn by_name(name: &str) -> Option<&'static Platform> {
    PLATFORMS.iter().find(|p| p.name == name)
}

pub fn for_host_arch(arch: &str) -> Option<&'static Platform> {
    PLATFORMS.iter().find(|p| p.host_arch == arch)
}

pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Image name instances boot by default on this host.
pub fn default_image_name() -> String {
    match for_host_arch(host_arch()) {
        Some(p) => p.name.to_string(),
        None => format!("cloud-{}", host_arch()),
    }
}

/// The instance-facing view of a platform row: the resolved binary and the
/// boot arguments that depend only on host capabilities and the image
/// directory (firmware location).
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub binary: String,
    pub base_args: Vec<String>,
    pub net_device: String,
}

impl MachineSpec {
    /// Pure assembly from a platform row; `accelerated` says whether KVM
    /// is usable on this host.
    pub fn from_platform(platform: &Platform, image_dir: &Path, accelerated: bool) -> MachineSpec {
        let mut args: Vec<String> = platform.machine_args.iter().map(|s| s.to_string()).collect();

        let cpu = if accelerated {
            platform.cpu_accelerated
        } else {
            platform.cpu_emulated
        };
        if let Some(cpu) = cpu {
            args.push("-cpu".to_string());
            args.push(cpu.to_string());
        }
        if accelerated {
            args.push("-enable-kvm".to_string());
        }
        if let Some(firmware) = platform.firmware {
            args.push("-bios".to_string());
            args.push(image_dir.join(firmware.file).to_string_lossy().to_string());
        }

        MachineSpec {
            binary: platform.qemu_binary.to_string(),
            base_args: args,
            net_device: platform.net_device.to_string(),
        }
    }

    /// Resolve the spec for the running host.
    pub fn for_host(image_dir: &Path) -> Result<MachineSpec, ImageError> {
        let platform = for_host_arch(host_arch())
            .ok_or_else(|| ImageError::UnsupportedArch(host_arch().to_string()))?;
        let accelerated = Path::new("/dev/kvm").exists();
        Ok(Self::from_platform(platform, image_dir, accelerated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn lookup_by_name_and_arch() {
        assert_eq!(by_name("cloud-x86_64").unwrap().host_arch, "x86_64");
        assert_eq!(for_host_arch("aarch64").unwrap().name, "cloud-arm64");
        assert!(by_name("cloud-riscv64").is_none());
    }

    #[test]
    fn accelerated_x86_spec() {
        let platform = by_name("cloud-x86_64").unwrap();
        let spec = MachineSpec::from_platform(platform, &PathBuf::from("/img"), true);
        assert_eq!(spec.binary, "qemu-system-x86_64");
        assert_eq!(spec.base_args, ["-enable-kvm"]);
    }

    #[test]
    fn emulated_arm_spec_uses_fallback_cpu_and_firmware() {
        let platform = by_name("cloud-arm64").unwrap();
        let spec = MachineSpec::from_platform(platform, &PathBuf::from("/img"), false);
        assert_eq!(spec.binary, "qemu-system-aarch64");
        assert_eq!(
            spec.base_args,
            ["-machine", "virt", "-cpu", "cortex-a53", "-bios", "/img/firmware.fd"]
        );
        assert!(!spec.base_args.contains(&"-enable-kvm".to_string()));
    }
}
