//! Hypervisor argument assembly.
//!
//! `build_qemu_args` is a pure function of its inputs: the same options
//! always produce the same argument list. Socket and disk paths are
//! emitted relative to the workspace, which the supervisor uses as the
//! child's working directory.

use crate::error::InstanceError;
use crate::types::{DisplayMode, InstanceOptions, PortForward};
use crate::workspace::{OVERLAY_DISK, QMP_SOCKET, SERIAL_SOCKET, SWAP_DISK};
use kiln_image::{ImageConfig, MachineSpec};
use std::fmt::Write;
use std::path::Path;

pub const GUEST_SSH_PORT: u16 = 22;

/// Build the full hypervisor argument list. `ssh_port` carries the host
/// side of the remote-access forward when remote access is enabled; it is
/// the one input the caller draws at random.
pub fn build_qemu_args(
    options: &InstanceOptions,
    image_config: &ImageConfig,
    machine: &MachineSpec,
    ssh_port: Option<u16>,
) -> Result<Vec<String>, InstanceError> {
    let mut args: Vec<String> = machine.base_args.clone();

    args.push("-m".to_string());
    args.push(options.memory_mib.to_string());
    args.push("-smp".to_string());
    args.push(options.smp.to_string());

    match options.display {
        DisplayMode::Headless => {
            args.push("-display".to_string());
            args.push("none".to_string());
        }
        DisplayMode::Vnc => {
            args.push("-vnc".to_string());
            args.push("127.0.0.1:0".to_string());
        }
    }

    args.push("-qmp".to_string());
    args.push(format!("unix:{},server=on,wait=off", QMP_SOCKET));
    args.push("-serial".to_string());
    args.push(format!("unix:{},server=on,wait=off", SERIAL_SOCKET));

    args.push("-drive".to_string());
    args.push(format!("if=virtio,format=qcow2,file={}", OVERLAY_DISK));
    if options.swap.is_some() {
        args.push("-drive".to_string());
        args.push(format!("if=virtio,format=raw,file={}", SWAP_DISK));
    }

    args.push("-netdev".to_string());
    args.push(netdev_arg(options, ssh_port));
    args.push("-device".to_string());
    args.push(machine.net_device.clone());

    for (i, share) in options.shares.iter().enumerate() {
        let path = absolute(&share.host_path)?;
        args.push("-fsdev".to_string());
        args.push(format!(
            "local,id=fsdev{},path={},security_model=none",
            i,
            path.display()
        ));
        args.push("-device".to_string());
        args.push(format!("virtio-9p-pci,fsdev=fsdev{},mount_tag={}", i, mount_tag(i)));
    }

    for cdrom in &options.cdroms {
        let path = absolute(cdrom)?;
        args.push("-drive".to_string());
        args.push(format!("media=cdrom,file={}", path.display()));
    }

    if !options.usb_storage.is_empty() {
        args.push("-device".to_string());
        args.push("qemu-xhci".to_string());
    }
    for (i, disk) in options.usb_storage.iter().enumerate() {
        let path = absolute(disk)?;
        args.push("-drive".to_string());
        args.push(format!("if=none,id=usb{},format=raw,file={}", i, path.display()));
        args.push("-device".to_string());
        args.push(format!("usb-storage,drive=usb{}", i));
    }

    // Image-specific arguments go last so they can override anything above.
    args.extend(image_config.qemu_args.iter().cloned());

    Ok(args)
}

/// The 9p mount tag for share `i`, shared between the device wiring here
/// and the guest-side mount commands in bootstrap.
pub fn mount_tag(i: usize) -> String {
    format!("share{}", i)
}

fn netdev_arg(options: &InstanceOptions, ssh_port: Option<u16>) -> String {
    let mut arg = String::from("user,id=user");

    if let Some(port) = ssh_port {
        write!(arg, ",hostfwd=tcp:127.0.0.1:{}-:{}", port, GUEST_SSH_PORT).unwrap();
    }
    for fwd in &options.tcp_forwards {
        write!(arg, ",{}", hostfwd("tcp", fwd)).unwrap();
    }
    for fwd in &options.udp_forwards {
        write!(arg, ",{}", hostfwd("udp", fwd)).unwrap();
    }

    arg
}

fn hostfwd(proto: &str, fwd: &PortForward) -> String {
    format!(
        "hostfwd={}:{}:{}-:{}",
        proto, fwd.bind_addr, fwd.host_port, fwd.guest_port
    )
}

fn absolute(path: &Path) -> Result<std::path::PathBuf, InstanceError> {
    std::path::absolute(path)
        .map_err(|e| InstanceError::Config(format!("bad path {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Share;
    use std::path::PathBuf;

    fn machine() -> MachineSpec {
        MachineSpec {
            binary: "qemu-system-x86_64".to_string(),
            base_args: vec!["-enable-kvm".to_string()],
            net_device: "virtio-net-pci,netdev=user".to_string(),
        }
    }

    fn options() -> InstanceOptions {
        InstanceOptions::new("cloud-x86_64")
    }

    #[test]
    fn same_options_same_args() {
        let mut opts = options();
        opts.tcp_forwards = vec!["42657:8000".parse().unwrap()];
        opts.shares = vec!["/tmp/work:/mnt/shared".parse().unwrap()];
        opts.swap = Some("300M".to_string());

        let config = ImageConfig::default();
        let a = build_qemu_args(&opts, &config, &machine(), Some(40000)).unwrap();
        let b = build_qemu_args(&opts, &config, &machine(), Some(40000)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exactly_one_qmp_and_one_serial_socket() {
        let args = build_qemu_args(&options(), &ImageConfig::default(), &machine(), None).unwrap();

        assert_eq!(args.iter().filter(|a| *a == "-qmp").count(), 1);
        assert_eq!(args.iter().filter(|a| *a == "-serial").count(), 1);
        assert!(args.contains(&"unix:qmp.sock,server=on,wait=off".to_string()));
        assert!(args.contains(&"unix:serial.sock,server=on,wait=off".to_string()));
    }

    #[test]
    fn memory_and_smp_are_wired() {
        let mut opts = options();
        opts.memory_mib = 800;
        opts.smp = 3;

        let args = build_qemu_args(&opts, &ImageConfig::default(), &machine(), None).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-m 800"));
        assert!(joined.contains("-smp 3"));
    }

    #[test]
    fn forwards_share_a_single_netdev() {
        let mut opts = options();
        opts.tcp_forwards = vec![
            "42657:8000".parse().unwrap(),
            "0.0.0.0:8443:443".parse().unwrap(),
        ];
        opts.udp_forwards = vec!["5353:53".parse().unwrap()];

        let args =
            build_qemu_args(&opts, &ImageConfig::default(), &machine(), Some(40022)).unwrap();

        assert_eq!(args.iter().filter(|a| *a == "-netdev").count(), 1);
        let netdev = &args[args.iter().position(|a| a == "-netdev").unwrap() + 1];
        assert_eq!(
            netdev,
            "user,id=user\
             ,hostfwd=tcp:127.0.0.1:40022-:22\
             ,hostfwd=tcp:127.0.0.1:42657-:8000\
             ,hostfwd=tcp:0.0.0.0:8443-:443\
             ,hostfwd=udp:127.0.0.1:5353-:53"
        );
    }

    #[test]
    fn no_ssh_forward_without_remote_access() {
        let args = build_qemu_args(&options(), &ImageConfig::default(), &machine(), None).unwrap();
        let netdev = &args[args.iter().position(|a| a == "-netdev").unwrap() + 1];
        assert_eq!(netdev, "user,id=user");
    }

    #[test]
    fn shares_get_one_fsdev_device_pair_each() {
        let mut opts = options();
        opts.shares = vec![
            Share {
                host_path: PathBuf::from("/srv/a"),
                mountpoint: "/mnt/a".to_string(),
            },
            Share {
                host_path: PathBuf::from("/srv/b"),
                mountpoint: "/mnt/b".to_string(),
            },
        ];

        let args = build_qemu_args(&opts, &ImageConfig::default(), &machine(), None).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("local,id=fsdev0,path=/srv/a,security_model=none"));
        assert!(joined.contains("virtio-9p-pci,fsdev=fsdev0,mount_tag=share0"));
        assert!(joined.contains("local,id=fsdev1,path=/srv/b,security_model=none"));
        assert!(joined.contains("virtio-9p-pci,fsdev=fsdev1,mount_tag=share1"));
    }

    #[test]
    fn swap_adds_second_virtio_drive() {
        let mut opts = options();
        opts.swap = Some("300M".to_string());

        let args = build_qemu_args(&opts, &ImageConfig::default(), &machine(), None).unwrap();
        let drives: Vec<_> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-drive")
            .map(|(i, _)| args[i + 1].as_str())
            .collect();
        assert_eq!(
            drives,
            [
                "if=virtio,format=qcow2,file=disk.img",
                "if=virtio,format=raw,file=swap.img",
            ]
        );
    }

    #[test]
    fn removable_media_resolve_to_absolute_paths() {
        let mut opts = options();
        opts.cdroms = vec![PathBuf::from("/iso/tools.iso")];
        opts.usb_storage = vec![PathBuf::from("/stick/data.img")];

        let args = build_qemu_args(&opts, &ImageConfig::default(), &machine(), None).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("media=cdrom,file=/iso/tools.iso"));
        assert!(joined.contains("qemu-xhci"));
        assert!(joined.contains("if=none,id=usb0,format=raw,file=/stick/data.img"));
        assert!(joined.contains("usb-storage,drive=usb0"));
    }

    #[test]
    fn no_usb_controller_without_usb_media() {
        let args = build_qemu_args(&options(), &ImageConfig::default(), &machine(), None).unwrap();
        assert!(!args.contains(&"qemu-xhci".to_string()));
    }

    #[test]
    fn vnc_replaces_headless_display() {
        let mut opts = options();
        opts.display = DisplayMode::Vnc;

        let args = build_qemu_args(&opts, &ImageConfig::default(), &machine(), None).unwrap();
        assert!(!args.contains(&"-display".to_string()));
        let joined = args.join(" ");
        assert!(joined.contains("-vnc 127.0.0.1:0"));
    }

    #[test]
    fn image_args_come_last() {
        let config = ImageConfig {
            login: None,
            qemu_args: vec!["-device".to_string(), "virtio-rng-pci".to_string()],
        };

        let args = build_qemu_args(&options(), &config, &machine(), None).unwrap();
        assert_eq!(
            &args[args.len() - 2..],
            ["-device".to_string(), "virtio-rng-pci".to_string()]
        );
    }
}
