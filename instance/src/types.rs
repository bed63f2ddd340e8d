use crate::error::InstanceError;
use std::path::PathBuf;
use std::str::FromStr;

/// Everything the caller decides about an instance, fixed for its whole
/// lifetime.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub image: String,
    pub memory_mib: u32,
    pub smp: u32,
    pub tcp_forwards: Vec<PortForward>,
    pub udp_forwards: Vec<PortForward>,
    pub shares: Vec<Share>,
    pub cdroms: Vec<PathBuf>,
    pub usb_storage: Vec<PathBuf>,
    pub display: DisplayMode,
    /// Swap disk size as a qemu-img spec ("300M"), if requested.
    pub swap: Option<String>,
    /// Merge overlay changes back into the base image on shutdown.
    pub persist: bool,
    /// Whether to forward a host port to the guest's SSH port and run the
    /// credential bootstrap. Console-only instances turn this off.
    pub remote_access: bool,
}

impl InstanceOptions {
    pub fn new(image: impl Into<String>) -> Self {
        InstanceOptions {
            image: image.into(),
            memory_mib: 512,
            smp: 1,
            tcp_forwards: Vec::new(),
            udp_forwards: Vec::new(),
            shares: Vec::new(),
            cdroms: Vec::new(),
            usb_storage: Vec::new(),
            display: DisplayMode::Headless,
            swap: None,
            persist: false,
            remote_access: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayMode {
    #[default]
    Headless,
    Vnc,
}

/// One forwarded port: `host:guest` or `bind:host:guest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub bind_addr: String,
    pub host_port: u16,
    pub guest_port: u16,
}

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

impl FromStr for PortForward {
    type Err = InstanceError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (bind_addr, host, guest) = match parts.as_slice() {
            [host, guest] => (DEFAULT_BIND_ADDR, *host, *guest),
            [bind, host, guest] if !bind.is_empty() => (*bind, *host, *guest),
            _ => {
                return Err(InstanceError::Config(format!(
                    "bad port forward {:?}, expected HOST:GUEST or BIND:HOST:GUEST",
                    spec
                )));
            }
        };

        let parse = |s: &str| {
            s.parse::<u16>().map_err(|_| {
                InstanceError::Config(format!("bad port {:?} in forward {:?}", s, spec))
            })
        };

        Ok(PortForward {
            bind_addr: bind_addr.to_string(),
            host_port: parse(host)?,
            guest_port: parse(guest)?,
        })
    }
}

/// One shared directory: `host_path:guest_mountpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub host_path: PathBuf,
    pub mountpoint: String,
}

impl FromStr for Share {
    type Err = InstanceError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        match spec.split(':').collect::<Vec<_>>().as_slice() {
            [host, mountpoint] if !host.is_empty() && !mountpoint.is_empty() => Ok(Share {
                host_path: PathBuf::from(host),
                mountpoint: mountpoint.to_string(),
            }),
            _ => Err(InstanceError::Config(format!(
                "bad share {:?}, expected HOST_PATH:GUEST_MOUNTPOINT",
                spec
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_segment_forward_binds_loopback() {
        let fwd: PortForward = "8080:80".parse().unwrap();
        assert_eq!(fwd.bind_addr, "127.0.0.1");
        assert_eq!(fwd.host_port, 8080);
        assert_eq!(fwd.guest_port, 80);
    }

    #[test]
    fn three_segment_forward_keeps_bind_address() {
        let fwd: PortForward = "0.0.0.0:8080:80".parse().unwrap();
        assert_eq!(fwd.bind_addr, "0.0.0.0");
        assert_eq!(fwd.host_port, 8080);
        assert_eq!(fwd.guest_port, 80);
    }

    #[test]
    fn malformed_forwards_are_config_errors() {
        for spec in ["80", "1:2:3:4", "", "eighty:80", "80:eighty", ":80:80"] {
            let err = spec.parse::<PortForward>().unwrap_err();
            assert!(matches!(err, InstanceError::Config(_)), "{:?}", spec);
        }
    }

    #[test]
    fn share_splits_on_colon() {
        let share: Share = "/tmp/work:/mnt/shared".parse().unwrap();
        assert_eq!(share.host_path, PathBuf::from("/tmp/work"));
        assert_eq!(share.mountpoint, "/mnt/shared");
    }

    #[test]
    fn malformed_shares_are_config_errors() {
        for spec in ["", "/tmp/work", "a:b:c", ":/mnt", "/tmp:"] {
            let err = spec.parse::<Share>().unwrap_err();
            assert!(matches!(err, InstanceError::Config(_)), "{:?}", spec);
        }
    }
}
