mod error;
mod platform;
mod prepare;
mod qemu_img;
mod repository;
mod types;

pub use error::ImageError;
pub use platform::{Firmware, MachineSpec, PLATFORMS, Platform, default_image_name, host_arch};
pub use prepare::prepare;
pub use qemu_img::{commit_overlay, create_overlay, create_raw, valid_size_spec};
pub use repository::{CONFIG_FILE, DISK_FILE, ImageRepository};
pub use types::*;
