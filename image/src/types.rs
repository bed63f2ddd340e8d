use serde::{Deserialize, Serialize};

/// Guest login credentials used for the password bootstrap phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub username: String,
    pub password: String,
}

impl Default for Login {
    fn default() -> Self {
        Login {
            username: "ubuntu".to_string(),
            password: "ubuntu".to_string(),
        }
    }
}

/// Optional per-image sidecar, loaded from `config.json` in the image
/// directory. Unknown images simply get the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub login: Option<Login>,

    /// Extra hypervisor arguments appended verbatim after everything else,
    /// so an image can override the generated defaults.
    #[serde(rename = "qemu-args", default)]
    pub qemu_args: Vec<String>,
}

impl ImageConfig {
    pub fn credentials(&self) -> Login {
        self.login.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub name: String,
    pub disk_size: u64,
}
