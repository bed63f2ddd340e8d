use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("image already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid image name: {0}")]
    InvalidName(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("{command} failed: {stderr}")]
    DiskCommand { command: String, stderr: String },

    #[error("download failed: {0}")]
    Download(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ImageError {
    fn from(e: reqwest::Error) -> Self {
        ImageError::Download(e.to_string())
    }
}
