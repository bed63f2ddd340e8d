use std::path::{Path, PathBuf};

/// Filesystem layout under the kiln data directory. Passed explicitly to
/// whatever needs it, so independent instances (and tests) never share
/// global state.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Image repository root.
    pub images: PathBuf,
    /// Ephemeral per-run workspaces.
    pub var: PathBuf,
    /// Upstream download cache for `image prepare`.
    pub cache: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Paths {
            images: data_dir.join("images"),
            var: data_dir.join("var"),
            cache: data_dir.join("cache"),
        }
    }
}
