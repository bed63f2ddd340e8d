use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstanceError {
    /// A malformed option. Reported before any resource is allocated and
    /// never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Workspace or disk allocation failed; nothing was started, so there
    /// is nothing to tear down.
    #[error("resource error: {0}")]
    Resource(String),

    /// The hypervisor process came up wrong (or not at all). Teardown has
    /// already run by the time this propagates.
    #[error("startup error: {0}")]
    Startup(String),

    /// The instance never became reachable over the bootstrap channel.
    /// Fatal to the run; teardown has already run.
    #[error("instance not reachable after {}s", elapsed.as_secs())]
    BootstrapTimeout { elapsed: Duration },

    /// The remote command exited non-zero; the code becomes this
    /// invocation's own exit code.
    #[error("remote command exited with status {0}")]
    RemoteExit(i32),

    #[error("interrupted")]
    Cancelled,

    #[error(transparent)]
    Image(#[from] kiln_image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
