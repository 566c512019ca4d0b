use thiserror::Error;

/// Startup-time configuration or connectivity failures. Fatal; the process
/// exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing or invalid environment variable {0}")]
    InvalidEnv(String),

    #[error("could not reach task store: {0}")]
    StoreUnreachable(#[source] anyhow::Error),

    #[error("could not create sandbox network {name}: {source}")]
    NetworkSetup {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failures from the Sandbox Manager: bring-up, copy, or exec.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container bring-up failed: {0}")]
    BringUp(String),

    #[error("container runtime call failed: {0}")]
    Runtime(String),

    #[error("script exited with status {exit_code}: {stderr_excerpt}")]
    NonZeroExit {
        exit_code: i32,
        stderr_excerpt: String,
        /// Stdout captured before the non-zero exit; persisted alongside
        /// the failure so partial output is never silently dropped.
        stdout: String,
    },

    #[error("sandbox execution cancelled")]
    Cancelled,
}

impl SandboxError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
