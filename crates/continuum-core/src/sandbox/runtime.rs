//! The container-runtime capability set the Sandbox Manager requires.
//!
//! We specify only the operations the manager needs, not a client-library
//! wrapper around the full runtime API. [`DockerCliRuntime`] satisfies the
//! trait by shelling out to the `docker` binary, matching how the rest of
//! this corpus reaches for subprocess isolation rather than a registry
//! client crate when a CLI already exists on the host.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::SandboxError;

/// Resource and network configuration for a newly created container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub memory_mb: u32,
    pub cpu_limit: f32,
    pub network_name: String,
    /// Hostnames rewritten to `127.0.0.1` so lateral host access dead-ends.
    pub extra_hosts: Vec<String>,
}

/// Captured output of an exec call inside a running container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The capability set the Sandbox Manager requires of a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container from `spec`, running
    /// `sleep infinity` as its idle command. Returns the runtime-assigned id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String, SandboxError>;

    /// Start a previously created container.
    async fn start_container(&self, id: &str) -> Result<(), SandboxError>;

    /// Run a shell command inside a running container, capturing stdout and
    /// stderr on separate channels and returning the exit code.
    async fn exec(&self, id: &str, shell_command: &str) -> Result<ExecOutput, SandboxError>;

    /// Stream a tar archive into the container, unpacked at `dest` (e.g. `/`).
    async fn copy_in(&self, id: &str, dest: &str, tar_bytes: Vec<u8>) -> Result<(), SandboxError>;

    /// Whether the container is currently running. `Ok(false)` (not an
    /// error) if the container no longer exists.
    async fn is_running(&self, id: &str) -> Result<bool, SandboxError>;

    /// Force-remove a container. Tolerates "already gone".
    async fn remove_container(&self, id: &str) -> Result<(), SandboxError>;

    /// List existing network names.
    async fn list_networks(&self) -> Result<Vec<String>, SandboxError>;

    /// Create a bridge network with the given name.
    async fn create_network(&self, name: &str) -> Result<(), SandboxError>;
}

/// `ContainerRuntime` implemented by shelling out to the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCliRuntime;

impl DockerCliRuntime {
    pub fn new() -> Self {
        Self
    }
}

fn runtime_err(context: &str, output: &std::process::Output) -> SandboxError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    SandboxError::Runtime(format!("{context}: {stderr}"))
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--memory".to_string(),
            format!("{}m", spec.memory_mb),
            "--cpus".to_string(),
            format!("{}", spec.cpu_limit),
            "--cap-add".to_string(),
            "NET_ADMIN".to_string(),
            "--network".to_string(),
            spec.network_name.clone(),
        ];
        for host in &spec.extra_hosts {
            args.push("--add-host".to_string());
            args.push(format!("{host}:127.0.0.1"));
        }
        args.push(spec.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker create: {e}")))?;

        if !output.status.success() {
            return Err(runtime_err("docker create failed", &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        let output = Command::new("docker")
            .args(["start", id])
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker start: {e}")))?;

        if !output.status.success() {
            return Err(runtime_err("docker start failed", &output));
        }
        Ok(())
    }

    async fn exec(&self, id: &str, shell_command: &str) -> Result<ExecOutput, SandboxError> {
        let output = Command::new("docker")
            .args(["exec", id, "sh", "-c", shell_command])
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker exec: {e}")))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn copy_in(&self, id: &str, dest: &str, tar_bytes: Vec<u8>) -> Result<(), SandboxError> {
        let mut child = Command::new("docker")
            .args(["cp", "-", &format!("{id}:{dest}")])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("failed to spawn docker cp: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Runtime("docker cp has no stdin".to_string()))?;
        stdin
            .write_all(&tar_bytes)
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to write tar to docker cp: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("docker cp failed to complete: {e}")))?;

        if !output.status.success() {
            return Err(runtime_err("docker cp failed", &output));
        }
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool, SandboxError> {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", id])
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker inspect: {e}")))?;

        if !output.status.success() {
            // Unknown/removed container: treat as not running rather than error.
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let output = Command::new("docker")
            .args(["rm", "-f", id])
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker rm: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                return Err(runtime_err("docker rm failed", &output));
            }
        }
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>, SandboxError> {
        let output = Command::new("docker")
            .args(["network", "ls", "--format", "{{.Name}}"])
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker network ls: {e}")))?;

        if !output.status.success() {
            return Err(runtime_err("docker network ls failed", &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn create_network(&self, name: &str) -> Result<(), SandboxError> {
        let output = Command::new("docker")
            .args(["network", "create", name])
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker network create: {e}")))?;

        if !output.status.success() {
            return Err(runtime_err("docker network create failed", &output));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_success_on_zero_exit() {
        let out = ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(out.success());
    }

    #[test]
    fn exec_output_failure_on_nonzero_exit() {
        let out = ExecOutput {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: 1,
        };
        assert!(!out.success());
    }
}
