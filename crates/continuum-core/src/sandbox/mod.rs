//! Sandbox Manager: owns the lifecycle of exactly one persistent,
//! pre-hardened container per worker process.
//!
//! Amortises cold-start by reusing the container across consecutive
//! tasks; per-task isolation comes from filesystem sanitisation between
//! runs, not from a fresh container each time. All state mutations are
//! serialised under a single mutex, so exactly one `execute` is in flight
//! per worker.

pub mod archive;
pub mod runtime;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use runtime::{ContainerRuntime, ContainerSpec};

/// Hostnames redirected to loopback so lateral host access dead-ends.
const EXTRA_HOSTS: &[&str] = &["host.docker.internal", "gateway.docker.internal"];

/// Sandbox-internal account the script runs as (never root).
const SANDBOX_USER: &str = "sandboxuser";

#[derive(Debug, Default)]
struct SandboxState {
    container_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    initialized: bool,
}

impl SandboxState {
    fn clear(&mut self) {
        *self = SandboxState::default();
    }
}

/// Owns at most one container for the lifetime of the worker process that
/// holds it.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    /// Used to derive a stable, human-identifiable container name.
    worker_id: String,
    state: Mutex<SandboxState>,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig, worker_id: String) -> Self {
        Self {
            runtime,
            config,
            worker_id,
            state: Mutex::new(SandboxState::default()),
        }
    }

    fn container_name(&self) -> String {
        format!("continuum-sandbox-{}", &self.worker_id)
    }

    fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: self.config.image.clone(),
            memory_mb: self.config.memory_mb,
            cpu_limit: self.config.cpu_limit,
            network_name: self.config.network_name.clone(),
            extra_hosts: EXTRA_HOSTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Ensure the container exists and is running, bringing one up from
    /// scratch if necessary. Idempotent: a no-op if already ready.
    pub async fn ensure_ready(&self) -> Result<(), SandboxError> {
        let mut state = self.state.lock().await;
        self.ensure_ready_locked(&mut state).await
    }

    async fn ensure_ready_locked(&self, state: &mut SandboxState) -> Result<(), SandboxError> {
        if let Some(id) = state.container_id.clone() {
            if self.runtime.is_running(&id).await? {
                return Ok(());
            }
            warn!(container_id = %short_id(&id), "existing sandbox container is not running, rebuilding");
            let _ = self.runtime.remove_container(&id).await;
            state.clear();
        }

        self.bring_up(state).await
    }

    /// Create, start, and harden a fresh container. Tears itself down and
    /// surfaces an error if the setup exec fails.
    async fn bring_up(&self, state: &mut SandboxState) -> Result<(), SandboxError> {
        let name = self.container_name();
        let spec = self.container_spec();

        debug!(container_name = %name, "bringing up sandbox container");

        let container_id = self.runtime.create_container(&name, &spec).await?;
        self.runtime.start_container(&container_id).await?;

        let setup_result = self.runtime.exec(&container_id, SETUP_SCRIPT).await;
        let setup = match setup_result {
            Ok(out) => out,
            Err(err) => {
                let _ = self.runtime.remove_container(&container_id).await;
                return Err(SandboxError::BringUp(err.to_string()));
            }
        };

        if !setup.success() {
            let _ = self.runtime.remove_container(&container_id).await;
            return Err(SandboxError::BringUp(format!(
                "setup exec exited {}: {}",
                setup.exit_code, setup.stderr
            )));
        }

        let now = Utc::now();
        state.container_id = Some(container_id.clone());
        state.created_at = Some(now);
        state.last_used_at = Some(now);
        state.initialized = true;

        info!(container_id = %short_id(&container_id), "sandbox container ready");
        Ok(())
    }

    /// Remove leftover task files and scratch directories. Individual
    /// deletion failures are tolerated -- the command always exits 0.
    async fn sanitise(&self, container_id: &str) -> Result<(), SandboxError> {
        let out = self.runtime.exec(container_id, SANITISE_SCRIPT).await?;
        if !out.success() {
            return Err(SandboxError::Runtime(format!(
                "sanitise exited {}: {}",
                out.exit_code, out.stderr
            )));
        }
        Ok(())
    }

    /// Run `script` against `payload` inside the sandbox, reusing the
    /// existing container when possible.
    ///
    /// Cancellation is observed promptly: on a cancelled worker shutdown,
    /// this returns `SandboxError::Cancelled` without touching
    /// `last_used_at`.
    pub async fn execute(
        &self,
        script: &[u8],
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, SandboxError> {
        tokio::select! {
            result = self.execute_inner(script, payload) => result,
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        }
    }

    async fn execute_inner(&self, script: &[u8], payload: &[u8]) -> Result<String, SandboxError> {
        let mut state = self.state.lock().await;
        self.ensure_ready_locked(&mut state).await?;

        let container_id = state
            .container_id
            .clone()
            .expect("ensure_ready_locked guarantees a container id");

        self.sanitise(&container_id).await?;

        let archive = archive::build_task_archive(script, payload)
            .map_err(|e| SandboxError::Runtime(format!("failed to build tar archive: {e}")))?;
        self.runtime.copy_in(&container_id, "/", archive).await?;

        let chown_cmd =
            format!("chown {SANDBOX_USER}:{SANDBOX_USER} /script.py /payload.json");
        let chown = self.runtime.exec(&container_id, &chown_cmd).await?;
        if !chown.success() {
            return Err(SandboxError::Runtime(format!(
                "chown failed (exit {}): {}",
                chown.exit_code, chown.stderr
            )));
        }

        let run_cmd = format!(
            "su {SANDBOX_USER} -c 'python /script.py /payload.json'"
        );
        let result = self.runtime.exec(&container_id, &run_cmd).await?;

        state.last_used_at = Some(Utc::now());
        drop(state);

        if result.success() {
            Ok(result.stdout)
        } else {
            let excerpt: String = result.stderr.chars().take(2000).collect();
            Err(SandboxError::NonZeroExit {
                exit_code: result.exit_code,
                stderr_excerpt: excerpt,
                stdout: result.stdout,
            })
        }
    }

    /// If a container exists and has been idle past the configured
    /// timeout, force-remove it and clear internal state.
    pub async fn reap_if_idle(&self) -> Result<(), SandboxError> {
        let mut state = self.state.lock().await;
        let Some(container_id) = state.container_id.clone() else {
            return Ok(());
        };
        let Some(last_used) = state.last_used_at else {
            return Ok(());
        };

        let idle_for = Utc::now().signed_duration_since(last_used);
        let timeout = chrono::Duration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        if idle_for > timeout {
            info!(container_id = %short_id(&container_id), idle_secs = idle_for.num_seconds(), "reaping idle sandbox container");
            self.runtime.remove_container(&container_id).await?;
            state.clear();
        }
        Ok(())
    }

    /// Unconditionally remove any live container. Called on worker
    /// shutdown.
    pub async fn dispose(&self) -> Result<(), SandboxError> {
        let mut state = self.state.lock().await;
        if let Some(container_id) = state.container_id.clone() {
            self.runtime.remove_container(&container_id).await?;
        }
        state.clear();
        Ok(())
    }

    /// Spawn the background idle reaper. Runs on a 1-minute cadence until
    /// `cancel` fires.
    pub fn spawn_idle_reaper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = manager.reap_if_idle().await {
                            warn!(error = %err, "idle reaper failed to remove container");
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("idle reaper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Ensure the dedicated sandbox bridge network exists, creating it if
/// absent. Called once at worker startup.
pub async fn ensure_sandbox_network(
    runtime: &dyn ContainerRuntime,
    name: &str,
) -> Result<(), SandboxError> {
    let existing = runtime.list_networks().await?;
    if existing.iter().any(|n| n == name) {
        return Ok(());
    }
    info!(network = name, "creating sandbox bridge network");
    runtime.create_network(name).await
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

const SETUP_SCRIPT: &str = r#"
apt-get update -qq || true
apt-get install -y -qq iptables || true
iptables -A OUTPUT -d 10.0.0.0/8 -j DROP || true
iptables -A OUTPUT -d 172.16.0.0/12 -j DROP || true
iptables -A OUTPUT -d 192.168.0.0/16 -j DROP || true
iptables -A OUTPUT -d 169.254.0.0/16 -j DROP || true
useradd -m sandboxuser || true
true
"#;

const SANITISE_SCRIPT: &str = r#"
rm -f /script.py /payload.json
rm -rf /tmp/* /var/tmp/* /home/sandboxuser/* 2>/dev/null
true
"#;
