use std::env;
use std::time::Duration;

/// Worker-wide tunables resolved from the environment. `DB_*` connection
/// settings live in `continuum_db::DbConfig`; everything else the worker
/// needs is here.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fallback poll interval, already floor-clamped to 5 seconds.
    pub polling_interval: Duration,
    /// Priority band; 0 on either side means unbounded on that side.
    pub min_priority: i32,
    pub max_priority: i32,
    pub sandbox: SandboxConfig,
}

impl WorkerConfig {
    const MIN_POLLING_INTERVAL_SECS: u64 = 5;

    pub fn from_env() -> Self {
        let raw_polling = env::var("POLLING_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(Self::MIN_POLLING_INTERVAL_SECS);

        // The source clamps via bitwise OR; we use arithmetic max, which is
        // the corrected behavior (see DESIGN NOTES on the polling clamp).
        let clamped = raw_polling.max(Self::MIN_POLLING_INTERVAL_SECS);

        Self {
            polling_interval: Duration::from_secs(clamped),
            min_priority: env::var("MIN_PRIORITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_priority: env::var("MAX_PRIORITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            sandbox: SandboxConfig::from_env(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Sandbox Manager tunables.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub memory_mb: u32,
    pub cpu_limit: f32,
    pub idle_timeout: Duration,
    pub network_name: String,
}

impl SandboxConfig {
    pub const DEFAULT_IMAGE: &str = "python:3.9-slim";
    pub const DEFAULT_MEMORY_MB: u32 = 512;
    pub const DEFAULT_CPU_LIMIT: f32 = 0.5;
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 5 * 60;
    pub const DEFAULT_NETWORK_NAME: &str = "continuum_sandbox";

    pub fn from_env() -> Self {
        Self {
            image: env::var("CONTAINER_IMAGE").unwrap_or_else(|_| Self::DEFAULT_IMAGE.to_owned()),
            memory_mb: env::var("CONTAINER_MEMORY_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_MEMORY_MB),
            cpu_limit: env::var("CONTAINER_CPU_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_CPU_LIMIT),
            idle_timeout: env::var("CONTAINER_IDLE_TIMEOUT")
                .ok()
                .and_then(|v| parse_duration_suffix(&v))
                .unwrap_or(Duration::from_secs(Self::DEFAULT_IDLE_TIMEOUT_SECS)),
            network_name: Self::DEFAULT_NETWORK_NAME.to_owned(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Parse a simple duration string like `5m`, `30s`, or a bare number of
/// seconds. Returns `None` on anything unparseable.
fn parse_duration_suffix(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(num) = raw.strip_suffix('s') {
        return num.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(num) = raw.strip_suffix('m') {
        return num.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(num) = raw.strip_suffix('h') {
        return num
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }
    raw.parse::<u64>().ok().map(Duration::from_secs)
}
