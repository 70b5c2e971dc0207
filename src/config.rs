//! Configuration types.
//!
//! Every struct has a `Default` and a `from_env()` constructor. Unset or
//! unparsable variables fall back to the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Allocator loop configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Wall-clock budget for one `ThreadPool::run()` invocation.
    pub time_budget: Duration,
    /// Consecutive passes with zero free slots before a starvation warning.
    pub starvation_threshold: u32,
    /// Idle sleep between passes (jittered).
    pub poll_interval: Duration,
    /// Maximum tasks fetched from the queue per pass.
    pub batch_size: usize,
    /// Claim lease granted to a worker.
    pub lease: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(55),
            starvation_threshold: 10,
            poll_interval: Duration::from_millis(1000),
            batch_size: 50,
            lease: Duration::from_secs(120),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            time_budget: Duration::from_secs(env_or(
                "WIP_POOL_TIME_BUDGET_SECS",
                d.time_budget.as_secs(),
            )),
            starvation_threshold: env_or("WIP_POOL_STARVATION_THRESHOLD", d.starvation_threshold),
            poll_interval: Duration::from_millis(env_or(
                "WIP_POOL_POLL_INTERVAL_MS",
                d.poll_interval.as_millis() as u64,
            )),
            batch_size: env_or("WIP_POOL_BATCH_SIZE", d.batch_size),
            lease: Duration::from_secs(env_or("WIP_POOL_LEASE_SECS", d.lease.as_secs())),
        }
    }
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard wall-clock budget for one `WipWorker::process()` call.
    pub timeout: Duration,
    /// Identity recorded on claims made by this process.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            timeout: Duration::from_secs(env_or("WIP_WORKER_TIMEOUT_SECS", d.timeout.as_secs())),
            worker_id: std::env::var("WIP_WORKER_ID").unwrap_or(d.worker_id),
        }
    }
}

/// Outbound callback and inbound signal URL configuration.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Public base URL remote work posts signals to, e.g. `https://wip.example.com`.
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Skip TLS certificate verification (non-production only).
    pub insecure: bool,
    /// Permit plain `http://` targets.
    pub allow_http: bool,
    pub max_redirects: usize,
    pub timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8080".to_string(),
            username: None,
            password: None,
            insecure: false,
            allow_http: false,
            max_redirects: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

impl CallbackConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: std::env::var("WIP_CALLBACK_BASE_URL").unwrap_or(d.base_url),
            username: std::env::var("WIP_CALLBACK_USER").ok(),
            password: std::env::var("WIP_CALLBACK_PASSWORD")
                .ok()
                .map(SecretString::from),
            insecure: env_flag("WIP_CALLBACK_INSECURE"),
            allow_http: env_flag("WIP_CALLBACK_ALLOW_HTTP"),
            ..d
        }
    }
}

/// Which process backend the binary drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Docker,
    Ssh,
    Null,
}

impl FromStr for BackendChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "ssh" => Ok(Self::Ssh),
            "null" => Ok(Self::Null),
            other => Err(ConfigError::InvalidValue {
                key: "WIP_BACKEND".to_string(),
                message: format!("unknown backend '{other}' (expected docker, ssh or null)"),
            }),
        }
    }
}

/// SSH backend settings.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "wip".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            user: std::env::var("WIP_SSH_USER").unwrap_or(d.user),
            port: env_or("WIP_SSH_PORT", d.port),
            identity_file: std::env::var("WIP_SSH_KEY").ok().map(PathBuf::from),
            ..d
        }
    }
}

/// Top-level service configuration for the binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Operator-declared servers and their thread capacity.
    pub servers: Vec<(String, i64)>,
    pub backend: BackendChoice,
    pub docker_image: String,
    pub ssh: SshConfig,
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub callback: CallbackConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let servers = match std::env::var("WIP_SERVERS") {
            Ok(raw) => parse_servers(&raw)?,
            Err(_) => Vec::new(),
        };
        let backend = match std::env::var("WIP_BACKEND") {
            Ok(raw) => raw.parse()?,
            Err(_) => BackendChoice::Docker,
        };

        Ok(Self {
            db_path: std::env::var("WIP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/wip-runtime.db")),
            http_port: env_or("WIP_HTTP_PORT", 8080),
            servers,
            backend,
            docker_image: std::env::var("WIP_DOCKER_IMAGE")
                .unwrap_or_else(|_| "alpine:3".to_string()),
            ssh: SshConfig::from_env(),
            pool: PoolConfig::from_env(),
            worker: WorkerConfig::from_env(),
            callback: CallbackConfig::from_env(),
        })
    }
}

/// Parse `name=threads,name=threads` into server declarations.
pub fn parse_servers(raw: &str) -> Result<Vec<(String, i64)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, threads) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: "WIP_SERVERS".to_string(),
                message: format!("expected name=threads, got '{entry}'"),
            })?;
            let threads: i64 = threads.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "WIP_SERVERS".to_string(),
                message: format!("thread count for '{name}' is not a number"),
            })?;
            if threads < 0 {
                return Err(ConfigError::InvalidValue {
                    key: "WIP_SERVERS".to_string(),
                    message: format!("thread count for '{name}' is negative"),
                });
            }
            Ok((name.trim().to_string(), threads))
        })
        .collect()
}
