use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use crate::storage::RedisConfig;

/// Main configuration structure for taskmill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            workflow: WorkflowConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: CoreConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // Try to load from TASKMILL_CONFIG env var first
        if let Ok(config_path) = std::env::var("TASKMILL_CONFIG") {
            return Self::load(&config_path);
        }

        // Try default locations
        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/taskmill/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.executor.steal_backoff_ms == 0 {
            return Err(Error::Config(
                "Executor steal backoff must be > 0".to_string(),
            ));
        }

        if self.dispatcher.fetch_timeout_ms == 0 {
            return Err(Error::Config(
                "Dispatcher fetch timeout must be > 0".to_string(),
            ));
        }

        if self.redis.pool_size == 0 {
            return Err(Error::Config("Redis pool size must be > 0".to_string()));
        }

        Ok(())
    }

    /// Development configuration (small pool, fast polling)
    pub fn development() -> Self {
        Self {
            executor: ExecutorConfig {
                workers: 2,
                steal_backoff_ms: 50,
                ..Default::default()
            },
            dispatcher: DispatcherConfig {
                fetch_timeout_ms: 100,
            },
            ..Self::default()
        }
    }

    /// Production configuration (full pool, default timings)
    pub fn production() -> Self {
        Self {
            workflow: WorkflowConfig {
                max_concurrent_steps: 64,
            },
            ..Self::default()
        }
    }
}

/// Job executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of worker threads (0 = CPU count - 1, minimum 1)
    #[serde(default)]
    pub workers: usize,

    /// Sleep applied when a steal attempt finds no victim work (milliseconds)
    #[serde(default = "default_steal_backoff_ms")]
    pub steal_backoff_ms: u64,

    /// Sleep applied by non-worker threads between empty wait iterations (milliseconds)
    #[serde(default = "default_wait_idle_ms")]
    pub wait_idle_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            steal_backoff_ms: default_steal_backoff_ms(),
            wait_idle_ms: default_wait_idle_ms(),
        }
    }
}

impl ExecutorConfig {
    /// Resolve the effective worker count
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    /// Get steal backoff as Duration
    pub fn steal_backoff(&self) -> Duration {
        Duration::from_millis(self.steal_backoff_ms)
    }

    /// Get non-worker wait idle sleep as Duration
    pub fn wait_idle(&self) -> Duration {
        Duration::from_millis(self.wait_idle_ms)
    }
}

/// Task dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How long an in-memory fetch blocks before yielding an empty tick (milliseconds)
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl DispatcherConfig {
    /// Get fetch timeout as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Global budget of steps polled per cycle (0 = unlimited)
    #[serde(default)]
    pub max_concurrent_steps: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 0,
        }
    }
}

fn default_steal_backoff_ms() -> u64 {
    300
}

fn default_wait_idle_ms() -> u64 {
    10
}

fn default_fetch_timeout_ms() -> u64 {
    500
}
