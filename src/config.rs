//! Runtime configuration loading from environment variables.
//!
//! Every value comes from an `NNRT_*` variable with a default. Invalid
//! values fall back to the default without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `NNRT_WORKER_THREADS` | 0 | Async execution threads (0 = one per CPU) |
//! | `NNRT_QUEUE_DEPTH` | 64 | Max queued async executions |
//! | `NNRT_INFER_CONTEXTS` | 1 | Inference contexts per prepared model |
//! | `NNRT_REMOTE_TCP` | unset | Remote delegate `host:port` |
//! | `NNRT_REMOTE_SOCKET` | unset | Remote delegate Unix socket path |
//! | `NNRT_REMOTE_TIMEOUT_MS` | 5000 | Remote connect and I/O timeout |
//! | `NNRT_REMOTE_FRAME_LIMIT` | 268435456 | Max remote frame section (bytes) |
//! | `NNRT_SCALAR_SHAPE_FIX` | true | Report rank-0 non-empty outputs as `[1]` |
//! | `NNRT_LOG_LEVEL` | info | `EnvFilter` directive |
//! | `NNRT_LOG_FORMAT` | json | `json` or `pretty` |

use std::path::PathBuf;

use crate::execution::{ScalarShapePolicy, WorkerPoolConfig};
use crate::remote::DEFAULT_FRAME_LIMIT;
use crate::telemetry::{LogConfig, LogFormat};

/// Remote delegate endpoints and transport limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub tcp_address: Option<String>,
    pub socket_path: Option<PathBuf>,
    pub timeout_ms: u64,
    pub frame_limit: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            tcp_address: None,
            socket_path: None,
            timeout_ms: 5000,
            frame_limit: DEFAULT_FRAME_LIMIT,
        }
    }
}

/// All runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub worker_pool: WorkerPoolConfig,
    /// Inference contexts per prepared model; concurrent executions beyond
    /// this wait for a free context.
    pub inference_contexts: usize,
    pub remote: RemoteConfig,
    pub scalar_shape: ScalarShapePolicy,
    pub logging: LogConfig,
}

/// Flat summary of effective values, for logging at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub worker_threads: usize,
    pub queue_depth: usize,
    pub inference_contexts: usize,
    pub remote_tcp: Option<String>,
    pub remote_socket: Option<PathBuf>,
    pub remote_timeout_ms: u64,
    pub remote_frame_limit: usize,
    pub scalar_shape_fix: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Non-empty string value, if set.
fn parse_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn load_worker_pool_config() -> WorkerPoolConfig {
    let defaults = WorkerPoolConfig::default();
    let num_threads = parse_usize("NNRT_WORKER_THREADS", defaults.num_threads);
    let queue_depth = parse_usize("NNRT_QUEUE_DEPTH", defaults.queue_depth).max(1);
    WorkerPoolConfig {
        num_threads,
        queue_depth,
        ..defaults
    }
}

fn load_remote_config() -> RemoteConfig {
    const MIN_FRAME: usize = 4096;
    let timeout_ms = parse_u64("NNRT_REMOTE_TIMEOUT_MS", 5000).max(1);
    let frame_limit = parse_usize("NNRT_REMOTE_FRAME_LIMIT", DEFAULT_FRAME_LIMIT).max(MIN_FRAME);
    RemoteConfig {
        tcp_address: parse_string("NNRT_REMOTE_TCP"),
        socket_path: parse_string("NNRT_REMOTE_SOCKET").map(PathBuf::from),
        timeout_ms,
        frame_limit,
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let format = parse_string("NNRT_LOG_FORMAT")
        .and_then(|f| f.parse().ok())
        .unwrap_or(defaults.format);
    LogConfig {
        format,
        level: parse_string("NNRT_LOG_LEVEL").unwrap_or(defaults.level),
        output_path: None,
    }
}

/// Load all configuration from environment variables.
pub fn load() -> RuntimeConfig {
    let scalar_shape = if parse_bool("NNRT_SCALAR_SHAPE_FIX", true) {
        ScalarShapePolicy::PromoteToRank1
    } else {
        ScalarShapePolicy::Preserve
    };
    RuntimeConfig {
        worker_pool: load_worker_pool_config(),
        inference_contexts: parse_usize("NNRT_INFER_CONTEXTS", 1).max(1),
        remote: load_remote_config(),
        scalar_shape,
        logging: load_log_config(),
    }
}

impl RuntimeConfig {
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            worker_threads: self.worker_pool.resolved_threads(),
            queue_depth: self.worker_pool.queue_depth,
            inference_contexts: self.inference_contexts.max(1),
            remote_tcp: self.remote.tcp_address.clone(),
            remote_socket: self.remote.socket_path.clone(),
            remote_timeout_ms: self.remote.timeout_ms,
            remote_frame_limit: self.remote.frame_limit,
            scalar_shape_fix: self.scalar_shape == ScalarShapePolicy::PromoteToRank1,
            log_level: self.logging.level.clone(),
            log_format: self.logging.format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "NNRT_WORKER_THREADS",
        "NNRT_QUEUE_DEPTH",
        "NNRT_INFER_CONTEXTS",
        "NNRT_REMOTE_TCP",
        "NNRT_REMOTE_SOCKET",
        "NNRT_REMOTE_TIMEOUT_MS",
        "NNRT_REMOTE_FRAME_LIMIT",
        "NNRT_SCALAR_SHAPE_FIX",
        "NNRT_LOG_LEVEL",
        "NNRT_LOG_FORMAT",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.worker_pool.num_threads, 0);
        assert_eq!(cfg.worker_pool.queue_depth, 64);
        assert_eq!(cfg.inference_contexts, 1);
        assert_eq!(cfg.remote, RemoteConfig::default());
        assert_eq!(cfg.scalar_shape, ScalarShapePolicy::PromoteToRank1);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("NNRT_WORKER_THREADS", "3");
        std::env::set_var("NNRT_QUEUE_DEPTH", "8");
        std::env::set_var("NNRT_INFER_CONTEXTS", "4");
        std::env::set_var("NNRT_REMOTE_TCP", "10.0.0.2:50051");
        std::env::set_var("NNRT_REMOTE_SOCKET", "/run/nnrt.sock");
        std::env::set_var("NNRT_SCALAR_SHAPE_FIX", "off");
        std::env::set_var("NNRT_LOG_FORMAT", "pretty");
        let cfg = load();
        assert_eq!(cfg.worker_pool.num_threads, 3);
        assert_eq!(cfg.worker_pool.queue_depth, 8);
        assert_eq!(cfg.inference_contexts, 4);
        assert_eq!(cfg.remote.tcp_address.as_deref(), Some("10.0.0.2:50051"));
        assert_eq!(cfg.remote.socket_path, Some(PathBuf::from("/run/nnrt.sock")));
        assert_eq!(cfg.scalar_shape, ScalarShapePolicy::Preserve);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_values_fall_back_and_floors_apply() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("NNRT_QUEUE_DEPTH", "0");
        std::env::set_var("NNRT_INFER_CONTEXTS", "many");
        std::env::set_var("NNRT_REMOTE_FRAME_LIMIT", "1");
        std::env::set_var("NNRT_REMOTE_TCP", "   ");
        std::env::set_var("NNRT_SCALAR_SHAPE_FIX", "maybe");
        std::env::set_var("NNRT_LOG_FORMAT", "xml");
        let cfg = load();
        assert_eq!(cfg.worker_pool.queue_depth, 1);
        assert_eq!(cfg.inference_contexts, 1);
        assert_eq!(cfg.remote.frame_limit, 4096);
        assert_eq!(cfg.remote.tcp_address, None);
        assert_eq!(cfg.scalar_shape, ScalarShapePolicy::PromoteToRank1);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_resolves_threads() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let eff = load().effective_config();
        assert!(eff.worker_threads >= 1);
        assert!(eff.scalar_shape_fix);
        assert_eq!(eff.remote_timeout_ms, 5000);
    }
}
