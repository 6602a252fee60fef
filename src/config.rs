use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub request: RequestConfig,
    pub dedup: DedupConfig,
    pub sender: SenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://switchboard.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Broker list the downstream Celery worker consumes wake-up tasks
    /// from.
    pub celery_queue: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            celery_queue: "handler".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Per-request deadline for webhook handling, seconds.
    pub deadline_seconds: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            deadline_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity_per_channel: usize,
    pub ttl_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity_per_channel: 1000,
            ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub workers: usize,
    pub max_send_attempts: i32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_send_attempts: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            request: RequestConfig::default(),
            dedup: DedupConfig::default(),
            sender: SenderConfig::default(),
        }
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    env::var("SWITCHBOARD_CONFIG").ok().map(PathBuf::from)
}

pub fn load_config() -> Config {
    let mut cfg = Config::default();

    if let Some(path) = resolve_config_path() {
        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment
    if let Ok(url) = env::var("SWITCHBOARD_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = url;
        }
    }

    if let Ok(url) = env::var("SWITCHBOARD_REDIS_URL") {
        if !url.trim().is_empty() {
            cfg.redis.url = url;
        }
    }

    if let Ok(queue) = env::var("SWITCHBOARD_CELERY_QUEUE") {
        if !queue.trim().is_empty() {
            cfg.redis.celery_queue = queue;
        }
    }

    if let Ok(port) = env::var("SWITCHBOARD_PORT") {
        if let Ok(port) = port.trim().parse() {
            cfg.server.port = port;
        }
    }

    if let Ok(host) = env::var("SWITCHBOARD_HOST") {
        if !host.trim().is_empty() {
            cfg.server.host = host;
        }
    }

    cfg
}
