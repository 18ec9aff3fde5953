//! Server configuration, loaded from the environment at startup.
//!
//! `main` loads a `.env` file first, so every key can live there as well.

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentConfig;

const DEFAULT_CORS_ORIGINS: &str =
    "http://localhost,http://localhost:3000,http://127.0.0.1,http://127.0.0.1:3000";

const DEFAULT_ACTIVE_TOOLS: &str = "process_video,get_video_clip_from_image";

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to (`BIND_ADDRESS`).
    pub bind_address: String,
    /// Where uploaded videos are written (`UPLOAD_DIR`, default: system temp dir).
    pub upload_dir: PathBuf,
    /// Largest accepted upload in bytes (`MAX_UPLOAD_MB`).
    pub max_upload_bytes: usize,
    /// MCP streamable-HTTP endpoint of the video tool server (`MCP_SERVER`).
    pub mcp_server: String,
    /// Per-request timeout for MCP calls (`MCP_TIMEOUT_SECS`).
    pub mcp_timeout: Duration,
    pub agent: AgentConfig,
    /// Front-end origins allowed by CORS (`CORS_ORIGINS`, comma separated).
    pub cors_origins: Vec<String>,
    /// How long finished tasks stay queryable (`TASK_TTL_SECS`).
    pub task_ttl: Duration,
    /// How often expired tasks are swept (`TASK_SWEEP_SECS`).
    pub sweep_interval: Duration,
    /// `tracing` filter used when `RUST_LOG` is unset (`LOG_LEVEL`).
    pub log_level: String,
    /// Emit newline-delimited JSON logs (`LOG_JSON`).
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        Self {
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8080"),
            upload_dir,
            max_upload_bytes: megabytes(parse_env("MAX_UPLOAD_MB", 100)),
            mcp_server: env_or("MCP_SERVER", "http://localhost:9090/mcp"),
            mcp_timeout: Duration::from_secs(parse_env("MCP_TIMEOUT_SECS", 600)),
            agent: AgentConfig {
                api_key: env_or("GROQ_API_KEY", ""),
                base_url: env_or("GROQ_BASE_URL", "https://api.groq.com/openai/v1"),
                model: env_or("GROQ_MODEL", "llama-3.3-70b-versatile"),
                memory_size: parse_env("AGENT_MEMORY_SIZE", 20),
                active_tools: split_list(&env_or("ACTIVE_TOOLS", DEFAULT_ACTIVE_TOOLS)),
            },
            cors_origins: split_list(&env_or("CORS_ORIGINS", DEFAULT_CORS_ORIGINS)),
            task_ttl: Duration::from_secs(parse_env("TASK_TTL_SECS", 3600)),
            sweep_interval: Duration::from_secs(parse_env::<u64>("TASK_SWEEP_SECS", 60).max(1)),
            log_level: env_or("LOG_LEVEL", "info"),
            log_json: std::env::var("LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn megabytes(mb: usize) -> usize {
    mb.saturating_mul(1024 * 1024)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
