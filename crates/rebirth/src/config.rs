//! Process-wide configuration.
//!
//! Settings are read once from the environment (a `.env` file is honored in
//! development) and frozen for the lifetime of the process. Everything that
//! tunes generation, speculation, or networking lives here so operators can
//! adjust behavior without a rebuild.

use std::path::PathBuf;
use std::sync::OnceLock;

static SETTINGS: OnceLock<Settings> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Settings {
    // server
    pub bind_host: String,
    pub bind_port: u16,
    /// Absolute base URL used when composing static asset links. Falls back
    /// to `http://{bind_host}:{bind_port}` when unset.
    pub public_base_url: Option<String>,
    pub secret_key: String,
    pub access_token_expire_minutes: i64,

    // database
    pub database_path: PathBuf,

    // LLM provider (OpenAI-compatible chat completions)
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_response_format_json: bool,
    pub llm_timeout_seconds: u64,
    pub llm_max_retries: u32,
    pub llm_retry_backoff_min_ms: u64,
    pub llm_retry_backoff_max_ms: u64,

    // image generation
    pub enable_ai_image_generation: bool,
    pub image_base_url: String,
    pub image_api_key: String,
    pub image_model: String,
    pub image_connect_timeout_seconds: u64,
    pub image_first_read_timeout_seconds: u64,
    pub image_retry_read_timeout_seconds: u64,
    pub image_max_retries: u32,
    pub image_library_dir: PathBuf,
    pub generated_image_dir: PathBuf,

    // chapter settlement
    pub min_nodes: i64,
    pub max_nodes: i64,
    pub pass_threshold: i64,
    pub fail_threshold: i64,

    // speculative pre-generation
    pub speculation_enabled: bool,
    pub speculation_max_depth: u32,
    pub speculation_choice_workers: usize,
    pub speculation_level_cap: usize,
    pub speculation_max_concurrency_per_user: usize,

    // first-story priming cache
    pub first_story_cache_max_entries: usize,
    pub start_cache_wait_seconds: u64,
    pub start_cache_poll_interval_ms: u64,

    // continue() pacing
    pub race_wait_interval_ms: u64,
    pub race_wait_max_seconds: u64,
    pub node_ready_poll_interval_ms: u64,
    pub node_ready_max_wait_seconds: u64,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Settings {
    /// Read settings from the environment. Numeric knobs are clamped to the
    /// minimum that keeps the subsystem functional.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            bind_host: env_str("REBIRTH_HOST", "127.0.0.1"),
            bind_port: env_parse("REBIRTH_PORT", 8000),
            public_base_url: env_opt("REBIRTH_PUBLIC_BASE_URL"),
            secret_key: env_str(
                "REBIRTH_SECRET_KEY",
                "dev-only-secret-change-me-32-bytes-xx",
            ),
            access_token_expire_minutes: env_parse("REBIRTH_ACCESS_TOKEN_EXPIRE_MINUTES", 60),

            database_path: PathBuf::from(env_str("REBIRTH_DATABASE_PATH", "data/rebirth.db")),

            llm_base_url: env_str(
                "REBIRTH_LLM_BASE_URL",
                "https://dashscope.aliyuncs.com/compatible-mode/v1",
            ),
            llm_api_key: env_str("REBIRTH_LLM_API_KEY", ""),
            llm_model: env_str("REBIRTH_LLM_MODEL", "qwen-flash"),
            llm_temperature: env_parse("REBIRTH_LLM_TEMPERATURE", 0.75),
            llm_max_tokens: env_parse("REBIRTH_LLM_MAX_TOKENS", 4096),
            llm_response_format_json: env_bool("REBIRTH_LLM_RESPONSE_FORMAT_JSON", true),
            llm_timeout_seconds: env_parse("REBIRTH_LLM_TIMEOUT_SECONDS", 30).max(1),
            llm_max_retries: env_parse("REBIRTH_LLM_MAX_RETRIES", 2),
            llm_retry_backoff_min_ms: env_parse("REBIRTH_LLM_RETRY_BACKOFF_MIN_MS", 250),
            llm_retry_backoff_max_ms: env_parse("REBIRTH_LLM_RETRY_BACKOFF_MAX_MS", 1000),

            enable_ai_image_generation: env_bool("REBIRTH_ENABLE_AI_IMAGE_GENERATION", false),
            image_base_url: env_str("REBIRTH_IMAGE_BASE_URL", ""),
            image_api_key: env_str("REBIRTH_IMAGE_API_KEY", ""),
            image_model: env_str("REBIRTH_IMAGE_MODEL", "nano-banana"),
            image_connect_timeout_seconds: env_parse("REBIRTH_IMAGE_CONNECT_TIMEOUT_SECONDS", 8)
                .max(1),
            image_first_read_timeout_seconds: env_parse(
                "REBIRTH_IMAGE_FIRST_READ_TIMEOUT_SECONDS",
                60,
            )
            .max(1),
            image_retry_read_timeout_seconds: env_parse(
                "REBIRTH_IMAGE_RETRY_READ_TIMEOUT_SECONDS",
                30,
            )
            .max(1),
            image_max_retries: env_parse("REBIRTH_IMAGE_MAX_RETRIES", 1),
            image_library_dir: PathBuf::from(env_str("REBIRTH_IMAGE_LIBRARY_DIR", "assets/images")),
            generated_image_dir: PathBuf::from(env_str(
                "REBIRTH_GENERATED_IMAGE_DIR",
                "assets/generated_images",
            )),

            min_nodes: env_parse("REBIRTH_MIN_NODES", 6),
            max_nodes: env_parse("REBIRTH_MAX_NODES", 22),
            pass_threshold: env_parse("REBIRTH_PASS_THRESHOLD", 80),
            fail_threshold: env_parse("REBIRTH_FAIL_THRESHOLD", 90),

            speculation_enabled: env_bool("REBIRTH_SPECULATION_ENABLED", true),
            speculation_max_depth: env_parse("REBIRTH_SPECULATION_MAX_DEPTH", 1),
            speculation_choice_workers: env_parse("REBIRTH_SPECULATION_CHOICE_WORKERS", 3).max(1),
            speculation_level_cap: env_parse("REBIRTH_SPECULATION_LEVEL_CAP", 18),
            speculation_max_concurrency_per_user: env_parse(
                "REBIRTH_SPECULATION_MAX_CONCURRENCY_PER_USER",
                9,
            ),

            first_story_cache_max_entries: env_parse("REBIRTH_FIRST_STORY_CACHE_MAX_ENTRIES", 100)
                .max(1),
            start_cache_wait_seconds: env_parse("REBIRTH_START_CACHE_WAIT_SECONDS", 8),
            start_cache_poll_interval_ms: env_parse("REBIRTH_START_CACHE_POLL_INTERVAL_MS", 200)
                .max(10),

            race_wait_interval_ms: env_parse("REBIRTH_RACE_WAIT_INTERVAL_MS", 250).max(10),
            race_wait_max_seconds: env_parse("REBIRTH_RACE_WAIT_MAX_SECONDS", 120),
            node_ready_poll_interval_ms: env_parse("REBIRTH_NODE_READY_POLL_INTERVAL_MS", 500)
                .max(10),
            node_ready_max_wait_seconds: env_parse("REBIRTH_NODE_READY_MAX_WAIT_SECONDS", 60),
        }
    }

    pub fn global() -> &'static Settings {
        SETTINGS.get_or_init(Settings::from_env)
    }

    /// Install a specific settings value (tests, embedding). No-op when the
    /// global has already been initialized.
    pub fn init(settings: Settings) -> &'static Settings {
        let _ = SETTINGS.set(settings);
        Settings::global()
    }

    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.bind_host, self.bind_port),
        }
    }
}
