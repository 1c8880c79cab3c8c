use std::env;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 51055;
pub const DEFAULT_API_BASE: &str = "https://api.deepseek.com/v1";
pub const DEFAULT_MODEL: &str = "deepseek-chat";

const ENV_PREFIX: &str = "AGENTRELAY_";

/// Runtime configuration for the relay service. Defaults match the desktop
/// deployment; every field can be overridden through `AGENTRELAY_*`
/// environment variables or CLI flags.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub service_name: String,
    pub service_version: String,
    pub protocol_version: String,
    pub agents_etag: String,
    pub max_concurrent_runs: u32,
    pub offline_mode: bool,
    /// Model identifier sent with every chat-completion call.
    pub model: String,
    /// Base URL used when the settings store has no override.
    pub api_base: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            service_name: "agentrelay".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: "1.0".to_string(),
            agents_etag: "bootstrap".to_string(),
            max_concurrent_runs: 1,
            offline_mode: false,
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl RelayConfig {
    /// Defaults with `AGENTRELAY_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env_string("HOST") {
            config.host = host;
        }
        if let Some(port) = env_string("PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid AGENTRELAY_PORT"),
            }
        }
        if let Some(model) = env_string("MODEL") {
            config.model = model;
        }
        if let Some(api_base) = env_string("API_BASE") {
            config.api_base = api_base;
        }
        if let Some(offline) = env_string("OFFLINE_MODE") {
            config.offline_mode = matches!(offline.as_str(), "1" | "true" | "yes");
        }
        config
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|value| !value.trim().is_empty())
}
