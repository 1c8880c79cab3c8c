//! On-disk settings for the relay: a single JSON document keyed by provider
//! name, holding the API credential and base-URL override.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

const SETTINGS_FILE: &str = "settings.json";
const PROVIDER_KEY: &str = "deepseek";

/// Resolved provider configuration after applying defaults.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    settings_dir: PathBuf,
    settings_file: PathBuf,
}

impl SettingsStore {
    /// Store rooted at the per-user data directory. The directory is created
    /// lazily on the first write.
    pub fn new() -> io::Result<Self> {
        let data_dir = dirs::data_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no user data directory available")
        })?;
        Ok(Self::with_dir(data_dir.join("agentrelay")))
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let settings_dir = dir.into();
        let settings_file = settings_dir.join(SETTINGS_FILE);
        Self {
            settings_dir,
            settings_file,
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_file
    }

    /// The configured API key, or `None` when absent or blank.
    pub fn api_key(&self) -> Option<String> {
        provider_field(&self.load(), "apiKey")
    }

    /// Provider credential and base URL, falling back to `default_base` when
    /// no base-URL override is stored.
    pub fn provider_settings(&self, default_base: &str) -> ProviderSettings {
        let data = self.load();
        ProviderSettings {
            api_key: provider_field(&data, "apiKey"),
            base_url: provider_field(&data, "baseUrl")
                .unwrap_or_else(|| default_base.to_string()),
        }
    }

    /// Replace the stored credential and base URL. Blank or absent values
    /// clear the corresponding field; last write wins.
    pub fn set_provider(&self, api_key: Option<&str>, base_url: Option<&str>) -> io::Result<()> {
        let mut data = self.load();
        let mut provider = match data.remove(PROVIDER_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        set_or_clear(&mut provider, "apiKey", api_key);
        set_or_clear(&mut provider, "baseUrl", base_url);

        if !provider.is_empty() {
            data.insert(PROVIDER_KEY.to_string(), Value::Object(provider));
        }
        self.save(&data)
    }

    fn load(&self) -> Map<String, Value> {
        let Ok(raw) = fs::read_to_string(&self.settings_file) else {
            return Map::new();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(
                    path = %self.settings_file.display(),
                    "settings file is not a JSON object, treating as empty"
                );
                Map::new()
            }
        }
    }

    fn save(&self, data: &Map<String, Value>) -> io::Result<()> {
        fs::create_dir_all(&self.settings_dir)?;
        let rendered = serde_json::to_string_pretty(data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(&self.settings_file, rendered)
    }
}

fn provider_field(data: &Map<String, Value>, field: &str) -> Option<String> {
    let value = data
        .get(PROVIDER_KEY)
        .and_then(Value::as_object)?
        .get(field)?
        .as_str()?
        .trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn set_or_clear(provider: &mut Map<String, Value>, field: &str, value: Option<&str>) {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => {
            provider.insert(field.to_string(), Value::String(value.to_string()));
        }
        None => {
            provider.remove(field);
        }
    }
}
