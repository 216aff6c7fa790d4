//! Configuration management for atelier
//!
//! Stores settings in ~/.config/atelier/config.json. Environment variables
//! override the file on load, so deployments can tune the gateway without
//! touching disk. Credentials are never written to the config file; they are
//! resolved from the environment on demand.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use url::Url;

/// Placeholder credential prefix that must never be treated as configured.
const PLACEHOLDER_KEY_PREFIX: &str = "sk-placeholder";

fn debug_stderr_enabled() -> bool {
    std::env::var("ATELIER_DEBUG").map(|v| v == "1" || v == "true").unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Outbound call budget per rolling 60-second window.
    pub requests_per_minute: u32,
    /// Maximum simultaneous in-flight calls.
    pub max_concurrent: u32,
    /// Minimum spacing between consecutive grants, in milliseconds.
    pub min_interval_ms: u64,
    /// How long a caller waits for admission before giving up.
    pub acquire_timeout_ms: u64,
    /// Transport-level retry attempts per call.
    pub max_attempts: u32,
    /// Content-level attempts in the compliance-gated loop.
    pub max_compliance_attempts: u32,
    /// Repair rounds per job before the caller should stop.
    pub max_repair_rounds: u32,
    /// Preferred provider name; empty means "first available".
    pub preferred_provider: Option<String>,
    /// Override for the AI-gateway chat-completions URL.
    pub gateway_base_url: Option<String>,
    /// Override for the gateway's default model.
    pub gateway_model: Option<String>,
    /// Override for the direct OpenAI-compatible endpoint URL.
    pub openai_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            max_concurrent: 3,
            min_interval_ms: 2000,
            acquire_timeout_ms: 300_000,
            max_attempts: 3,
            max_compliance_attempts: 3,
            max_repair_rounds: 3,
            preferred_provider: None,
            gateway_base_url: None,
            gateway_model: None,
            openai_base_url: None,
        }
    }
}

impl Config {
    /// Clamp nonsense values and drop unparseable URLs.
    fn sanitize(&mut self) {
        self.requests_per_minute = self.requests_per_minute.max(1);
        self.max_concurrent = self.max_concurrent.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.max_compliance_attempts = self.max_compliance_attempts.max(1);
        self.max_repair_rounds = self.max_repair_rounds.max(1);
        if self.acquire_timeout_ms == 0 {
            self.acquire_timeout_ms = Config::default().acquire_timeout_ms;
        }
        for slot in [&mut self.gateway_base_url, &mut self.openai_base_url] {
            if let Some(raw) = slot.as_deref() {
                if Url::parse(raw).is_err() {
                    if debug_stderr_enabled() {
                        eprintln!("  Warning: ignoring invalid base URL: {}", raw);
                    }
                    *slot = None;
                }
            }
        }
        if let Some(name) = &self.preferred_provider {
            if name.trim().is_empty() {
                self.preferred_provider = None;
            }
        }
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("atelier"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, apply environment overrides, or return default.
    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.apply_env_overrides();
        config.sanitize();
        config
    }

    fn load_file() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str::<Config>(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        if debug_stderr_enabled() {
                            eprintln!(
                                "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                                err
                            );
                        }
                    }
                }
            }
        }
        Self::default()
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u32>("ATELIER_RATE_LIMIT_RPM") {
            self.requests_per_minute = v;
        }
        if let Some(v) = env_parse::<u32>("ATELIER_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = env_parse::<u64>("ATELIER_MIN_INTERVAL_MS") {
            self.min_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("ATELIER_ACQUIRE_TIMEOUT_MS") {
            self.acquire_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u32>("ATELIER_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse::<u32>("ATELIER_MAX_COMPLIANCE_ATTEMPTS") {
            self.max_compliance_attempts = v;
        }
        if let Some(v) = env_parse::<u32>("ATELIER_MAX_REPAIR_ROUNDS") {
            self.max_repair_rounds = v;
        }
        if let Ok(v) = std::env::var("ATELIER_PROVIDER") {
            if !v.trim().is_empty() {
                self.preferred_provider = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("AIGATEWAY_BASE_URL") {
            if !v.trim().is_empty() {
                self.gateway_base_url = Some(v.trim().trim_end_matches('/').to_string());
            }
        }
        if let Ok(v) = std::env::var("AIGATEWAY_MODEL") {
            if !v.trim().is_empty() {
                self.gateway_model = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL") {
            if !v.trim().is_empty() {
                self.openai_base_url = Some(v.trim().trim_end_matches('/').to_string());
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let mut sanitized = self.clone();
        sanitized.sanitize();
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                if debug_stderr_enabled() {
                    eprintln!("  Warning: Failed to set config directory permissions: {}", e);
                }
            }
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(&sanitized)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(&path, &content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    /// AI-gateway token from the environment.
    pub fn gateway_token(&self) -> Option<String> {
        credential_from_env(&["AIGATEWAY_TOKEN"])
    }

    /// OpenRouter API key from the environment.
    pub fn openrouter_api_key(&self) -> Option<String> {
        credential_from_env(&["OPENROUTER_API_KEY"])
    }

    /// Direct OpenAI-compatible endpoint key from the environment.
    pub fn openai_api_key(&self) -> Option<String> {
        credential_from_env(&["OPENAI_API_KEY", "OPENAI_API_TOKEN"])
    }

    /// Whether any provider credential is configured at all.
    pub fn has_any_credential(&self) -> bool {
        self.gateway_token().is_some()
            || self.openrouter_api_key().is_some()
            || self.openai_api_key().is_some()
    }

    /// Check a credential value for shape problems (blank, placeholder).
    pub fn credential_is_usable(key: &str) -> bool {
        let key = key.trim();
        !key.is_empty() && !key.starts_with(PLACEHOLDER_KEY_PREFIX)
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no config directory)".to_string())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn credential_from_env(names: &[&str]) -> Option<String> {
    for name in names {
        if let Ok(value) = std::env::var(name) {
            if Config::credential_is_usable(&value) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Keep a copy of a corrupt config next to the original before replacing it.
fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let backup = path.with_extension("json.corrupt");
    let _ = fs::write(backup, content);
}

#[cfg(unix)]
fn write_config_atomic(path: &std::path::Path, content: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
