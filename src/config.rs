//! Configuration Module
//!
//! Handles application configuration loading, saving, and defaults.
//! Configuration is stored in TOML format under `~/.pass-cli/`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE: &str = "pass-cli.toml";
const APP_DIR_NAME: &str = ".pass-cli";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_vault_file")]
    pub default_vault: String,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Security settings governing key derivation and password policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Maximum failed unlock attempts before lockout (§4.5).
    #[serde(default = "default_max_attempts")]
    pub max_failed_attempts: u32,
    /// Minimum master password length (§4.5 policy check).
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    #[serde(default = "default_true")]
    pub require_uppercase: bool,
    #[serde(default = "default_true")]
    pub require_lowercase: bool,
    #[serde(default = "default_true")]
    pub require_numbers: bool,
    #[serde(default = "default_true")]
    pub require_symbols: bool,
    /// PBKDF2-HMAC-SHA256 iteration count for new vaults. Never allowed
    /// below [`crate::crypto::MIN_WRITE_ITERATIONS`] (§4.1).
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    /// Enable the OS keychain as an unlock shortcut, when available.
    #[serde(default = "default_true")]
    pub keychain_enabled: bool,
    /// Enable the tamper-evident audit log.
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

/// Backup retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub auto_backup: bool,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_vault_file() -> String {
    "vault.enc".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_min_password_length() -> usize {
    12
}
fn default_kdf_iterations() -> u32 {
    crate::crypto::MIN_WRITE_ITERATIONS
}
fn default_max_backups() -> usize {
    10
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { default_vault: default_vault_file(), enable_logging: true, log_level: default_log_level() }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_attempts(),
            min_password_length: default_min_password_length(),
            require_uppercase: true,
            require_lowercase: true,
            require_numbers: true,
            require_symbols: true,
            kdf_iterations: default_kdf_iterations(),
            keychain_enabled: true,
            audit_enabled: true,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { auto_backup: true, max_backups: default_max_backups() }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    pub fn load_from(path: PathBuf) -> Self {
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        log::info!("Configuration loaded from {:?}", path);
                        return config;
                    }
                    Err(e) => log::warn!("Failed to parse config file: {e}. Using defaults."),
                },
                Err(e) => log::warn!("Failed to read config file: {e}. Using defaults."),
            }
        } else {
            log::info!("No config file found. Using defaults.");
        }
        Self::default()
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(Self::config_path())
    }

    pub fn save_to(&self, path: PathBuf) -> Result<(), String> {
        let contents = toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {e}"))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| format!("failed to create config directory: {e}"))?;
        }
        fs::write(&path, contents).map_err(|e| format!("failed to write config file: {e}"))?;
        log::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Base application directory, `~/.pass-cli` by default.
    pub fn app_dir() -> PathBuf {
        dirs::home_dir().map(|home| home.join(APP_DIR_NAME)).unwrap_or_else(|| PathBuf::from(APP_DIR_NAME))
    }

    pub fn config_path() -> PathBuf {
        Self::app_dir().join(CONFIG_FILE)
    }

    /// Audit log path, overridable via `PASS_AUDIT_LOG` for test harnesses
    /// and alternate deployment layouts.
    pub fn audit_log_path() -> PathBuf {
        std::env::var("PASS_AUDIT_LOG").map(PathBuf::from).unwrap_or_else(|_| Self::app_dir().join("audit.log"))
    }

    /// Validate a master password against the fixed policy check (§4.5).
    /// This is the only strength check the vault core performs; broader
    /// scoring/entropy estimation is out of scope.
    pub fn validate_master_password(&self, password: &str) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if password.len() < self.security.min_password_length {
            errors.push(format!("password must be at least {} characters long", self.security.min_password_length));
        }
        if self.security.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            errors.push("password must contain at least one uppercase letter".to_string());
        }
        if self.security.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            errors.push("password must contain at least one lowercase letter".to_string());
        }
        if self.security.require_numbers && !password.chars().any(|c| c.is_numeric()) {
            errors.push("password must contain at least one number".to_string());
        }
        if self.security.require_symbols && !password.chars().any(is_policy_symbol) {
            errors.push("password must contain at least one symbol".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The KDF iteration count a write must use: the configured value,
    /// floored at [`crate::crypto::MIN_WRITE_ITERATIONS`] so a stale or
    /// tampered config file can never weaken new vaults (§4.1, §4.5).
    pub fn effective_kdf_iterations(&self) -> u32 {
        self.security.kdf_iterations.max(crate::crypto::MIN_WRITE_ITERATIONS)
    }
}

/// §4.5's fixed symbol ranges: U+0021..U+002F, U+003A..U+0040,
/// U+005B..U+0060, U+007B..U+007E. Deliberately narrower than
/// "not alphanumeric" so policy decisions don't depend on Unicode category
/// tables drifting between library versions.
fn is_policy_symbol(c: char) -> bool {
    matches!(c, '\u{0021}'..='\u{002F}' | '\u{003A}'..='\u{0040}' | '\u{005B}'..='\u{0060}' | '\u{007B}'..='\u{007E}')
}

static CONFIG: std::sync::OnceLock<std::sync::RwLock<Config>> = std::sync::OnceLock::new();

pub fn get_config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.get_or_init(|| std::sync::RwLock::new(Config::load())).read().expect("config lock poisoned")
}

pub fn get_config_mut() -> std::sync::RwLockWriteGuard<'static, Config> {
    CONFIG.get_or_init(|| std::sync::RwLock::new(Config::load())).write().expect("config lock poisoned")
}

pub fn reload_config() {
    let mut config = get_config_mut();
    *config = Config::load();
}

pub fn save_config() -> Result<(), String> {
    get_config().save()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_security_floor() {
        let config = Config::default();
        assert_eq!(config.security.min_password_length, 12);
        assert_eq!(config.security.kdf_iterations, crate::crypto::MIN_WRITE_ITERATIONS);
    }

    #[test]
    fn password_validation_rejects_weak_and_accepts_strong() {
        let config = Config::default();
        assert!(config.validate_master_password("short").is_err());
        assert!(config.validate_master_password("alllowercase123!").is_err());
        assert!(config.validate_master_password("ValidPassword123!").is_ok());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.security.kdf_iterations, parsed.security.kdf_iterations);
    }

    #[test]
    fn audit_log_path_respects_env_override() {
        std::env::set_var("PASS_AUDIT_LOG", "/tmp/pass-cli-test-audit.log");
        assert_eq!(Config::audit_log_path(), PathBuf::from("/tmp/pass-cli-test-audit.log"));
        std::env::remove_var("PASS_AUDIT_LOG");
    }
}
