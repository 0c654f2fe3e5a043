//! Startup settings.
//!
//! Read once: a TOML file, then `DASAS_*` environment overrides, then
//! validation. Nothing is reloaded while the engine runs.

use anyhow::{Context, Result};
use dasas_cluster::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File read when `--config` is not given, if it exists
pub const DEFAULT_CONFIG_FILE: &str = "dasas.toml";

/// Where durable state lives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// redb database file; in-memory only when unset
    pub path: Option<PathBuf>,
}

/// Log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "dasas=info".to_string(),
            json: false,
        }
    }
}

/// Everything the binary reads at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Engine tuning, including new-cluster defaults
    pub engine: EngineConfig,
    /// Durable store location
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render settings")
    }
}

/// Load settings from `path`, or from [`DEFAULT_CONFIG_FILE`] if present,
/// then apply the process environment.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => read_file(path)?,
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.exists() {
                read_file(fallback)?
            } else {
                Settings::default()
            }
        }
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
        .engine
        .validate()
        .context("invalid engine configuration")?;
    Ok(settings)
}

fn read_file(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Apply `DASAS_*` overrides looked up through `var`. Unparseable values
/// are ignored with a warning.
pub fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    let value = |key: &str| {
        var(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(path) = value("DASAS_DB_PATH") {
        settings.storage.path = Some(PathBuf::from(path));
    }
    if let Some(level) = value("DASAS_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(raw) = value("DASAS_LOG_JSON") {
        match raw.parse::<bool>() {
            Ok(json) => settings.logging.json = json,
            Err(err) => tracing::warn!("invalid DASAS_LOG_JSON, ignoring: {err}"),
        }
    }
    if let Some(raw) = value("DASAS_ELECTION_TIMEOUT_MS") {
        match raw.parse::<u64>() {
            Ok(ms) => settings.engine.cluster_defaults.election_timeout_ms = ms,
            Err(err) => tracing::warn!("invalid DASAS_ELECTION_TIMEOUT_MS, ignoring: {err}"),
        }
    }
    if let Some(raw) = value("DASAS_FAULT_TOLERANCE") {
        match raw.parse::<usize>() {
            Ok(f) => settings.engine.agreement.fault_tolerance = f,
            Err(err) => tracing::warn!("invalid DASAS_FAULT_TOLERANCE, ignoring: {err}"),
        }
    }
    if let Some(raw) = value("DASAS_QUORUM_SIZE") {
        match raw.parse::<usize>() {
            Ok(quorum) => settings.engine.agreement.quorum_size = Some(quorum),
            Err(err) => tracing::warn!("invalid DASAS_QUORUM_SIZE, ignoring: {err}"),
        }
    }
    if let Some(raw) = value("DASAS_HISTORY_LIMIT") {
        match raw.parse::<usize>() {
            Ok(limit) => settings.engine.history_limit = limit,
            Err(err) => tracing::warn!("invalid DASAS_HISTORY_LIMIT, ignoring: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[engine.agreement]
fault_tolerance = 2

[engine.cluster_defaults]
election_timeout_ms = 750

[storage]
path = "/var/lib/dasas/state.redb"
"#
        )
        .unwrap();

        let settings = read_file(file.path()).unwrap();
        assert_eq!(settings.engine.agreement.fault_tolerance, 2);
        assert_eq!(settings.engine.agreement.agreement_timeout_ms, 10_000);
        assert_eq!(settings.engine.cluster_defaults.election_timeout_ms, 750);
        assert_eq!(settings.engine.cluster_defaults.heartbeat_interval_ms, 1_000);
        assert_eq!(
            settings.storage.path.as_deref(),
            Some(Path::new("/var/lib/dasas/state.redb"))
        );
        assert_eq!(settings.logging, LoggingSettings::default());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("DASAS_DB_PATH", "/tmp/x.redb"),
                ("DASAS_LOG_LEVEL", "dasas=debug"),
                ("DASAS_ELECTION_TIMEOUT_MS", " 1200 "),
                ("DASAS_FAULT_TOLERANCE", "0"),
                ("DASAS_QUORUM_SIZE", "2"),
                ("DASAS_HISTORY_LIMIT", "500"),
            ]),
        );
        assert_eq!(settings.storage.path, Some(PathBuf::from("/tmp/x.redb")));
        assert_eq!(settings.logging.level, "dasas=debug");
        assert_eq!(settings.engine.cluster_defaults.election_timeout_ms, 1_200);
        assert_eq!(settings.engine.agreement.fault_tolerance, 0);
        assert_eq!(settings.engine.agreement.quorum_size, Some(2));
        assert_eq!(settings.engine.history_limit, 500);
    }

    #[test]
    fn test_bad_override_is_ignored() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("DASAS_FAULT_TOLERANCE", "many"),
                ("DASAS_LOG_JSON", ""),
                ("DASAS_HISTORY_LIMIT", "-1"),
            ]),
        );
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine.health]\nsoft_timeout_ms = 5000\nhard_timeout_ms = 1000"
        )
        .unwrap();
        let err = load(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("hard_timeout_ms"));
    }

    #[test]
    fn test_rendered_settings_parse_back() {
        let mut settings = Settings::default();
        settings.engine.agreement.quorum_size = Some(3);
        settings.logging.json = true;
        let rendered = settings.to_toml().unwrap();
        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, settings);
    }
}
