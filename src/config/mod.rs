//! Settings loaded from `livesync.toml`.
//!
//! Everything lives under a `[livesync]` table. Missing keys fall back to defaults;
//! invalid values are a [`ConfigError`] and stop the process before any watching
//! starts.

mod error;

pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::device::{normalize_address, Device, TransportKind};
use crate::protocol::{CompressionLevel, CompressionType};
use crate::sync::throttle::BandwidthLimit;
use crate::watch::rules::{RuleSet, Scope, WatchRule, DEFAULT_IGNORE_PATTERNS};

pub const CONFIG_FILE_NAME: &str = "livesync.toml";

/// Files and folders never shipped as part of a full tree payload.
pub const DEFAULT_TREE_EXCLUDES: &[&str] = &[
    "*.pyc",
    "__pycache__",
    ".buildozer",
    ".venv",
    ".vscode",
    ".git",
    ".pytest_cache",
    ".DS_Store",
    ".env",
    ".mypy_cache",
    "env",
    "venv",
    "bin",
    "buildozer.spec",
    "temp",
    "tests",
    ".gitignore",
    "README.md",
];

/// What a FULL_RELOAD directive carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullReloadPayload {
    /// Only the files of the batch.
    #[default]
    Changed,
    /// Every non-excluded file under the root.
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    pub address: String,
}

fn default_transport() -> TransportKind {
    TransportKind::Usb
}

/// The target that runs on the development machine itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    pub enabled: bool,
    /// Copy directives into this directory instead of relying on the edited tree.
    pub mirror_root: Option<PathBuf>,
    pub hot_swap_command: Option<String>,
    pub restart_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub full_reload_files: Vec<String>,
    pub watched_files: Vec<String>,
    pub watched_folders: Vec<String>,
    pub watched_folders_recursively: Vec<String>,
    pub do_not_watch_patterns: Vec<String>,
    pub exclude_from_tree: Vec<String>,
    pub hot_reload_on_devices: bool,
    pub full_reload_payload: FullReloadPayload,
    pub debounce_ms: u64,
    pub reloader_port: i64,
    pub connect_timeout_ms: u64,
    pub cold_connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub compression: CompressionType,
    pub compression_level: u8,
    /// Bytes per second per connection; 0 means unlimited.
    pub bandwidth_limit: u64,
    pub devices: Vec<DeviceConfig>,
    pub local: LocalConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            full_reload_files: Vec::new(),
            watched_files: Vec::new(),
            watched_folders: Vec::new(),
            watched_folders_recursively: Vec::new(),
            do_not_watch_patterns: DEFAULT_IGNORE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            exclude_from_tree: DEFAULT_TREE_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            hot_reload_on_devices: true,
            full_reload_payload: FullReloadPayload::Changed,
            debounce_ms: 300,
            reloader_port: 8050,
            connect_timeout_ms: 1000,
            cold_connect_timeout_ms: 250,
            ack_timeout_ms: 3000,
            compression: CompressionType::None,
            compression_level: CompressionLevel::default().value(),
            bandwidth_limit: 0,
            devices: Vec::new(),
            local: LocalConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    livesync: Settings,
}

impl Settings {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn cold_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cold_connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Only meaningful after validation.
    pub fn port(&self) -> u16 {
        u16::try_from(self.reloader_port).unwrap_or(8050)
    }

    pub fn compression_level(&self) -> CompressionLevel {
        CompressionLevel::new(self.compression_level)
    }

    pub fn bandwidth(&self) -> BandwidthLimit {
        BandwidthLimit::new(self.bandwidth_limit)
    }

    /// Rules in evaluation order: full reload files, watched files, then folders.
    pub fn watch_rules(&self) -> Vec<WatchRule> {
        let full = self.full_reload_files.iter().map(WatchRule::full_reload);
        let files = self.watched_files.iter().map(WatchRule::hot_file);
        let folders = self
            .watched_folders
            .iter()
            .map(|f| WatchRule::hot_folder(f.as_str(), Scope::NonRecursive));
        let recursive = self
            .watched_folders_recursively
            .iter()
            .map(|f| WatchRule::hot_folder(f.as_str(), Scope::Recursive));
        full.chain(files).chain(folders).chain(recursive).collect()
    }

    pub fn rule_set(&self, root: &Path) -> Result<RuleSet, ConfigError> {
        RuleSet::new(root, self.watch_rules(), &self.do_not_watch_patterns)
    }

    /// Devices with addresses normalized to `host:port`.
    pub fn device_list(&self) -> Result<Vec<Device>, ConfigError> {
        let port = self.port();
        self.devices
            .iter()
            .map(|d| {
                let address = normalize_address(&d.address, port).ok_or_else(|| ConfigError::InvalidAddress {
                    id: d.id.clone(),
                    address: d.address.clone(),
                })?;
                Ok(Device::new(d.id.trim(), d.transport, address))
            })
            .collect()
    }

    pub fn validate(&self, root: &Path) -> Result<(), ConfigError> {
        let lists: [(&'static str, &Vec<String>); 6] = [
            ("full_reload_files", &self.full_reload_files),
            ("watched_files", &self.watched_files),
            ("watched_folders", &self.watched_folders),
            ("watched_folders_recursively", &self.watched_folders_recursively),
            ("do_not_watch_patterns", &self.do_not_watch_patterns),
            ("exclude_from_tree", &self.exclude_from_tree),
        ];
        for (field, entries) in lists {
            if entries.iter().any(|e| e.trim().is_empty()) {
                return Err(ConfigError::EmptyEntry { field });
            }
        }

        validate_files("full_reload_files", &self.full_reload_files, root)?;
        validate_files("watched_files", &self.watched_files, root)?;

        if !(1..=65535).contains(&self.reloader_port) {
            return Err(ConfigError::InvalidPort {
                field: "reloader_port",
                port: self.reloader_port,
            });
        }

        let positive = [
            ("debounce_ms", self.debounce_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("cold_connect_timeout_ms", self.cold_connect_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if !(1..=9).contains(&self.compression_level) {
            return Err(ConfigError::InvalidValue {
                field: "compression_level",
                reason: format!("{} is outside 1-9", self.compression_level),
            });
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            let id = device.id.trim();
            if id.is_empty() {
                return Err(ConfigError::EmptyEntry { field: "devices.id" });
            }
            if !seen.insert(id.to_string()) {
                return Err(ConfigError::DuplicateDevice { id: id.to_string() });
            }
        }
        self.device_list()?;

        self.rule_set(root)?;
        crate::sync::exclude::ExcludePatterns::from_patterns(&self.exclude_from_tree)?;

        Ok(())
    }
}

fn validate_files(field: &'static str, entries: &[String], root: &Path) -> Result<(), ConfigError> {
    for entry in entries {
        if entry.contains(['*', '?', '[', '{']) {
            continue;
        }
        let path = root.join(entry);
        if !path.exists() {
            return Err(ConfigError::MissingPath {
                field,
                path: PathBuf::from(entry),
            });
        }
        if path.is_dir() {
            return Err(ConfigError::NotAFile {
                field,
                path: PathBuf::from(entry),
            });
        }
    }
    Ok(())
}

/// A loaded and validated configuration bound to its project root.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: Option<PathBuf>,
    pub root: PathBuf,
    pub settings: Settings,
}

impl Config {
    /// Find the config file: an explicit path, `./livesync.toml`, then the user
    /// config directory.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(ConfigError::NotFound { path: path.to_path_buf() })
            };
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Ok(local);
        }

        if let Some(dir) = dirs::config_dir() {
            let global = dir.join("livesync").join(CONFIG_FILE_NAME);
            if global.is_file() {
                return Ok(global);
            }
        }

        Err(ConfigError::NotFound { path: local })
    }

    /// Load and validate. The project root is the directory holding the config
    /// file, except for the user-level file where it is the working directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::locate(explicit)?;
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let is_global = dirs::config_dir().is_some_and(|dir| path.starts_with(dir));
        let root = match path.parent() {
            Some(parent) if !is_global && !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir().map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?,
        };

        let mut config = Self::from_toml(&text, &root).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        config.path = Some(path);
        debug!(root = %config.root.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(text: &str, root: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(CONFIG_FILE_NAME),
            source,
        })?;
        Self::new(root, file.livesync)
    }

    pub fn new(root: &Path, settings: Settings) -> Result<Self, ConfigError> {
        let root = std::path::absolute(root).map_err(|source| ConfigError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        settings.validate(&root)?;
        Ok(Self {
            path: None,
            root,
            settings,
        })
    }

    pub fn rule_set(&self) -> Result<RuleSet, ConfigError> {
        self.settings.rule_set(&self.root)
    }

    /// Where the local target writes, if it writes anywhere.
    pub fn local_mirror(&self) -> Option<PathBuf> {
        self.settings.local.mirror_root.as_ref().map(|p| self.root.join(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "print('hi')").unwrap();
        fs::create_dir(dir.path().join("screens")).unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let dir = project();
        let config = Config::from_toml("", dir.path()).unwrap();
        let settings = &config.settings;

        assert_eq!(settings.debounce_window(), Duration::from_millis(300));
        assert_eq!(settings.port(), 8050);
        assert_eq!(settings.ack_timeout(), Duration::from_secs(3));
        assert_eq!(settings.full_reload_payload, FullReloadPayload::Changed);
        assert!(settings.hot_reload_on_devices);
        assert!(settings.exclude_from_tree.contains(&".git".to_string()));
        assert!(!settings.bandwidth().is_limited());
    }

    #[test]
    fn test_full_example() {
        let dir = project();
        let text = r#"
[livesync]
full_reload_files = ["main.py"]
watched_folders_recursively = ["screens"]
full_reload_payload = "tree"
compression = "zstd"
compression_level = 5
debounce_ms = 150

[[livesync.devices]]
id = "pixel"
transport = "USB"
address = "127.0.0.1"

[[livesync.devices]]
id = "tablet"
transport = "NETWORK"
address = "192.168.1.20:9000"

[livesync.local]
enabled = true
restart_command = "echo restart"
"#;
        let config = Config::from_toml(text, dir.path()).unwrap();
        let devices = config.settings.device_list().unwrap();

        assert_eq!(devices[0].address, "127.0.0.1:8050");
        assert_eq!(devices[1].transport, TransportKind::Network);
        assert_eq!(devices[1].address, "192.168.1.20:9000");
        assert_eq!(config.settings.compression, CompressionType::Zstd);
        assert_eq!(config.settings.full_reload_payload, FullReloadPayload::Tree);
        assert!(config.settings.local.enabled);

        let rules = config.rule_set().unwrap();
        assert_eq!(rules.rules().count(), 2);
        assert_eq!(
            rules.classify(Path::new("screens/home.kv")),
            crate::watch::Classification::HotReload
        );
    }

    #[test]
    fn test_missing_file_entry() {
        let dir = project();
        let text = "[livesync]\nfull_reload_files = [\"gone.py\"]\n";
        let result = Config::from_toml(text, dir.path());
        assert!(matches!(result, Err(ConfigError::MissingPath { field: "full_reload_files", .. })));
    }

    #[test]
    fn test_directory_in_file_list() {
        let dir = project();
        let text = "[livesync]\nwatched_files = [\"screens\"]\n";
        let result = Config::from_toml(text, dir.path());
        assert!(matches!(result, Err(ConfigError::NotAFile { .. })));
    }

    #[test]
    fn test_empty_entry() {
        let dir = project();
        let text = "[livesync]\nwatched_folders = [\"  \"]\n";
        let result = Config::from_toml(text, dir.path());
        assert!(matches!(result, Err(ConfigError::EmptyEntry { field: "watched_folders" })));
    }

    #[test]
    fn test_invalid_port() {
        let dir = project();
        let result = Config::from_toml("[livesync]\nreloader_port = 70000\n", dir.path());
        assert!(matches!(result, Err(ConfigError::InvalidPort { port: 70000, .. })));
    }

    #[test]
    fn test_zero_debounce() {
        let dir = project();
        let result = Config::from_toml("[livesync]\ndebounce_ms = 0\n", dir.path());
        assert!(matches!(result, Err(ConfigError::InvalidValue { field: "debounce_ms", .. })));
    }

    #[test]
    fn test_duplicate_devices() {
        let dir = project();
        let text = r#"
[[livesync.devices]]
id = "pixel"
address = "10.0.0.2"

[[livesync.devices]]
id = "pixel"
address = "10.0.0.3"
"#;
        let result = Config::from_toml(text, dir.path());
        assert!(matches!(result, Err(ConfigError::DuplicateDevice { .. })));
    }

    #[test]
    fn test_bad_address() {
        let dir = project();
        let text = "[[livesync.devices]]\nid = \"pixel\"\naddress = \"10.0.0.2:port\"\n";
        let result = Config::from_toml(text, dir.path());
        assert!(matches!(result, Err(ConfigError::InvalidAddress { .. })));
    }

    #[test]
    fn test_invalid_glob() {
        let dir = project();
        let text = "[livesync]\ndo_not_watch_patterns = [\"[oops\"]\n";
        let result = Config::from_toml(text, dir.path());
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_parse_error_and_unknown_keys() {
        let dir = project();
        assert!(matches!(
            Config::from_toml("[livesync\n", dir.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            Config::from_toml("[livesync]\nwatch_everything = true\n", dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = project();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[livesync]\nfull_reload_files = [\"main.py\"]\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.root, dir.path());
        assert_eq!(config.path.as_deref(), Some(path.as_path()));

        let missing = Config::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(missing, Err(ConfigError::NotFound { .. })));
    }
}
