//! Configuration management for the hotforge pipeline.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};

/// Pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Filesystem layout
    pub paths: PathsConfig,

    /// Compiler worker settings
    pub compiler: CompilerConfig,

    /// Verifier deny/allow lists
    pub security: SecurityConfig,

    /// Source watcher settings
    pub watch: WatchConfig,
}

/// Where plugin sources, shared libraries, and include files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory containing plugin source files
    pub plugin_dir: PathBuf,

    /// Directory containing referenced library files
    pub library_dir: PathBuf,

    /// Directory containing include files
    pub include_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            library_dir: PathBuf::from("libraries"),
            include_dir: PathBuf::from("include"),
        }
    }
}

/// Compiler worker process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Command used to start the worker process
    pub command: String,

    /// Arguments passed to the worker
    pub args: Vec<String>,

    /// Seconds to wait for the worker's Ready handshake
    pub ready_timeout_secs: u64,

    /// Seconds to wait for a compile reply before failing the batch
    pub compile_timeout_secs: u64,

    /// Seconds of quiet before the idle worker is shut down
    pub idle_shutdown_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: "hotforge-worker".to_string(),
            args: Vec::new(),
            ready_timeout_secs: 30,
            compile_timeout_secs: 60,
            idle_shutdown_secs: 60,
        }
    }
}

impl CompilerConfig {
    /// Compile reply timeout as a [`Duration`].
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    /// Ready handshake timeout as a [`Duration`].
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Idle shutdown period as a [`Duration`].
    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }
}

/// Verifier deny/allow lists.
///
/// A symbol is denied when it falls under one of `denied_namespaces` and
/// under none of the narrower `allowed_members`. The default lists are
/// policy data; hosts override them per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Namespace prefixes plugins may never touch
    pub denied_namespaces: Vec<String>,

    /// Sanctioned members inside otherwise denied namespaces
    pub allowed_members: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            denied_namespaces: vec![
                "sys.io".to_string(),
                "sys.net".to_string(),
                "sys.process".to_string(),
                "sys.reflect".to_string(),
                "sys.env".to_string(),
            ],
            allowed_members: vec![
                "sys.io.path.join".to_string(),
                "sys.io.path.basename".to_string(),
            ],
        }
    }
}

/// Source watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Plugin source file extension (without the dot)
    pub extension: String,

    /// Milliseconds to debounce rapid successive edits of one file
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { extension: "plg".to_string(), debounce_ms: 200 }
    }
}

impl WatchConfig {
    /// Debounce window as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl ForgeConfig {
    /// Get the default config file path (`~/.config/hotforge/hotforge.toml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("hotforge").join("hotforge.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> ForgeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ForgeError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| ForgeError::Config(e.to_string()))
    }

    /// Load configuration from the given path, falling back to defaults when
    /// the file does not exist.
    pub fn load_or_default(path: &std::path::Path) -> ForgeResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &std::path::Path) -> ForgeResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ForgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path of the source file for a plugin with the given name.
    pub fn source_path(&self, name: &str) -> PathBuf {
        self.paths.plugin_dir.join(format!("{name}.{}", self.watch.extension))
    }

    /// Path of a referenced library file by name.
    pub fn library_path(&self, name: &str) -> PathBuf {
        self.paths.library_dir.join(format!("{name}.lib"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ForgeConfig::default();
        assert_eq!(config.compiler.compile_timeout_secs, 60);
        assert_eq!(config.compiler.idle_shutdown_secs, 60);
        assert_eq!(config.watch.extension, "plg");
        assert!(!config.security.denied_namespaces.is_empty());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ForgeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ForgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.compiler.command, config.compiler.command);
        assert_eq!(parsed.paths.plugin_dir, config.paths.plugin_dir);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: ForgeConfig = toml::from_str("[compiler]\ncommand = \"mycc\"\n").unwrap();
        assert_eq!(parsed.compiler.command, "mycc");
        assert_eq!(parsed.compiler.compile_timeout_secs, 60);
        assert_eq!(parsed.watch.extension, "plg");
    }

    #[test]
    fn test_source_path() {
        let config = ForgeConfig::default();
        assert_eq!(config.source_path("Shop"), PathBuf::from("plugins/Shop.plg"));
        assert_eq!(config.library_path("geo"), PathBuf::from("libraries/geo.lib"));
    }
}
