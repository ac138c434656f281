//! Plugin unit and compiled binary data model.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::verify::{FactorySpec, ModuleIr};

/// Per-unit position in the load state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// No work pending.
    Idle,
    /// Waiting in the open compilation batch.
    QueuedForCompile,
    /// Batch submitted to the compiler worker.
    Compiling,
    /// Compiled bytes under verification.
    Verifying,
    /// No usable binary produced; previous good version, if any, stays active.
    Failed,
    /// Latest compile failed but the last good binary was restored.
    RolledBack,
    /// Previous live instance being removed from the host.
    Unloading,
    /// New instance being constructed from the verified binary.
    Instantiating,
    /// Live in the host registry.
    Registered,
}

impl LoadState {
    /// Whether a load/reload request for a unit in this state is a no-op.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::QueuedForCompile | Self::Compiling | Self::Verifying | Self::Unloading | Self::Instantiating
        )
    }

    /// Whether the unit currently has a live instance in the host.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Registered | Self::RolledBack)
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::QueuedForCompile => "queued",
            Self::Compiling => "compiling",
            Self::Verifying => "verifying",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
            Self::Unloading => "unloading",
            Self::Instantiating => "instantiating",
            Self::Registered => "registered",
        };
        write!(f, "{text}")
    }
}

/// Text encoding of a cached source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceEncoding {
    /// Plain UTF-8 (no BOM).
    #[default]
    Utf8,
    /// UTF-8 with a byte-order mark.
    Utf8Bom,
    /// UTF-16 little-endian (BOM required).
    Utf16Le,
    /// UTF-16 big-endian (BOM required).
    Utf16Be,
}

/// One script source file representing a single pluggable extension.
///
/// Created on first reference by name and cached in the [`UnitRegistry`]
/// for the process lifetime; its compiled binary may be replaced or cleared
/// but the unit itself is never destroyed.
///
/// [`UnitRegistry`]: crate::registry::UnitRegistry
#[derive(Debug)]
pub struct PluginUnit {
    /// Stable plugin name (matches the file stem and the declared entry type)
    pub name: String,

    /// Directory containing the source file
    pub directory: PathBuf,

    /// Full path of the source file
    pub source_path: PathBuf,

    /// Cached source lines from the last successful read
    pub lines: Vec<String>,

    /// Encoding detected on the last read
    pub encoding: SourceEncoding,

    /// Names of plugins this unit requires
    pub requires: BTreeSet<String>,

    /// Names of shared libraries this unit references
    pub references: BTreeSet<String>,

    /// Include-file paths folded into the compile payload
    pub includes: BTreeSet<PathBuf>,

    /// Last failure diagnostic, retained for inspection
    pub last_error: Option<String>,

    /// Currently active compiled binary
    pub binary: Option<Arc<CompiledBinary>>,

    /// Last known-good binary, kept until a replacement is confirmed loaded
    pub last_good: Option<Arc<CompiledBinary>>,

    /// On-disk modification time seen on the last read
    pub last_modified: Option<SystemTime>,

    /// When the source was last successfully cached
    pub last_cached: Option<SystemTime>,

    /// When the unit last compiled successfully
    pub last_compiled: Option<SystemTime>,

    /// Whether the cached source is newer than the active binary
    pub compilation_needed: bool,

    /// Whether a load is currently in flight for this unit
    pub loading: bool,

    /// Whether an instance is currently registered with the host
    pub live: bool,

    /// Position in the load state machine
    pub state: LoadState,
}

impl PluginUnit {
    /// Create a unit for the given name and source path.
    pub fn new(name: impl Into<String>, source_path: PathBuf) -> Self {
        let directory = source_path.parent().map(PathBuf::from).unwrap_or_default();
        Self {
            name: name.into(),
            directory,
            source_path,
            lines: Vec::new(),
            encoding: SourceEncoding::default(),
            requires: BTreeSet::new(),
            references: BTreeSet::new(),
            includes: BTreeSet::new(),
            last_error: None,
            binary: None,
            last_good: None,
            last_modified: None,
            last_cached: None,
            last_compiled: None,
            compilation_needed: true,
            loading: false,
            live: false,
            state: LoadState::Idle,
        }
    }

    /// File name of the source file (for diagnostic attribution).
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Full cached source text.
    pub fn source_text(&self) -> String {
        self.lines.join("\n")
    }

    /// Whether the cached binary can satisfy a dependency without recompiling.
    pub fn has_current_binary(&self) -> bool {
        self.binary.is_some() && !self.compilation_needed
    }

    /// Record a failure diagnostic and enter the `Failed` state.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.state = LoadState::Failed;
        self.loading = false;
    }

    /// Install a freshly verified binary, demoting the previous one to
    /// last-known-good.
    pub fn install_binary(&mut self, binary: Arc<CompiledBinary>) {
        if let Some(previous) = self.binary.take() {
            self.last_good = Some(previous);
        }
        self.binary = Some(binary);
        self.last_compiled = Some(SystemTime::now());
        self.compilation_needed = false;
        self.last_error = None;
    }

    /// Restore the last known-good binary after a failed replacement.
    ///
    /// Returns the restored binary, or `None` when the unit has never
    /// compiled successfully.
    pub fn restore_last_good(&mut self) -> Option<Arc<CompiledBinary>> {
        if self.binary.is_some() {
            return self.binary.clone();
        }
        let restored = self.last_good.clone()?;
        self.binary = Some(restored.clone());
        Some(restored)
    }
}

/// The build output of one compilation batch, before and after sandboxing
/// verification.
///
/// Superseded, not mutated, by the next successful compile of the same unit.
#[derive(Debug)]
pub struct CompiledBinary {
    /// Generated output name (one per batch)
    pub name: String,

    /// Names of the plugins compiled into this binary
    pub plugin_names: Vec<String>,

    /// Raw bytes as produced by the compiler worker
    pub raw: Vec<u8>,

    /// Bytes after the verifier's patch pass
    pub patched: Vec<u8>,

    /// SHA-256 digest of the patched bytes (stable identity per version)
    pub digest: String,

    /// How long the compiler invocation took
    pub duration: Duration,

    /// Decoded module, present once loaded
    pub module: Option<ModuleIr>,

    /// Constructor table published by the verifier, looked up by plugin name
    pub factories: Vec<FactorySpec>,

    /// Whether a load is currently in flight for this binary
    pub loading: bool,

    /// Whether this binary covers more than one plugin
    pub batched: bool,
}

impl CompiledBinary {
    /// Find the published constructor for a plugin name.
    pub fn factory(&self, plugin: &str) -> Option<&FactorySpec> {
        self.factories.iter().find(|f| f.plugin.eq_ignore_ascii_case(plugin))
    }

    /// Whether this binary contains the named plugin.
    pub fn contains(&self, plugin: &str) -> bool {
        self.plugin_names.iter().any(|p| p.eq_ignore_ascii_case(plugin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_binary(digest: &str) -> Arc<CompiledBinary> {
        Arc::new(CompiledBinary {
            name: "batch_1".to_string(),
            plugin_names: vec!["Shop".to_string()],
            raw: Vec::new(),
            patched: Vec::new(),
            digest: digest.to_string(),
            duration: Duration::from_millis(10),
            module: None,
            factories: Vec::new(),
            loading: false,
            batched: false,
        })
    }

    #[test]
    fn test_install_demotes_previous() {
        let mut unit = PluginUnit::new("Shop", PathBuf::from("plugins/Shop.plg"));
        unit.install_binary(test_binary("v1"));
        assert!(unit.last_good.is_none());

        unit.install_binary(test_binary("v2"));
        assert_eq!(unit.binary.as_ref().unwrap().digest, "v2");
        assert_eq!(unit.last_good.as_ref().unwrap().digest, "v1");
        assert!(!unit.compilation_needed);
    }

    #[test]
    fn test_restore_last_good() {
        let mut unit = PluginUnit::new("Shop", PathBuf::from("plugins/Shop.plg"));
        assert!(unit.restore_last_good().is_none());

        unit.install_binary(test_binary("v1"));
        let active = unit.binary.take();
        unit.last_good = active;

        let restored = unit.restore_last_good().unwrap();
        assert_eq!(restored.digest, "v1");
        assert_eq!(unit.binary.as_ref().unwrap().digest, "v1");
    }

    #[test]
    fn test_busy_states_do_not_stack() {
        assert!(LoadState::Compiling.is_busy());
        assert!(LoadState::Verifying.is_busy());
        assert!(!LoadState::Registered.is_busy());
        assert!(LoadState::Registered.is_live());
        assert!(LoadState::RolledBack.is_live());
        assert!(!LoadState::Failed.is_live());
    }

    #[test]
    fn test_file_name() {
        let unit = PluginUnit::new("Shop", PathBuf::from("plugins/Shop.plg"));
        assert_eq!(unit.file_name(), "Shop.plg");
    }
}
