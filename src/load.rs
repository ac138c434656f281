//! Load orchestration.
//!
//! The load manager drives each plugin unit through the full pipeline:
//! source refresh, batch resolution, external compilation, verification,
//! and the unload/instantiate/register swap against the host. Requests that
//! arrive while a batch is still open join it; requests for units already
//! in flight are ignored. A failed replacement never takes down a running
//! instance: the previous version stays live and the unit lands in the
//! rolled-back state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::compiler::{
    attribute_diagnostics, CompileJob, CompilePayload, CompilerSession, ReferenceFile,
    SessionConfig, SourceFile,
};
use crate::config::ForgeConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::registry::{UnitHandle, UnitRegistry};
use crate::resolve::{BatchMember, ResolvedBatch, Resolver};
use crate::source::SourceCache;
use crate::unit::{CompiledBinary, LoadState};
use crate::verify::{FactorySpec, Verifier};
use crate::watch::SourceEvent;

/// How long the first request keeps a batch open for others to join.
const BATCH_WINDOW: Duration = Duration::from_millis(50);

/// A verified plugin instance handed to the host for registration.
///
/// The host constructs the instance through the published factory; there is
/// no type scanning on the host side.
#[derive(Debug, Clone)]
pub struct PluginHandle {
    /// Plugin name
    pub name: String,
    /// The verified binary backing the instance
    pub binary: Arc<CompiledBinary>,
    /// Constructor to instantiate
    pub factory: FactorySpec,
}

/// The surface the pipeline needs from its embedding host.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Remove the named plugin's live instance.
    async fn unload(&self, name: &str);

    /// Construct and register a new instance. An `Err` leaves the host
    /// without an instance for this plugin.
    async fn register(&self, handle: PluginHandle) -> Result<(), String>;

    /// Notification that a compile attempt finished, successfully or not.
    async fn on_compile_finished(&self, name: &str, success: bool);
}

struct OpenBatch {
    names: Vec<String>,
    done: watch::Sender<bool>,
}

/// Owns the pipeline components and runs load batches.
pub struct LoadManager {
    registry: UnitRegistry,
    cache: SourceCache,
    config: ForgeConfig,
    session: CompilerSession,
    verifier: Verifier,
    host: Arc<dyn PluginHost>,
    next_batch: AtomicU64,
    open_batch: AsyncMutex<Option<OpenBatch>>,
}

impl LoadManager {
    /// Build a manager over the given configuration and host.
    pub fn new(config: ForgeConfig, host: Arc<dyn PluginHost>) -> Arc<Self> {
        let session = CompilerSession::spawn(SessionConfig::from(&config.compiler));
        let verifier = Verifier::new(&config.security);
        Arc::new(Self {
            registry: UnitRegistry::new(),
            cache: SourceCache::new(),
            config,
            session,
            verifier,
            host,
            next_batch: AtomicU64::new(0),
            open_batch: AsyncMutex::new(None),
        })
    }

    /// The unit registry backing this manager.
    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Load or reload one plugin.
    pub async fn load(self: &Arc<Self>, name: &str) -> ForgeResult<()> {
        self.load_many(vec![name.to_string()]).await
    }

    /// Force a recompile of one plugin even if its source is unchanged.
    pub async fn reload(self: &Arc<Self>, name: &str) -> ForgeResult<()> {
        if let Some(handle) = self.registry.get(name) {
            handle.lock().compilation_needed = true;
        }
        self.load(name).await
    }

    /// Load every plugin source found in the configured plugin directory.
    /// Returns the names that were discovered, sorted.
    pub async fn load_all(self: &Arc<Self>) -> ForgeResult<Vec<String>> {
        let dir = &self.config.paths.plugin_dir;
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            ForgeError::Io(format!("failed to read plugin directory '{}': {e}", dir.display()))
        })?;

        let mut names = Vec::new();
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| ForgeError::Io(e.to_string()))?
        {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(&self.config.watch.extension))
                .unwrap_or(false);
            if matches {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        self.load_many(names.clone()).await?;
        Ok(names)
    }

    /// Load a set of plugins as one request. Units already in flight are
    /// skipped; units registered and up to date are no-ops.
    pub async fn load_many(self: &Arc<Self>, names: Vec<String>) -> ForgeResult<()> {
        let mut accepted: Vec<String> = Vec::new();
        for name in names {
            if accepted.iter().any(|a| a.eq_ignore_ascii_case(&name)) {
                continue;
            }
            if !self.admit(&name).await {
                continue;
            }
            let handle = self.registry.get_or_create(&name, self.config.source_path(&name));
            {
                let mut unit = handle.lock();
                unit.state = LoadState::QueuedForCompile;
                unit.loading = true;
            }
            accepted.push(name);
        }
        if accepted.is_empty() {
            return Ok(());
        }

        // Either open a new batch or join the one already collecting.
        let joined = {
            let mut open = self.open_batch.lock().await;
            match open.as_mut() {
                Some(batch) => {
                    for name in accepted {
                        if !batch.names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                            batch.names.push(name);
                        }
                    }
                    Some(batch.done.subscribe())
                }
                None => {
                    let (done, _) = watch::channel(false);
                    *open = Some(OpenBatch { names: accepted, done });
                    None
                }
            }
        };

        match joined {
            Some(mut rx) => {
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            None => {
                tokio::time::sleep(BATCH_WINDOW).await;
                let batch = self
                    .open_batch
                    .lock()
                    .await
                    .take()
                    .ok_or_else(|| ForgeError::Infrastructure("open batch vanished".to_string()))?;
                let id = self.next_batch.fetch_add(1, Ordering::SeqCst) + 1;
                self.run_batch(id, batch.names).await;
                let _ = batch.done.send(true);
                Ok(())
            }
        }
    }

    /// Unload a plugin and, first, every live plugin that depends on it.
    pub async fn unload(&self, name: &str) -> ForgeResult<()> {
        let root = self
            .registry
            .get(name)
            .ok_or_else(|| ForgeError::UnknownPlugin(name.to_string()))?;

        // Breadth-first over dependents; unload in reverse so dependents come
        // out before the plugin they depend on.
        let mut order: Vec<UnitHandle> = vec![root];
        let mut seen: HashSet<String> = HashSet::from([name.to_ascii_lowercase()]);
        let mut cursor = 0;
        while cursor < order.len() {
            let current = order[cursor].lock().name.clone();
            for dependent in self.registry.dependents_of(&current) {
                let key = dependent.lock().name.to_ascii_lowercase();
                if seen.insert(key) {
                    order.push(dependent);
                }
            }
            cursor += 1;
        }

        for handle in order.iter().rev() {
            let (unit_name, live) = {
                let mut unit = handle.lock();
                let live = unit.state.is_live();
                if live {
                    unit.state = LoadState::Unloading;
                }
                (unit.name.clone(), live)
            };
            if !live {
                continue;
            }
            self.host.unload(&unit_name).await;
            {
                let mut unit = handle.lock();
                unit.live = false;
                unit.loading = false;
                unit.state = LoadState::Idle;
            }
            info!(unit = %unit_name, "plugin unloaded");
        }
        Ok(())
    }

    /// React to a filesystem event from the source watcher.
    pub async fn handle_event(self: &Arc<Self>, event: SourceEvent) {
        match event {
            SourceEvent::Added(name) | SourceEvent::Changed(name) => {
                if let Err(e) = self.load(&name).await {
                    warn!(unit = %name, "load after file event failed: {e}");
                }
            }
            SourceEvent::Removed(name) => {
                if self.registry.get(&name).is_some() {
                    if let Err(e) = self.unload(&name).await {
                        warn!(unit = %name, "unload after file removal failed: {e}");
                    }
                }
            }
        }
    }

    async fn admit(&self, name: &str) -> bool {
        let Some(handle) = self.registry.get(name) else {
            return true;
        };
        let state = handle.lock().state;
        if state.is_busy() {
            debug!(unit = name, %state, "load already in flight, ignoring request");
            return false;
        }
        if state == LoadState::Registered && self.cache.refresh(&handle).await.is_ok() {
            let unit = handle.lock();
            if !unit.compilation_needed {
                debug!(unit = %unit.name, "registered and up to date, nothing to do");
                return false;
            }
        }
        true
    }

    async fn run_batch(self: &Arc<Self>, id: u64, names: Vec<String>) {
        info!(batch = id, units = ?names, "starting load batch");

        let resolver = Resolver::new(&self.registry, &self.cache, &self.config);
        let batch = resolver.resolve(id, names).await;

        for failure in &batch.failures {
            match failure.unit() {
                Some(unit) => {
                    let unit = unit.to_string();
                    self.fail_unit(&unit, failure).await;
                }
                None => warn!(batch = id, "resolution failure: {failure}"),
            }
        }

        if batch.members.is_empty() {
            return;
        }

        let member_names = batch.member_names();
        for member in &batch.members {
            member.handle.lock().state = LoadState::Compiling;
        }

        let job = match self.build_job(id, &batch).await {
            Ok(job) => job,
            Err(e) => return self.fail_members(&batch, &e).await,
        };
        let unit_files = job.unit_files.clone();

        let outcome = match self.session.submit(job).await {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_members(&batch, &e).await,
        };

        let diagnostics = attribute_diagnostics(&outcome.output, &unit_files);
        for diagnostic in diagnostics.iter().filter(|d| d.file.is_none()) {
            debug!(batch = id, "compiler: {}", diagnostic.message);
        }

        let raw = match outcome.assembly {
            Some(raw) => raw,
            None => {
                for member in &batch.members {
                    let lines: Vec<&str> = diagnostics
                        .iter()
                        .filter(|d| d.file.as_deref() == Some(member.file_name.as_str()))
                        .map(|d| d.message.as_str())
                        .collect();
                    let message = if lines.is_empty() {
                        "compilation failed".to_string()
                    } else {
                        lines.join("\n")
                    };
                    let error = ForgeError::Compile { unit: member.name.clone(), message };
                    self.fail_unit(&member.name, &error).await;
                }
                return;
            }
        };

        for member in &batch.members {
            member.handle.lock().state = LoadState::Verifying;
        }

        let verified = match self.verifier.verify(&raw, &member_names) {
            Ok(verified) => verified,
            Err(e) => return self.fail_members(&batch, &e).await,
        };
        if verified.patched_methods > 0 {
            info!(batch = id, methods = verified.patched_methods, "sandbox pass patched method bodies");
        }

        let mut failed_keys: HashSet<String> = HashSet::new();
        for error in &verified.structural_errors {
            if let Some(unit) = error.unit() {
                failed_keys.insert(unit.to_ascii_lowercase());
                let unit = unit.to_string();
                self.fail_unit(&unit, error).await;
            }
        }

        let survivors: Vec<String> = batch
            .members
            .iter()
            .filter(|m| !failed_keys.contains(&m.name.to_ascii_lowercase()))
            .map(|m| m.name.clone())
            .collect();

        let binary = Arc::new(CompiledBinary {
            name: format!("batch_{id}"),
            plugin_names: survivors.clone(),
            raw,
            patched: verified.patched,
            digest: verified.digest,
            duration: outcome.duration,
            module: Some(verified.module),
            factories: verified.factories,
            loading: false,
            batched: survivors.len() > 1,
        });

        // Members are in dependency order; a failure poisons its dependents
        // within the batch.
        let mut succeeded: Vec<String> = Vec::new();
        for member in &batch.members {
            let key = member.name.to_ascii_lowercase();
            if failed_keys.contains(&key) {
                continue;
            }

            if let Some(dep) =
                member.requires.iter().find(|r| failed_keys.contains(&r.to_ascii_lowercase()))
            {
                let error = ForgeError::Dependency {
                    unit: member.name.clone(),
                    reason: format!("required plugin '{dep}' failed in the same batch"),
                };
                failed_keys.insert(key);
                self.fail_unit(&member.name, &error).await;
                continue;
            }

            match self.swap_in(member, &binary).await {
                Ok(()) => {
                    succeeded.push(member.name.clone());
                    self.host.on_compile_finished(&member.name, true).await;
                }
                Err(_) => {
                    failed_keys.insert(key);
                    self.host.on_compile_finished(&member.name, false).await;
                }
            }
        }

        info!(
            batch = id,
            registered = succeeded.len(),
            duration = ?outcome.duration,
            "load batch complete"
        );

        self.cascade_reloads(&succeeded, &batch);
    }

    async fn build_job(&self, id: u64, batch: &ResolvedBatch) -> ForgeResult<CompileJob> {
        let mut sources = Vec::new();
        for include in &batch.includes {
            let bytes = tokio::fs::read(include).await.map_err(|e| {
                ForgeError::Io(format!("failed to read include '{}': {e}", include.display()))
            })?;
            let name = include
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| include.display().to_string());
            sources.push(SourceFile::new(name, &bytes));
        }
        for member in &batch.members {
            sources.push(SourceFile::new(member.file_name.clone(), member.source.as_bytes()));
        }

        let mut references = Vec::new();
        for (name, path) in &batch.references {
            references.push(ReferenceFile::from_path(name.clone(), path.clone()));
        }
        for (name, binary) in &batch.satisfied {
            references.push(ReferenceFile::from_bytes(name.clone(), &binary.patched));
        }

        Ok(CompileJob {
            batch_id: id,
            payload: CompilePayload { name: format!("batch_{id}"), sources, references },
            unit_files: batch.members.iter().map(|m| m.file_name.clone()).collect(),
        })
    }

    /// Swap the freshly verified binary in for one unit: unload the previous
    /// instance, then instantiate and register the new one. On rejection the
    /// previous version is re-registered when one exists.
    async fn swap_in(&self, member: &BatchMember, binary: &Arc<CompiledBinary>) -> ForgeResult<()> {
        let factory = binary.factory(&member.name).cloned().ok_or_else(|| {
            ForgeError::Structural {
                unit: member.name.clone(),
                reason: "verified binary published no constructor".to_string(),
            }
        })?;

        let (name, was_live) = {
            let mut unit = member.handle.lock();
            unit.state = LoadState::Unloading;
            (unit.name.clone(), unit.live)
        };
        if was_live {
            self.host.unload(&name).await;
            member.handle.lock().live = false;
        }

        member.handle.lock().state = LoadState::Instantiating;
        let handle = PluginHandle { name: name.clone(), binary: binary.clone(), factory };
        match self.host.register(handle).await {
            Ok(()) => {
                let mut unit = member.handle.lock();
                unit.install_binary(binary.clone());
                unit.state = LoadState::Registered;
                unit.live = true;
                unit.loading = false;
                info!(unit = %name, digest = %binary.digest, "plugin registered");
                Ok(())
            }
            Err(message) => {
                let error =
                    ForgeError::Infrastructure(format!("host rejected '{name}': {message}"));
                warn!(unit = %name, "registration failed: {message}");

                let fallback = {
                    let mut unit = member.handle.lock();
                    unit.mark_failed(error.to_string());
                    unit.restore_last_good()
                        .and_then(|b| b.factory(&name).cloned().map(|f| (b, f)))
                };
                if let Some((previous, factory)) = fallback {
                    let restored = PluginHandle { name: name.clone(), binary: previous, factory };
                    if self.host.register(restored).await.is_ok() {
                        let mut unit = member.handle.lock();
                        unit.state = LoadState::RolledBack;
                        unit.live = true;
                        warn!(unit = %name, "previous version restored");
                    }
                }
                Err(error)
            }
        }
    }

    /// Record a failure on a unit. A unit whose previous instance is still
    /// live in the host keeps running it and lands in the rolled-back state.
    async fn fail_unit(&self, name: &str, error: &ForgeError) {
        warn!(unit = name, "load failed: {error}");
        if let Some(handle) = self.registry.get(name) {
            let mut unit = handle.lock();
            unit.mark_failed(error.to_string());
            if unit.live && unit.restore_last_good().is_some() {
                unit.state = LoadState::RolledBack;
            }
        }
        self.host.on_compile_finished(name, false).await;
    }

    async fn fail_members(&self, batch: &ResolvedBatch, error: &ForgeError) {
        for member in &batch.members {
            self.fail_unit(&member.name, error).await;
        }
    }

    /// Queue reloads for registered plugins outside the batch that depend on
    /// units the batch just updated.
    fn cascade_reloads(self: &Arc<Self>, succeeded: &[String], batch: &ResolvedBatch) {
        let in_batch: HashSet<String> =
            batch.members.iter().map(|m| m.name.to_ascii_lowercase()).collect();

        let mut pending: Vec<String> = Vec::new();
        for name in succeeded {
            for handle in self.registry.dependents_of(name) {
                let mut unit = handle.lock();
                if in_batch.contains(&unit.name.to_ascii_lowercase()) || !unit.state.is_live() {
                    continue;
                }
                unit.compilation_needed = true;
                if !pending.iter().any(|p| p.eq_ignore_ascii_case(&unit.name)) {
                    pending.push(unit.name.clone());
                }
            }
        }
        if pending.is_empty() {
            return;
        }

        info!(units = ?pending, "reloading dependents of updated plugins");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.load_many(pending).await {
                warn!("cascading reload failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{ModuleIr, TypeIr};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::fs::File;
    use std::path::Path;
    use std::time::SystemTime;

    #[derive(Default)]
    struct RecordingHost {
        events: parking_lot::Mutex<Vec<String>>,
    }

    impl RecordingHost {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl PluginHost for RecordingHost {
        async fn unload(&self, name: &str) {
            self.events.lock().push(format!("unload:{name}"));
        }

        async fn register(&self, handle: PluginHandle) -> Result<(), String> {
            self.events.lock().push(format!("register:{}", handle.name));
            Ok(())
        }

        async fn on_compile_finished(&self, name: &str, success: bool) {
            self.events.lock().push(format!("finished:{name}:{success}"));
        }
    }

    fn module_bytes(batch: &str, plugins: &[&str]) -> Vec<u8> {
        let module = ModuleIr {
            name: batch.to_string(),
            types: plugins
                .iter()
                .map(|p| TypeIr {
                    name: p.to_string(),
                    has_default_ctor: true,
                    methods: Vec::new(),
                })
                .collect(),
        };
        serde_json::to_vec(&module).unwrap()
    }

    fn ready_line() -> String {
        r#"{"id":0,"type":"ready"}"#.to_string()
    }

    fn assembly_line(id: u64, bytes: &[u8]) -> String {
        format!(
            r#"{{"id":{id},"type":"assembly","payload":{{"data":"{}","output":""}}}}"#,
            BASE64.encode(bytes)
        )
    }

    fn failure_line(id: u64, output: &str) -> String {
        format!(r#"{{"id":{id},"type":"assembly","payload":{{"output":"{output}"}}}}"#)
    }

    fn test_config(dir: &Path, script: String) -> ForgeConfig {
        let mut config = ForgeConfig::default();
        config.paths.plugin_dir = dir.to_path_buf();
        config.paths.library_dir = dir.join("libraries");
        config.paths.include_dir = dir.join("include");
        config.compiler.command = "/bin/sh".to_string();
        config.compiler.args = vec!["-c".to_string(), script];
        config
    }

    fn write_plugin(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(format!("{name}.plg")), body).unwrap();
    }

    #[tokio::test]
    async fn test_load_compiles_verifies_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "Shop", "plugin Shop {\n}\n");

        let script = format!(
            "echo '{}'; read line; echo '{}'",
            ready_line(),
            assembly_line(1, &module_bytes("batch_1", &["Shop"]))
        );
        let host = Arc::new(RecordingHost::default());
        let manager = LoadManager::new(test_config(dir.path(), script), host.clone());

        manager.load("Shop").await.unwrap();

        let events = host.events();
        assert_eq!(events, vec!["register:Shop", "finished:Shop:true"]);

        let rows = manager.registry().status();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, LoadState::Registered);
        assert!(rows[0].digest.is_some());
    }

    #[tokio::test]
    async fn test_failed_recompile_keeps_previous_version_live() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "Shop", "plugin Shop {\n}\n");

        // Same worker serves both batches: v1 compiles, v2 fails.
        let script = format!(
            "echo '{}'; read line; echo '{}'; read line; echo '{}'",
            ready_line(),
            assembly_line(1, &module_bytes("batch_1", &["Shop"])),
            failure_line(2, "Shop.plg(1,1): error: boom")
        );
        let host = Arc::new(RecordingHost::default());
        let manager = LoadManager::new(test_config(dir.path(), script), host.clone());

        manager.load("Shop").await.unwrap();
        let v1_digest = manager.registry().status()[0].digest.clone().unwrap();

        // Edit the source so the reload actually recompiles.
        write_plugin(dir.path(), "Shop", "plugin Shop {\n  broken\n}\n");
        let file = File::options().write(true).open(dir.path().join("Shop.plg")).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2)).unwrap();

        manager.load("Shop").await.unwrap();

        let rows = manager.registry().status();
        assert_eq!(rows[0].state, LoadState::RolledBack);
        assert_eq!(rows[0].digest.as_deref(), Some(v1_digest.as_str()));
        assert!(rows[0].last_error.as_ref().unwrap().contains("boom"));

        // The live v1 instance was never touched.
        let events = host.events();
        assert!(!events.contains(&"unload:Shop".to_string()));
        assert_eq!(events.last().unwrap(), "finished:Shop:false");
    }

    #[tokio::test]
    async fn test_request_while_in_flight_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        // Worker command is never reached.
        let manager = LoadManager::new(test_config(dir.path(), "exit 1".to_string()), host.clone());

        let handle = manager
            .registry()
            .get_or_create("Shop", dir.path().join("Shop.plg"));
        handle.lock().state = LoadState::Compiling;

        manager.load("Shop").await.unwrap();
        assert!(host.events().is_empty());
        assert_eq!(handle.lock().state, LoadState::Compiling);
    }

    #[tokio::test]
    async fn test_unload_unknown_plugin_errors() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let manager = LoadManager::new(test_config(dir.path(), "exit 1".to_string()), host);

        let err = manager.unload("Ghost").await.unwrap_err();
        assert!(matches!(err, ForgeError::UnknownPlugin(_)));
    }

    #[tokio::test]
    async fn test_unload_removes_dependents_first() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "Core", "plugin Core {\n}\n");
        write_plugin(dir.path(), "Shop", "// Requires: Core\nplugin Shop {\n}\n");

        let script = format!(
            "echo '{}'; read line; echo '{}'",
            ready_line(),
            assembly_line(1, &module_bytes("batch_1", &["Core", "Shop"]))
        );
        let host = Arc::new(RecordingHost::default());
        let manager = LoadManager::new(test_config(dir.path(), script), host.clone());

        manager.load("Shop").await.unwrap();
        assert_eq!(manager.registry().status().iter().filter(|r| r.state == LoadState::Registered).count(), 2);

        manager.unload("Core").await.unwrap();

        let unloads: Vec<String> = host
            .events()
            .into_iter()
            .filter(|e| e.starts_with("unload:"))
            .collect();
        assert_eq!(unloads, vec!["unload:Shop", "unload:Core"]);
    }
}
