//! End-to-end pipeline tests.
//!
//! These drive the real load manager against canned `/bin/sh` workers that
//! speak the compiler wire protocol: a `ready` handshake, then one scripted
//! reply per request. Request ids are per-worker and start at 1, so each
//! script lists its replies in submission order.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use hotforge::verify::{InstrIr, MethodIr, ModuleIr, TypeIr};
use hotforge::{ForgeConfig, LoadManager, LoadState, PluginHandle, PluginHost};

#[derive(Default)]
struct RecordingHost {
    events: parking_lot::Mutex<Vec<String>>,
    reject_next_register: AtomicBool,
}

impl RecordingHost {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[async_trait]
impl PluginHost for RecordingHost {
    async fn unload(&self, name: &str) {
        self.events.lock().push(format!("unload:{name}"));
    }

    async fn register(&self, handle: PluginHandle) -> Result<(), String> {
        if self.reject_next_register.swap(false, Ordering::SeqCst) {
            self.events.lock().push(format!("reject:{}", handle.name));
            return Err("instance constructor threw".to_string());
        }
        self.events.lock().push(format!("register:{}", handle.name));
        Ok(())
    }

    async fn on_compile_finished(&self, name: &str, success: bool) {
        self.events.lock().push(format!("finished:{name}:{success}"));
    }
}

fn module_bytes(batch: &str, types: Vec<TypeIr>) -> Vec<u8> {
    serde_json::to_vec(&ModuleIr { name: batch.to_string(), types }).unwrap()
}

fn plain_type(name: &str) -> TypeIr {
    TypeIr { name: name.to_string(), has_default_ctor: true, methods: Vec::new() }
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

/// Script that answers the Ready handshake and then plays back `replies` in
/// order, recording each request as a line in `requests`.
fn worker_script(requests: &Path, replies: &[String]) -> String {
    let mut script = format!("echo '{}'", ready_line());
    for reply in replies {
        script.push_str(&format!("; read line; echo x >> {}; echo '{}'", requests.display(), reply));
    }
    script
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

/// Rewrite a plugin source and push its mtime forward so the cache sees it.
fn edit_plugin(dir: &Path, name: &str, body: &str) {
    let path = dir.join(format!("{name}.plg"));
    std::fs::write(&path, body).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(2)).unwrap();
}

fn request_count(requests: &Path) -> usize {
    std::fs::read_to_string(requests).map(|s| s.lines().count()).unwrap_or(0)
}

fn state_of(manager: &LoadManager, name: &str) -> LoadState {
    manager
        .registry()
        .status()
        .into_iter()
        .find(|r| r.name.eq_ignore_ascii_case(name))
        .expect("unit known")
        .state
}

fn digest_of(manager: &LoadManager, name: &str) -> Option<String> {
    manager
        .registry()
        .status()
        .into_iter()
        .find(|r| r.name.eq_ignore_ascii_case(name))
        .and_then(|r| r.digest)
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_dependency_chain_compiles_as_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Core", "plugin Core {\n}\n");
    write_plugin(dir.path(), "Shop", "// Requires: Core\nplugin Shop {\n}\n");

    let requests = dir.path().join("requests");
    let replies = vec![assembly_line(
        1,
        &module_bytes("batch_1", vec![plain_type("Core"), plain_type("Shop")]),
    )];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    manager.load("Shop").await.unwrap();

    assert_eq!(request_count(&requests), 1, "one compile request for the whole chain");
    assert_eq!(state_of(&manager, "Core"), LoadState::Registered);
    assert_eq!(state_of(&manager, "Shop"), LoadState::Registered);
    // Both units share the batch binary.
    assert_eq!(digest_of(&manager, "Core"), digest_of(&manager, "Shop"));

    // Dependency registered before its dependent.
    let registers: Vec<String> =
        host.events().into_iter().filter(|e| e.starts_with("register:")).collect();
    assert_eq!(registers, vec!["register:Core", "register:Shop"]);
}

#[tokio::test]
async fn test_reloading_an_unchanged_plugin_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Stats", "plugin Stats {\n}\n");

    let requests = dir.path().join("requests");
    let replies = vec![assembly_line(1, &module_bytes("batch_1", vec![plain_type("Stats")]))];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    manager.load("Stats").await.unwrap();
    manager.load("Stats").await.unwrap();

    assert_eq!(request_count(&requests), 1, "second load must not recompile");
    assert_eq!(host.count("register:"), 1);
    assert_eq!(state_of(&manager, "Stats"), LoadState::Registered);
}

#[tokio::test]
async fn test_concurrent_requests_join_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Alpha", "plugin Alpha {\n}\n");
    write_plugin(dir.path(), "Beta", "plugin Beta {\n}\n");

    let requests = dir.path().join("requests");
    let replies = vec![assembly_line(
        1,
        &module_bytes("batch_1", vec![plain_type("Alpha"), plain_type("Beta")]),
    )];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    let (a, b) = tokio::join!(manager.load("Alpha"), manager.load("Beta"));
    a.unwrap();
    b.unwrap();

    assert_eq!(request_count(&requests), 1, "both requests share one batch");
    assert_eq!(state_of(&manager, "Alpha"), LoadState::Registered);
    assert_eq!(state_of(&manager, "Beta"), LoadState::Registered);
}

#[tokio::test]
async fn test_failed_recompile_rolls_back_then_next_fix_recovers() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Shop", "plugin Shop {\n}\n");

    let requests = dir.path().join("requests");
    let replies = vec![
        assembly_line(1, &module_bytes("batch_1", vec![plain_type("Shop")])),
        failure_line(2, "Shop.plg(2,3): error: unexpected token"),
        assembly_line(3, &module_bytes("batch_3", vec![plain_type("Shop")])),
    ];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    // v1 loads clean.
    manager.load("Shop").await.unwrap();
    let v1 = digest_of(&manager, "Shop").unwrap();

    // v2 breaks; v1 stays live and untouched.
    edit_plugin(dir.path(), "Shop", "plugin Shop {\n  broken\n}\n");
    manager.load("Shop").await.unwrap();
    assert_eq!(state_of(&manager, "Shop"), LoadState::RolledBack);
    assert_eq!(digest_of(&manager, "Shop").as_deref(), Some(v1.as_str()));
    assert_eq!(host.count("unload:"), 0, "rollback must not touch the live instance");

    // v3 fixes it; the old instance is swapped out.
    edit_plugin(dir.path(), "Shop", "plugin Shop {\n  fixed\n}\n");
    manager.load("Shop").await.unwrap();
    assert_eq!(state_of(&manager, "Shop"), LoadState::Registered);
    assert_ne!(digest_of(&manager, "Shop").as_deref(), Some(v1.as_str()));

    let events = host.events();
    let swap: Vec<&String> =
        events.iter().filter(|e| e.starts_with("unload:") || e.starts_with("register:")).collect();
    assert_eq!(swap, vec!["register:Shop", "unload:Shop", "register:Shop"]);
}

#[tokio::test]
async fn test_compile_timeout_fails_batch_and_fresh_worker_recovers() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Shop", "plugin Shop {\n}\n");

    let marker = dir.path().join("first-spawn");
    // The first worker hangs after the handshake; respawns reply normally.
    let script = format!(
        "if [ -f {marker} ]; then echo '{ready}'; read line; echo '{assembly}'; \
         else touch {marker}; echo '{ready}'; sleep 30; fi",
        marker = marker.display(),
        ready = ready_line(),
        assembly = assembly_line(1, &module_bytes("batch_2", vec![plain_type("Shop")])),
    );
    let mut config = test_config(dir.path(), script);
    config.compiler.compile_timeout_secs = 1;

    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(config, host.clone());

    manager.load("Shop").await.unwrap();
    assert_eq!(state_of(&manager, "Shop"), LoadState::Failed);
    let row = manager.registry().status().into_iter().find(|r| r.name == "Shop").unwrap();
    assert!(row.last_error.unwrap().contains("timed out"));

    // The broken worker was torn down; the retry gets a fresh one.
    manager.load("Shop").await.unwrap();
    assert_eq!(state_of(&manager, "Shop"), LoadState::Registered);
}

#[tokio::test]
async fn test_missing_requirement_fails_without_invoking_the_compiler() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Shop", "// Requires: Ghost\nplugin Shop {\n}\n");

    let requests = dir.path().join("requests");
    let host = Arc::new(RecordingHost::default());
    let manager =
        LoadManager::new(test_config(dir.path(), worker_script(&requests, &[])), host.clone());

    manager.load("Shop").await.unwrap();

    assert_eq!(request_count(&requests), 0, "nothing to compile");
    assert_eq!(state_of(&manager, "Shop"), LoadState::Failed);
    let row = manager.registry().status().into_iter().find(|r| r.name == "Shop").unwrap();
    assert!(row.last_error.unwrap().contains("Ghost"));
    assert!(host.events().contains(&"finished:Shop:false".to_string()));
}

#[tokio::test]
async fn test_updating_a_dependency_reloads_registered_dependents() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Core", "plugin Core {\n}\n");
    write_plugin(dir.path(), "Shop", "// Requires: Core\nplugin Shop {\n}\n");

    let requests = dir.path().join("requests");
    let replies = vec![
        // Initial chain load.
        assembly_line(1, &module_bytes("batch_1", vec![plain_type("Core"), plain_type("Shop")])),
        // Core-only recompile after the edit.
        assembly_line(2, &module_bytes("batch_2", vec![plain_type("Core")])),
        // Cascaded Shop recompile against the new Core.
        assembly_line(3, &module_bytes("batch_3", vec![plain_type("Shop")])),
    ];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    manager.load("Shop").await.unwrap();
    let shop_v1 = digest_of(&manager, "Shop").unwrap();

    edit_plugin(dir.path(), "Core", "plugin Core {\n  updated\n}\n");
    manager.load("Core").await.unwrap();

    wait_until("the cascaded Shop reload", || {
        state_of(&manager, "Shop") == LoadState::Registered
            && digest_of(&manager, "Shop").as_deref() != Some(shop_v1.as_str())
    })
    .await;

    assert_eq!(request_count(&requests), 3);
    assert_eq!(state_of(&manager, "Core"), LoadState::Registered);
    assert_eq!(host.count("register:Shop"), 2, "Shop re-registered after Core changed");
}

#[tokio::test]
async fn test_unload_removes_dependents_before_the_dependency() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Core", "plugin Core {\n}\n");
    write_plugin(dir.path(), "Shop", "// Requires: Core\nplugin Shop {\n}\n");

    let requests = dir.path().join("requests");
    let replies = vec![assembly_line(
        1,
        &module_bytes("batch_1", vec![plain_type("Core"), plain_type("Shop")]),
    )];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    manager.load("Shop").await.unwrap();
    manager.unload("Core").await.unwrap();

    let unloads: Vec<String> =
        host.events().into_iter().filter(|e| e.starts_with("unload:")).collect();
    assert_eq!(unloads, vec!["unload:Shop", "unload:Core"]);
    assert_eq!(state_of(&manager, "Core"), LoadState::Idle);
    assert_eq!(state_of(&manager, "Shop"), LoadState::Idle);
}

#[tokio::test]
async fn test_denied_api_usage_is_patched_before_registration() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Exfil", "plugin Exfil {\n}\n");

    let module = module_bytes(
        "batch_1",
        vec![TypeIr {
            name: "Exfil".to_string(),
            has_default_ctor: true,
            methods: vec![MethodIr {
                name: "on_tick".to_string(),
                body: Some(vec![InstrIr::Call { symbol: "sys.net.http.post".to_string() }]),
            }],
        }],
    );
    let requests = dir.path().join("requests");
    let replies = vec![assembly_line(1, &module)];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    manager.load("Exfil").await.unwrap();
    assert_eq!(state_of(&manager, "Exfil"), LoadState::Registered);

    // The registered binary carries the patched module, not the raw one.
    let unit = manager.registry().get("Exfil").unwrap();
    let binary = unit.lock().binary.clone().unwrap();
    assert_ne!(binary.patched, binary.raw);
    let patched = binary.module.as_ref().unwrap();
    let body = patched.types[0].methods[0].body.as_ref().unwrap();
    assert!(matches!(&body[0], InstrIr::RaiseSecurity { symbol } if symbol == "sys.net.http.post"));
}

#[tokio::test]
async fn test_host_rejection_restores_the_previous_version() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Shop", "plugin Shop {\n}\n");

    let requests = dir.path().join("requests");
    let replies = vec![
        assembly_line(1, &module_bytes("batch_1", vec![plain_type("Shop")])),
        assembly_line(2, &module_bytes("batch_2", vec![plain_type("Shop")])),
    ];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    manager.load("Shop").await.unwrap();
    let v1 = digest_of(&manager, "Shop").unwrap();

    // v2 compiles and verifies, but the host refuses the new instance.
    edit_plugin(dir.path(), "Shop", "plugin Shop {\n  v2\n}\n");
    host.reject_next_register.store(true, Ordering::SeqCst);
    manager.load("Shop").await.unwrap();

    assert_eq!(state_of(&manager, "Shop"), LoadState::RolledBack);
    assert_eq!(digest_of(&manager, "Shop").as_deref(), Some(v1.as_str()));

    let events = host.events();
    let swap: Vec<&String> = events
        .iter()
        .filter(|e| {
            e.starts_with("register:") || e.starts_with("reject:") || e.starts_with("unload:")
        })
        .collect();
    // v1 in, v1 out, v2 refused, v1 back in.
    assert_eq!(swap, vec!["register:Shop", "unload:Shop", "reject:Shop", "register:Shop"]);
}

#[tokio::test]
async fn test_load_all_discovers_every_source() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "Alpha", "plugin Alpha {\n}\n");
    write_plugin(dir.path(), "Beta", "plugin Beta {\n}\n");
    std::fs::write(dir.path().join("notes.txt"), "not a plugin").unwrap();

    let requests = dir.path().join("requests");
    let replies = vec![assembly_line(
        1,
        &module_bytes("batch_1", vec![plain_type("Alpha"), plain_type("Beta")]),
    )];
    let host = Arc::new(RecordingHost::default());
    let manager = LoadManager::new(test_config(dir.path(), worker_script(&requests, &replies)), host.clone());

    let discovered = manager.load_all().await.unwrap();
    assert_eq!(discovered, vec!["Alpha".to_string(), "Beta".to_string()]);
    assert_eq!(state_of(&manager, "Alpha"), LoadState::Registered);
    assert_eq!(state_of(&manager, "Beta"), LoadState::Registered);
}
