//! Plugin source directory watcher.
//!
//! Turns raw filesystem notifications on the plugin directory into named
//! plugin events. Rapid successive notifications for the same file (editors
//! tend to emit several per save) are coalesced within a debounce window.

use std::collections::HashMap;
use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::WatchConfig;
use crate::error::{ForgeError, ForgeResult};

/// A change to one plugin source file, identified by plugin name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A new source file appeared.
    Added(String),
    /// An existing source file was edited.
    Changed(String),
    /// The source file was deleted.
    Removed(String),
}

/// Watches the plugin directory and yields debounced [`SourceEvent`]s.
pub struct SourceWatcher {
    // Dropping the watcher stops the notification stream.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<SourceEvent>,
}

impl SourceWatcher {
    /// Start watching `dir` for files with the configured extension.
    pub fn start(dir: &Path, config: &WatchConfig) -> ForgeResult<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!("watch error: {e}"),
            }
        })
        .map_err(|e| ForgeError::Watch(e.to_string()))?;

        watcher.watch(dir, RecursiveMode::NonRecursive).map_err(|e| {
            ForgeError::Watch(format!("cannot watch '{}': {e}", dir.display()))
        })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(debounce_loop(
            raw_rx,
            tx,
            config.extension.to_ascii_lowercase(),
            config.debounce(),
        ));

        Ok(Self { _watcher: watcher, rx })
    }

    /// Next debounced event, or `None` once the watcher shut down.
    pub async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<Event>,
    tx: mpsc::Sender<SourceEvent>,
    extension: String,
    debounce: std::time::Duration,
) {
    let mut pending: HashMap<String, (SourceEvent, Instant)> = HashMap::new();

    loop {
        let next_flush = pending.values().map(|(_, at)| *at).min();
        let raw = match next_flush {
            Some(deadline) => tokio::select! {
                raw = raw_rx.recv() => match raw {
                    Some(event) => Some(event),
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => None,
            },
            None => match raw_rx.recv().await {
                Some(event) => Some(event),
                None => break,
            },
        };

        if let Some(event) = raw {
            for path in &event.paths {
                let Some(name) = plugin_name(path, &extension) else { continue };
                let mapped = match event.kind {
                    EventKind::Create(_) => SourceEvent::Added(name),
                    EventKind::Modify(_) => SourceEvent::Changed(name),
                    EventKind::Remove(_) => SourceEvent::Removed(name),
                    _ => continue,
                };
                let key = key_of(&mapped).to_ascii_lowercase();
                let deadline = Instant::now() + debounce;
                match pending.remove(&key) {
                    Some((previous, _)) => {
                        pending.insert(key, (coalesce(previous, mapped), deadline));
                    }
                    None => {
                        pending.insert(key, (mapped, deadline));
                    }
                }
            }
        }

        let now = Instant::now();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            if let Some((event, _)) = pending.remove(&key) {
                debug!(?event, "source event");
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn key_of(event: &SourceEvent) -> &str {
    match event {
        SourceEvent::Added(name) | SourceEvent::Changed(name) | SourceEvent::Removed(name) => name,
    }
}

/// Merge two debounced events for the same file.
fn coalesce(previous: SourceEvent, next: SourceEvent) -> SourceEvent {
    use SourceEvent::*;
    match (previous, next) {
        // Create followed by the editor's write events is still an add.
        (Added(name), Changed(_)) => Added(name),
        // Remove-then-recreate (atomic save) is an edit.
        (Removed(_), Added(name)) | (Removed(_), Changed(name)) => Changed(name),
        (_, next) => next,
    }
}

/// Plugin name for a path, if it carries the watched extension.
fn plugin_name(path: &Path, extension: &str) -> Option<String> {
    let matches = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false);
    if !matches {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}
