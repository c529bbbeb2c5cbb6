//! Config hot-reload watcher.
//!
//! Watches `cadence.toml` and reloads the task registry after a debounce
//! window. A file that fails to parse leaves the previous registry in place.

use cadence_core::{CadenceError, CadenceResult, TaskStore};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

/// Reloads a [`TaskStore`] whenever its backing file changes.
///
/// The watch lasts as long as this struct; dropping it stops the background
/// thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching the store's backing file.
    ///
    /// The parent directory is watched rather than the file itself so that
    /// editors that save by rename are still noticed.
    pub fn start(store: Arc<TaskStore>, debounce_ms: u64) -> CadenceResult<Self> {
        let config_path = store
            .source_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| CadenceError::Config("Task registry has no backing file".to_string()))?;
        let file_name = config_path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| {
                CadenceError::Config(format!("Invalid config path '{}'", config_path.display()))
            })?;
        let dir = crate::config::config_dir(&config_path);

        let (tx, rx) = std_mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if touches_file(&event, &file_name) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| CadenceError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| CadenceError::Config(format!("Failed to watch config directory: {e}")))?;

        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);
            while rx.recv().is_ok() {
                // Let the burst settle, then reload once for all of it.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match store.reload() {
                    Ok(count) => tracing::info!(count, "Task registry hot-reloaded"),
                    Err(e) => tracing::warn!(error = %e, "Ignoring invalid config edit"),
                }
            }
            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// Whether `event` is a content change to the file called `file_name`.
fn touches_file(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}
