//! Watch the previewed plugin binary and report when a rebuild lands on disk

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Quiet period after the last change before the callback fires
const DEBOUNCE_MS: u64 = 500;

const POLL_MS: u64 = 100;

pub type ChangeCallback = Box<dyn Fn(PathBuf) + Send + Sync>;

pub struct PluginWatcher {
    watcher: Option<RecommendedWatcher>,
    debounce: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl PluginWatcher {
    /// Start watching `bundle`. `on_change` runs on the watcher's own thread.
    pub fn watch(bundle: &Path, on_change: ChangeCallback) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        // The parent sees the bundle being replaced wholesale; the bundle itself
        // sees writes to files inside it
        if let Some(parent) = bundle.parent().filter(|p| p.exists()) {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }
        if bundle.is_dir() {
            watcher.watch(bundle, RecursiveMode::Recursive)?;
        }

        let path = bundle.to_path_buf();
        let target = path.clone();
        let debounce = thread::Builder::new()
            .name("plugin-watcher".to_string())
            .spawn(move || debounce_loop(rx, target, on_change))
            .map_err(|e| notify::Error::generic(&e.to_string()))?;

        log::info!("Watching plugin for changes: {:?}", path);
        Ok(Self {
            watcher: Some(watcher),
            debounce: Some(debounce),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn debounce_loop(
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    target: PathBuf,
    on_change: ChangeCallback,
) {
    let mut pending: Option<Instant> = None;
    // Some backends report resolved paths
    let resolved = target.canonicalize().unwrap_or_else(|_| target.clone());

    loop {
        match rx.recv_timeout(Duration::from_millis(POLL_MS)) {
            Ok(Ok(event)) => {
                if event.kind.is_access() {
                    continue;
                }
                if event
                    .paths
                    .iter()
                    .any(|p| p.starts_with(&target) || p.starts_with(&resolved))
                {
                    pending = Some(Instant::now());
                }
            }
            Ok(Err(e)) => log::warn!("Plugin watcher error: {}", e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(last) = pending {
            if last.elapsed() >= Duration::from_millis(DEBOUNCE_MS) && target.exists() {
                pending = None;
                log::info!("Plugin changed on disk: {:?}", target);
                on_change(target.clone());
            }
        }
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        // Dropping the watcher closes the channel and ends the debounce thread
        drop(self.watcher.take());
        if let Some(handle) = self.debounce.take() {
            let _ = handle.join();
        }
        log::info!("Stopped watching {:?}", self.path);
    }
}
