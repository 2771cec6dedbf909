//! Hot reload of the previewed plugin after a rebuild
//!
//! A reload fades the output to silence, swaps the plugin instance and fades
//! back in, restoring the editor window if it was open. Failures leave the
//! host in `Error`; nothing is retried or reverted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::engine::AudioEngine;
use super::error::{HostError, ReloadError};
use super::plugin::file_watcher::PluginWatcher;
use super::plugin::{PluginHost, PluginState};

/// Result of an external build, as reported by the build tooling
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildOutcome {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// What happens to parameter values across a reload
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// The new instance starts from its own defaults
    #[default]
    ResetToDefaults,
    /// Capture the old instance's state and apply it to the new one
    PreserveState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadDisposition {
    Ignored(&'static str),
    Reloaded,
}

/// Something that can take the output to silence and back
pub trait OutputFader: Send + Sync {
    /// Returns once the output is silent
    fn fade_out(&self);
    fn fade_in(&self);
}

impl OutputFader for AudioEngine {
    fn fade_out(&self) {
        AudioEngine::fade_out(self);
    }

    fn fade_in(&self) {
        AudioEngine::fade_in(self);
    }
}

pub struct HotReloadCoordinator {
    host: Arc<PluginHost>,
    fader: Arc<dyn OutputFader>,
    policy: ReloadPolicy,
}

impl HotReloadCoordinator {
    pub fn new(host: Arc<PluginHost>, fader: Arc<dyn OutputFader>, policy: ReloadPolicy) -> Self {
        Self {
            host,
            fader,
            policy,
        }
    }

    pub fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    /// React to a finished build. Builds of other plugins are ignored.
    pub fn handle_build_outcome(
        &self,
        outcome: &BuildOutcome,
    ) -> Result<ReloadDisposition, ReloadError> {
        if !outcome.success {
            log::info!(
                "Build failed, keeping current plugin: {}",
                outcome.error.as_deref().unwrap_or("no details")
            );
            return Ok(ReloadDisposition::Ignored("build failed"));
        }

        let _op = self.host.lock_operations();

        let Some(previewed) = self.host.previewed_path() else {
            return Ok(ReloadDisposition::Ignored("no plugin is being previewed"));
        };
        let Some(output) = outcome.output_path.as_deref() else {
            return Ok(ReloadDisposition::Ignored("build produced no output path"));
        };
        let Some(bundle) = resolve_bundle(output, &previewed) else {
            log::debug!("Build output {:?} is not the previewed plugin {:?}", output, previewed);
            return Ok(ReloadDisposition::Ignored("build output is a different plugin"));
        };

        match self.host.state() {
            PluginState::Active { .. } | PluginState::Error { .. } => {}
            other => {
                log::info!("Skipping reload, plugin is {:?}", other);
                return Ok(ReloadDisposition::Ignored("plugin is not active"));
            }
        }

        self.run(&bundle)?;
        Ok(ReloadDisposition::Reloaded)
    }

    /// Reload the previewed plugin from its current path
    pub fn reload(&self) -> Result<(), ReloadError> {
        let _op = self.host.lock_operations();
        let path = self
            .host
            .previewed_path()
            .ok_or(ReloadError::NothingToReload)?;
        self.run(&path)
    }

    fn run(&self, path: &Path) -> Result<(), ReloadError> {
        let _op = self.host.lock_operations();
        log::info!("Hot reloading plugin from {:?}", path);

        let editor_was_open = self.host.is_editor_open();
        self.host.set_state(PluginState::Reloading {
            path: path.to_path_buf(),
        });
        self.fader.fade_out();

        let saved = self
            .host
            .release_module(self.policy == ReloadPolicy::PreserveState);
        let result = self.bring_up(path, saved, editor_was_open);

        self.fader.fade_in();

        match result {
            Ok(()) => {
                log::info!("Hot reload complete");
                Ok(())
            }
            Err(e) => {
                log::error!("Hot reload failed: {}", e);
                self.host.fail(e.to_string());
                Err(e)
            }
        }
    }

    fn bring_up(
        &self,
        path: &Path,
        saved: Option<Vec<u8>>,
        editor_was_open: bool,
    ) -> Result<(), ReloadError> {
        self.host.load_and_install(path)?;

        if let Some(state) = saved {
            if let Err(e) = self.host.restore_state(&state) {
                log::warn!("New build rejected the previous state, using defaults: {}", e);
            }
        }

        if editor_was_open {
            match self.host.open_editor() {
                Ok(()) => {}
                Err(HostError::NoEditor) => {
                    log::warn!("New build has no editor, leaving it closed");
                }
                Err(e) => {
                    self.host.release_module(false);
                    return Err(ReloadError::Editor(e));
                }
            }
        }
        Ok(())
    }

    /// Reload for every outcome received, one at a time, until the sender closes
    pub async fn run_build_listener(
        self: Arc<Self>,
        mut outcomes: tokio::sync::mpsc::Receiver<BuildOutcome>,
    ) {
        while let Some(outcome) = outcomes.recv().await {
            let coordinator = self.clone();
            let handled =
                tokio::task::spawn_blocking(move || coordinator.handle_build_outcome(&outcome))
                    .await;
            match handled {
                Ok(Ok(ReloadDisposition::Reloaded)) => {}
                Ok(Ok(ReloadDisposition::Ignored(reason))) => {
                    log::debug!("Build outcome ignored: {}", reason)
                }
                Ok(Err(e)) => log::error!("Reload after build failed: {}", e),
                Err(e) => log::error!("Reload task panicked: {}", e),
            }
        }
        log::info!("Build listener stopped");
    }

    /// Reload whenever `bundle` changes on disk
    pub fn watch(self: &Arc<Self>, bundle: &Path) -> notify::Result<PluginWatcher> {
        let coordinator = self.clone();
        let target = bundle.to_path_buf();
        PluginWatcher::watch(
            bundle,
            Box::new(move |changed| {
                log::info!("Plugin binary changed on disk: {:?}", changed);
                let outcome = BuildOutcome {
                    success: true,
                    output_path: Some(target.clone()),
                    error: None,
                };
                if let Err(e) = coordinator.handle_build_outcome(&outcome) {
                    log::error!("Reload after file change failed: {}", e);
                }
            }),
        )
    }
}

/// The bundle in `output` that matches the previewed plugin, if any.
/// `output` may be the bundle itself or the directory it was written to.
fn resolve_bundle(output: &Path, previewed: &Path) -> Option<PathBuf> {
    let name = previewed.file_name()?;
    if output.file_name() == Some(name) {
        return Some(output.to_path_buf());
    }
    let candidate = output.join(name);
    if output.is_dir() && candidate.exists() {
        Some(candidate)
    } else {
        None
    }
}
