//! Config watcher
//!
//! Emits one coalesced reload from any of four sources: file-system
//! notifications on the catalog path, an mtime poll fallback, SIGHUP, and
//! the in-process handle the `magg_reload_config` admin tool uses. Bursts
//! within the debounce window collapse into a single reload; a reload-time
//! validation failure keeps the previous catalog in force.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{compute_diff, ConfigStore};
use crate::mount::MountEngine;
use crate::settings::{Settings, WatchdogMode};
use crate::{Error, Result};

/// Events within this window collapse into one reload.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// What scheduled the pending reload (logged when it fires).
#[derive(Debug, Clone, Copy)]
pub enum ReloadTrigger {
    /// File-system notification on the catalog path.
    FileEvent,
    /// The mtime poll noticed a change.
    Poll,
    /// SIGHUP.
    Signal,
    /// In-process request from an admin tool.
    Imperative,
}

/// Cloneable handle for requesting a coalesced reload in-process.
#[derive(Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<ReloadTrigger>,
}

impl ReloadHandle {
    /// Schedule a reload; collapses with any pending trigger.
    pub fn request(&self) {
        let _ = self.tx.try_send(ReloadTrigger::Imperative);
    }
}

/// Parse the catalog, diff against the previous snapshot, and apply.
///
/// Shared by the watcher task and the imperative admin path.
///
/// # Errors
///
/// Returns the load error when the file is unreadable or invalid; the
/// previous catalog continues in force.
pub async fn reload_once(store: &ConfigStore, engine: &MountEngine) -> Result<String> {
    let old = store.current();
    let new = store.load().await?;

    let diff = compute_diff(&old, &new);
    if diff.is_empty() {
        debug!("Reload: no changes detected");
        return Ok("no changes detected".to_string());
    }

    let summary = diff.summary();
    info!(changes = %summary, "Reload: applying catalog diff");
    engine.apply(&diff).await;
    Ok(summary)
}

/// The config watcher; holds the OS watcher alive for its lifetime.
pub struct ConfigWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
    handle: ReloadHandle,
}

impl ConfigWatcher {
    /// Start watching per the settings' reload knobs.
    ///
    /// # Errors
    ///
    /// Returns an error only when `reload_use_watchdog = on` and the OS
    /// watcher cannot be created; in `auto` mode the poll fallback takes
    /// over silently.
    pub fn start(
        store: Arc<ConfigStore>,
        engine: Arc<MountEngine>,
        settings: &Settings,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<ReloadTrigger>(32);
        let handle = ReloadHandle { tx: tx.clone() };
        let config_path = store.path().to_path_buf();

        let watcher = match settings.reload_use_watchdog {
            WatchdogMode::Off => None,
            WatchdogMode::On => Some(Self::create_fs_watcher(&config_path, tx.clone())?),
            WatchdogMode::Auto => match Self::create_fs_watcher(&config_path, tx.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "File-system watcher unavailable, polling instead");
                    None
                }
            },
        };

        // Poll fallback when no OS watcher is active.
        if watcher.is_none() {
            Self::spawn_poll_task(
                config_path,
                settings.poll_interval(),
                tx.clone(),
                shutdown.clone(),
            );
        }

        #[cfg(unix)]
        Self::spawn_signal_task(tx.clone(), shutdown.clone());

        Self::spawn_reload_task(store, engine, rx, shutdown);

        Ok(Self {
            _watcher: Mutex::new(watcher),
            handle,
        })
    }

    /// Handle for imperative reloads.
    #[must_use]
    pub fn handle(&self) -> ReloadHandle {
        self.handle.clone()
    }

    fn create_fs_watcher(
        config_path: &Path,
        tx: mpsc::Sender<ReloadTrigger>,
    ) -> Result<RecommendedWatcher> {
        let watched = config_path.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                if is_catalog_event(&event, &watched) {
                    let _ = tx.try_send(ReloadTrigger::FileEvent);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Internal(format!("failed to create config watcher: {e}")))?;

        // Watch the parent directory: editors replace the file via rename,
        // which drops a watch on the file itself.
        let dir = config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("failed to watch catalog directory: {e}")))?;

        info!(path = %config_path.display(), "Watching catalog for changes");
        Ok(watcher)
    }

    fn spawn_poll_task(
        config_path: PathBuf,
        interval: Duration,
        tx: mpsc::Sender<ReloadTrigger>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_mtime = mtime_of(&config_path);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = mtime_of(&config_path);
                        if current != last_mtime {
                            last_mtime = current;
                            let _ = tx.try_send(ReloadTrigger::Poll);
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    #[cfg(unix)]
    fn spawn_signal_task(tx: mpsc::Sender<ReloadTrigger>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                warn!("SIGHUP handler unavailable");
                return;
            };
            loop {
                tokio::select! {
                    Some(()) = hangup.recv() => {
                        let _ = tx.try_send(ReloadTrigger::Signal);
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Debounced consumer: the first trigger opens the window, later ones
    /// collapse into it, and the reload runs once the window is quiet.
    fn spawn_reload_task(
        store: Arc<ConfigStore>,
        engine: Arc<MountEngine>,
        mut rx: mpsc::Receiver<ReloadTrigger>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut pending: Option<ReloadTrigger> = None;
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(trigger) = maybe else { break };
                        last_event = Some(Instant::now());
                        if pending.is_none() {
                            pending = Some(trigger);
                        }
                    }
                    _ = ticker.tick() => {
                        if pending.is_some()
                            && last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE)
                        {
                            let trigger = pending.take();
                            last_event = None;
                            info!(trigger = ?trigger, "Reload triggered");
                            if let Err(e) = reload_once(&store, &engine).await {
                                warn!(error = %e, "Reload failed, keeping current catalog");
                            }
                        }
                    }
                    () = shutdown.cancelled() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Create/modify events touching the catalog path (or its temp sibling
/// being renamed over it) schedule a reload.
fn is_catalog_event(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p == config_path)
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_event_matches_modify_on_exact_path() {
        use notify::event::{DataChange, ModifyKind};

        let path = PathBuf::from("/tmp/config.json");
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            paths: vec![path.clone()],
            attrs: notify::event::EventAttributes::default(),
        };
        assert!(is_catalog_event(&event, &path));
    }

    #[test]
    fn catalog_event_ignores_other_paths_and_removals() {
        use notify::event::{DataChange, ModifyKind, RemoveKind};

        let path = PathBuf::from("/tmp/config.json");

        let other = Event {
            kind: EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            paths: vec![PathBuf::from("/tmp/other.json")],
            attrs: notify::event::EventAttributes::default(),
        };
        assert!(!is_catalog_event(&other, &path));

        let removed = Event {
            kind: EventKind::Remove(RemoveKind::File),
            paths: vec![path.clone()],
            attrs: notify::event::EventAttributes::default(),
        };
        assert!(!is_catalog_event(&removed, &path));
    }

    #[test]
    fn mtime_of_missing_file_is_none() {
        assert!(mtime_of(Path::new("/nonexistent/magg/config.json")).is_none());
    }
}
