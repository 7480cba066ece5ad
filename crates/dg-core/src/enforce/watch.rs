//! File-change fast path for the enforcement loop.
//!
//! On Linux an inotify watch on each monitored directory wakes the loop for
//! an out-of-cycle tick when a store (or one of its siblings) changes. The
//! fixed poll interval stays in force either way; elsewhere the loop is
//! poll-only.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::variant::MonitoredPath;

/// How often the watcher thread drains the kernel queue.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Wakes the loop when a monitored store changes.
pub struct ChangeWatcher {
    wake_rx: Receiver<()>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Watch the directories of `paths`. Fails when notifications are
    /// unavailable; the caller then runs poll-only.
    pub fn start(paths: &[MonitoredPath]) -> Result<Self, String> {
        let dirs: BTreeSet<PathBuf> = paths
            .iter()
            .filter_map(|p| p.dir().map(|d| d.to_path_buf()))
            .filter(|d| d.is_dir())
            .collect();
        if dirs.is_empty() {
            return Err("no monitored directory exists yet".to_string());
        }
        // Store names are prefixes of their in-flight and backup siblings.
        let names: Vec<OsString> = paths.iter().map(|p| OsString::from(p.file_name())).collect();

        let (wake_tx, wake_rx) = mpsc::sync_channel::<()>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_watch_thread(dirs, names, wake_tx, Arc::clone(&stop))?;
        Ok(ChangeWatcher {
            wake_rx,
            stop,
            thread: Some(thread),
        })
    }

    /// Block up to `timeout` for a change. `true` when one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wake_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn notify(wake_tx: &SyncSender<()>) -> bool {
    // A pending wake already covers this change.
    !matches!(wake_tx.try_send(()), Err(TrySendError::Disconnected(())))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn is_relevant(name: Option<&OsString>, names: &[OsString]) -> bool {
    let Some(name) = name else {
        return false;
    };
    let name = name.to_string_lossy();
    names
        .iter()
        .any(|store| name.starts_with(store.to_string_lossy().as_ref()))
}

#[cfg(target_os = "linux")]
fn spawn_watch_thread(
    dirs: BTreeSet<PathBuf>,
    names: Vec<OsString>,
    wake_tx: SyncSender<()>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, String> {
    use nix::errno::Errno;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    let watch_mask = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO;

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
        .map_err(|error| format!("inotify init failed: {error}"))?;
    for dir in &dirs {
        inotify
            .add_watch(dir, watch_mask)
            .map_err(|error| format!("inotify add watch {} failed: {error}", dir.display()))?;
    }

    std::thread::Builder::new()
        .name("devguard-watch".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match inotify.read_events() {
                    Ok(events) => {
                        let overflow = events
                            .iter()
                            .any(|e| e.mask.contains(AddWatchFlags::IN_Q_OVERFLOW));
                        let relevant = events.iter().any(|e| is_relevant(e.name.as_ref(), &names));
                        if (overflow || relevant) && !notify(&wake_tx) {
                            return;
                        }
                    }
                    Err(Errno::EAGAIN) => std::thread::sleep(DRAIN_INTERVAL),
                    Err(error) => {
                        tracing::warn!(
                            target: crate::logging::event_names::WATCH_POLL_ONLY,
                            error = %error,
                            "inotify read failed; continuing with polling only"
                        );
                        return;
                    }
                }
            }
        })
        .map_err(|error| format!("failed to spawn watcher thread: {error}"))
}

#[cfg(not(target_os = "linux"))]
fn spawn_watch_thread(
    _dirs: BTreeSet<PathBuf>,
    _names: Vec<OsString>,
    _wake_tx: SyncSender<()>,
    _stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, String> {
    Err("file-change notifications unavailable on this platform; polling only".to_string())
}
