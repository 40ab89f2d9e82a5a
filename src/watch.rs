//! Change watcher: debounce file events and serialise re-renders.
//!
//! The document's directory is watched non-recursively rather than the
//! individual files, so editors that save by writing a new file and
//! renaming it over the old one keep being observed. Events are filtered
//! down to the document and its two working files.
//!
//! ## Debouncing
//!
//! A changed file is re-examined every poll interval; it is considered
//! written once its size and modification time have stayed the same for
//! the debounce window.
//!
//! ## Render queue
//!
//! Renders never overlap. Settled changes are pushed into a [`RenderSlot`],
//! which holds at most one pending request: any number of changes arriving
//! during a render coalesce into exactly one follow-up render.
//!
//! ## Recreated working files
//!
//! A change to the wrapper or stylesheet re-runs the preparer only if one of
//! them is missing. Files the preparer writes are remembered with their
//! signature, and the change that writing causes is dropped once it settles
//! unaltered.

use crate::error::MarkPdfError;
use crate::job::Job;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// A request taken from a [`RenderSlot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    /// Re-run the preparer before rendering.
    pub refresh: bool,
    /// Most recent file that caused the request.
    pub trigger: Option<PathBuf>,
}

/// Single-slot render queue.
///
/// [`request`](Self::request) never blocks and never queues more than one
/// render; [`next`](Self::next) waits for a request and clears the slot.
#[derive(Debug, Default)]
pub struct RenderSlot {
    notify: Notify,
    refresh: AtomicBool,
    trigger: Mutex<Option<PathBuf>>,
}

impl RenderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a render. `refresh` is sticky until the request is taken.
    pub fn request(&self, trigger: Option<PathBuf>, refresh: bool) {
        if refresh {
            self.refresh.store(true, Ordering::SeqCst);
        }
        if let Ok(mut slot) = self.trigger.lock() {
            *slot = trigger;
        }
        self.notify.notify_one();
    }

    /// Wait for the pending request and take it.
    pub async fn next(&self) -> RenderRequest {
        self.notify.notified().await;
        RenderRequest {
            refresh: self.refresh.swap(false, Ordering::SeqCst),
            trigger: self.trigger.lock().ok().and_then(|mut slot| slot.take()),
        }
    }
}

/// Size and modification time; None while the file is absent.
type Signature = Option<(u64, SystemTime)>;

fn signature(path: &Path) -> Signature {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.len(), meta.modified().ok()?))
}

#[derive(Debug)]
struct PendingChange {
    signature: Signature,
    stable_since: Instant,
}

/// Tracks changed files until they stop changing.
#[derive(Debug)]
pub(crate) struct Debouncer {
    quiet: Duration,
    pending: HashMap<PathBuf, PendingChange>,
}

impl Debouncer {
    pub(crate) fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    /// Record an event for `path`, restarting its quiet window.
    pub(crate) fn touch(&mut self, path: PathBuf, now: Instant) {
        let signature = signature(&path);
        self.pending.insert(
            path,
            PendingChange {
                signature,
                stable_since: now,
            },
        );
    }

    /// Files that have been stable for the whole window. They stop being tracked.
    pub(crate) fn settled(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut ready = Vec::new();
        for (path, change) in self.pending.iter_mut() {
            let current = signature(path);
            if current != change.signature {
                change.signature = current;
                change.stable_since = now;
            } else if now.duration_since(change.stable_since) >= self.quiet {
                ready.push(path.clone());
            }
        }
        for path in &ready {
            self.pending.remove(path);
        }
        ready.sort();
        ready
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Working files written by the watcher itself, keyed to what was written.
#[derive(Debug, Default)]
pub(crate) struct OwnWrites {
    written: Mutex<HashMap<PathBuf, Signature>>,
}

impl OwnWrites {
    pub(crate) fn record(&self, paths: impl IntoIterator<Item = PathBuf>) {
        if let Ok(mut written) = self.written.lock() {
            for path in paths {
                let sig = signature(&path);
                written.insert(path, sig);
            }
        }
    }

    /// Whether a settled change to `path` is only our own write. Each
    /// recorded write absorbs one change.
    pub(crate) fn absorbs(&self, path: &Path) -> bool {
        let Ok(mut written) = self.written.lock() else {
            return false;
        };
        match written.remove(path) {
            Some(sig) => sig.is_some() && sig == signature(path),
            None => false,
        }
    }
}

/// Watch `job`'s files and render on every settled change until the
/// watcher fails.
///
/// Render failures are logged and the loop keeps going.
pub async fn watch_and_render(job: &Job) -> Result<(), MarkPdfError> {
    let config = job.config();
    let watched = job.watched_paths();
    let names: Vec<OsString> = watched
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_os_string()))
        .collect();

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(job.dir(), RecursiveMode::NonRecursive)?;

    info!("Watching for changes in {}", job.dir().display());
    if let Some(cb) = job.progress() {
        cb.on_watching(&watched);
    }

    let slot = RenderSlot::new();
    let own_writes = OwnWrites::default();
    let mut debouncer = Debouncer::new(config.debounce());
    let mut tick = tokio::time::interval(config.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let events = async {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(Ok(event)) => {
                        if !is_content_event(&event.kind) {
                            continue;
                        }
                        for path in event.paths {
                            let relevant = path
                                .file_name()
                                .is_some_and(|n| names.iter().any(|w| w == n));
                            if relevant {
                                debug!(kind = ?event.kind, "Change in {}", path.display());
                                debouncer.touch(job.dir().join(file_name_of(&path)), Instant::now());
                            }
                        }
                    }
                    Some(Err(e)) => warn!("File watcher error: {}", e),
                    None => {
                        return Err(MarkPdfError::Internal("file watcher channel closed".into()));
                    }
                },
                _ = tick.tick() => {
                    if debouncer.is_empty() {
                        continue;
                    }
                    for path in debouncer.settled(Instant::now()) {
                        if own_writes.absorbs(&path) {
                            debug!("Ignoring recreation of {}", path.display());
                            continue;
                        }
                        let refresh = job.working_files().is_support_file(&path);
                        slot.request(Some(path), refresh);
                    }
                }
            }
        }
    };

    let renders = async {
        loop {
            let request = slot.next().await;
            if request.refresh && !job.working_files().missing().await.is_empty() {
                match job.refresh_working_files().await {
                    Ok(written) => own_writes.record(written),
                    Err(e) => {
                        error!("Failed to refresh working files: {}", e);
                        if let Some(cb) = job.progress() {
                            cb.on_render_error(&e.to_string());
                        }
                        continue;
                    }
                }
            }
            if let Err(e) = job.render_once(request.trigger.as_deref()).await {
                error!("Render failed: {}", e);
            }
        }
    };

    let result: Result<(), MarkPdfError> = tokio::select! {
        result = events => result,
        _ = renders => Ok(()),
    };
    drop(watcher);
    result
}

fn is_content_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

fn file_name_of(path: &Path) -> &Path {
    path.file_name().map(Path::new).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn requests_coalesce_into_one() {
        let slot = RenderSlot::new();
        slot.request(Some(PathBuf::from("a.md")), false);
        slot.request(Some(PathBuf::from("styles.css")), true);
        slot.request(Some(PathBuf::from("a.md")), false);

        let first = slot.next().await;
        assert!(first.refresh);
        assert_eq!(first.trigger, Some(PathBuf::from("a.md")));

        let second = tokio::time::timeout(Duration::from_millis(50), slot.next()).await;
        assert!(second.is_err(), "slot should be empty after one take");
    }

    #[tokio::test]
    async fn request_during_render_is_kept() {
        let slot = RenderSlot::new();
        slot.request(None, false);
        let _ = slot.next().await;

        slot.request(Some(PathBuf::from("a.md")), false);
        let next = tokio::time::timeout(Duration::from_millis(50), slot.next())
            .await
            .unwrap();
        assert!(!next.refresh);
    }

    #[test]
    fn change_settles_after_quiet_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# one").unwrap();

        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        debouncer.touch(path.clone(), start);

        assert!(debouncer.settled(start + Duration::from_millis(100)).is_empty());
        assert_eq!(debouncer.settled(start + Duration::from_millis(500)), vec![path]);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn further_writes_restart_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# one").unwrap();

        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        debouncer.touch(path.clone(), start);

        std::fs::write(&path, "# one, now longer").unwrap();
        assert!(debouncer.settled(start + Duration::from_millis(400)).is_empty());
        assert!(debouncer.settled(start + Duration::from_millis(800)).is_empty());
        assert_eq!(debouncer.settled(start + Duration::from_millis(900)), vec![path]);
    }

    #[test]
    fn removed_file_still_settles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("styles.css");

        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        debouncer.touch(path.clone(), start);
        assert_eq!(debouncer.settled(start + Duration::from_secs(1)), vec![path]);
    }

    #[test]
    fn own_write_absorbs_one_unaltered_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.html");
        std::fs::write(&path, "<html></html>").unwrap();

        let own = OwnWrites::default();
        own.record([path.clone()]);

        assert!(own.absorbs(&path));
        assert!(!own.absorbs(&path), "a second change is the user's");
    }

    #[test]
    fn altered_own_write_is_a_real_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("styles.css");
        std::fs::write(&path, "body {}").unwrap();

        let own = OwnWrites::default();
        own.record([path.clone()]);
        std::fs::write(&path, "body { margin: 0; }").unwrap();

        assert!(!own.absorbs(&path));
        assert!(!own.absorbs(&dir.path().join("report.html")));
    }

    #[test]
    fn access_events_are_ignored() {
        use notify::event::{AccessKind, CreateKind, ModifyKind};
        assert!(!is_content_event(&EventKind::Access(AccessKind::Any)));
        assert!(is_content_event(&EventKind::Create(CreateKind::File)));
        assert!(is_content_event(&EventKind::Modify(ModifyKind::Any)));
    }
}
