//! Progress-callback trait for job lifecycle events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::JobConfigBuilder::progress_callback`] to receive events
//! as the job prepares its working files, starts the content server, renders
//! and post-processes the PDF, watches for changes and cleans up.
//!
//! The library itself only logs through `tracing`; the callback is where a
//! front end turns events into status lines, spinners or notifications.
//!
//! # Example
//!
//! ```rust
//! use markpdf::{JobConfig, JobProgressCallback};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct RenderCounter {
//!     renders: AtomicUsize,
//! }
//!
//! impl JobProgressCallback for RenderCounter {
//!     fn on_render_complete(&self, output: &Path, duration_ms: u64) {
//!         let n = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("render #{n}: {} in {duration_ms}ms", output.display());
//!     }
//! }
//!
//! let config = JobConfig::builder()
//!     .progress_callback(Arc::new(RenderCounter { renders: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::ToolOutcome;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What happened to a working file during preparation or cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingFileAction {
    /// Written from its template.
    Created,
    /// Already present; left untouched.
    Skipped,
    /// Identical to its template; deleted during cleanup.
    Removed,
    /// Differs from its template; kept during cleanup.
    Preserved,
}

/// A stage of the metadata pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessStage {
    /// `mutool clean`: rewrite and sanitise the PDF.
    Clean,
    /// `mat2 --lightweight`: strip metadata in place.
    Strip,
    /// `exiftool`: write sidecar tags into the PDF.
    Inject,
}

impl PostProcessStage {
    /// The external program backing this stage.
    pub fn tool(&self) -> &'static str {
        match self {
            PostProcessStage::Clean => "mutool",
            PostProcessStage::Strip => "mat2",
            PostProcessStage::Inject => "exiftool",
        }
    }

    /// How to obtain the tool on Debian/Ubuntu-like systems.
    pub fn install_hint(&self) -> &'static str {
        match self {
            PostProcessStage::Clean => "sudo apt-get install mupdf-tools",
            PostProcessStage::Strip => "pip install mat2",
            PostProcessStage::Inject => "sudo apt-get install libimage-exiftool-perl",
        }
    }
}

impl fmt::Display for PostProcessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PostProcessStage::Clean => "clean",
            PostProcessStage::Strip => "strip",
            PostProcessStage::Inject => "inject",
        };
        f.write_str(name)
    }
}

/// Called by the job as it moves through its lifecycle.
///
/// Implementations must be `Send + Sync`. All methods have default no-op
/// implementations so callers only override what they care about.
pub trait JobProgressCallback: Send + Sync {
    /// A working file was created, skipped, removed or preserved.
    fn on_working_file(&self, path: &Path, action: WorkingFileAction) {
        let _ = (path, action);
    }

    /// The content server is being launched.
    fn on_server_starting(&self, port: u16, livereload_port: u16, url: &str) {
        let _ = (port, livereload_port, url);
    }

    /// The content server accepted a connection.
    fn on_server_ready(&self, url: &str) {
        let _ = url;
    }

    /// A render is starting. `trigger` is the changed file, or None for the first render.
    fn on_render_start(&self, trigger: Option<&Path>) {
        let _ = trigger;
    }

    /// The PDF was written (post-processing included).
    fn on_render_complete(&self, output: &Path, duration_ms: u64) {
        let _ = (output, duration_ms);
    }

    /// A render failed; `error` is a human-readable description.
    fn on_render_error(&self, error: &str) {
        let _ = error;
    }

    /// A metadata pipeline stage finished with `outcome`.
    fn on_post_process(&self, stage: PostProcessStage, outcome: ToolOutcome) {
        let _ = (stage, outcome);
    }

    /// The watcher is attached to `paths`.
    fn on_watching(&self, paths: &[PathBuf]) {
        let _ = paths;
    }

    /// Cleanup finished. `skipped` is true when the document lives in the template directory.
    fn on_cleanup_complete(&self, skipped: bool) {
        let _ = skipped;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::JobConfig`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        renders: AtomicUsize,
        stages: Mutex<Vec<(PostProcessStage, ToolOutcome)>>,
    }

    impl JobProgressCallback for Recorder {
        fn on_render_complete(&self, _output: &Path, _duration_ms: u64) {
            self.renders.fetch_add(1, Ordering::SeqCst);
        }

        fn on_post_process(&self, stage: PostProcessStage, outcome: ToolOutcome) {
            self.stages.lock().unwrap().push((stage, outcome));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_working_file(Path::new("a.html"), WorkingFileAction::Created);
        cb.on_server_starting(8000, 35729, "http://localhost:8000/a.html");
        cb.on_server_ready("http://localhost:8000/a.html");
        cb.on_render_start(None);
        cb.on_render_error("boom");
        cb.on_watching(&[]);
        cb.on_cleanup_complete(false);
    }

    #[test]
    fn recorder_receives_events() {
        let rec = Recorder::default();
        rec.on_render_complete(Path::new("a.pdf"), 12);
        rec.on_post_process(PostProcessStage::Clean, ToolOutcome::NotInstalled);
        rec.on_post_process(PostProcessStage::Strip, ToolOutcome::Succeeded);

        assert_eq!(rec.renders.load(Ordering::SeqCst), 1);
        let stages = rec.stages.lock().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0], (PostProcessStage::Clean, ToolOutcome::NotInstalled));
    }

    #[test]
    fn stage_tools_and_hints() {
        assert_eq!(PostProcessStage::Clean.tool(), "mutool");
        assert_eq!(PostProcessStage::Strip.tool(), "mat2");
        assert_eq!(PostProcessStage::Inject.tool(), "exiftool");
        assert!(PostProcessStage::Inject.install_hint().contains("exiftool"));
        assert_eq!(PostProcessStage::Strip.to_string(), "strip");
    }
}
