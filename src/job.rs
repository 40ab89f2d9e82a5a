//! The lifecycle controller: one conversion run from preparation to cleanup.
//!
//! A [`Job`] owns everything a run creates: the working files beside the
//! document, the allocated ports and the content server process. Its
//! steady-state sequence is
//!
//! ```text
//! prepare → allocate ports → start server → wait ready → render → watch
//!                                                           ↑        │
//!                                                           └────────┘
//! ```
//!
//! Signals are wired by the caller rather than through global state: the
//! entry point owns the job and passes a shutdown future (usually
//! [`shutdown_signal`]) to [`Job::run_until`], which races it against the
//! run and then always cleans up.

use crate::config::JobConfig;
use crate::error::MarkPdfError;
use crate::pipeline::metadata::{post_process, sidecar_path};
use crate::pipeline::port::find_available_port;
use crate::pipeline::render::render_pdf;
use crate::pipeline::server::{probe_url, ContentServer};
use crate::pipeline::workdir::WorkingFiles;
use crate::progress::{JobProgressCallback, WorkingFileAction};
use crate::watch::watch_and_render;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extensions stripped from the document filename to form the basename.
const MARKDOWN_EXTENSIONS: &[&str] = &[".md", ".markdown"];

/// Basename used for the wrapper, PDF and sidecar of `filename`.
///
/// `report.md` → `report`; names without a Markdown extension are used whole.
pub fn document_basename(filename: &str) -> &str {
    for ext in MARKDOWN_EXTENSIONS {
        if filename.len() > ext.len() {
            let split = filename.len() - ext.len();
            if filename.is_char_boundary(split) && filename[split..].eq_ignore_ascii_case(ext) {
                return &filename[..split];
            }
        }
    }
    filename
}

/// State of one conversion run.
pub struct Job {
    input: PathBuf,
    dir: PathBuf,
    filename: String,
    basename: String,
    output: PathBuf,
    sidecar: PathBuf,
    files: WorkingFiles,
    config: JobConfig,
    server: Option<ContentServer>,
    url: Option<String>,
}

impl Job {
    /// Resolve `input` and derive every path the run will touch.
    ///
    /// Nothing is written yet. Fails if `input` is not an existing file.
    pub fn new(input: impl AsRef<Path>, config: JobConfig) -> Result<Self, MarkPdfError> {
        let given = input.as_ref();
        let not_found = || MarkPdfError::InputNotFound {
            path: given.to_path_buf(),
        };

        let input = std::fs::canonicalize(given).map_err(|_| not_found())?;
        if !input.is_file() {
            return Err(not_found());
        }

        let dir = input.parent().map(Path::to_path_buf).ok_or_else(not_found)?;
        let filename = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(not_found)?;
        let basename = document_basename(&filename).to_string();

        let output = dir.join(format!("{basename}.pdf"));
        let sidecar = sidecar_path(&dir, &basename);
        let files = WorkingFiles::new(&config.template_dir, &dir, &filename, &basename);

        debug!(
            input = %input.display(),
            output = %output.display(),
            "Job created"
        );

        Ok(Self {
            input,
            dir,
            filename,
            basename,
            output,
            sidecar,
            files,
            config,
            server: None,
            url: None,
        })
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Directory holding the document and every generated file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar
    }

    pub fn working_files(&self) -> &WorkingFiles {
        &self.files
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Wrapper URL, once the content server is up.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Content server port, once the content server has been launched.
    pub fn port(&self) -> Option<u16> {
        self.server.as_ref().map(ContentServer::port)
    }

    /// Files whose changes trigger a re-render.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        vec![
            self.input.clone(),
            self.files.wrapper_path().to_path_buf(),
            self.files.stylesheet_path().to_path_buf(),
        ]
    }

    pub(crate) fn progress(&self) -> Option<&dyn JobProgressCallback> {
        self.config.progress_callback.as_deref()
    }

    /// Prepare the working files, then launch the content server and wait
    /// until it serves.
    pub async fn start(&mut self) -> Result<(), MarkPdfError> {
        self.files.prepare(self.progress()).await?;

        let probes = self.config.max_port_probes;
        let port = find_available_port(self.config.base_port, probes)?;
        let mut livereload_port = find_available_port(self.config.livereload_base_port, probes)?;
        if livereload_port == port {
            let next = port.checked_add(1).ok_or(MarkPdfError::PortRangeExhausted {
                start: port,
                attempts: 1,
            })?;
            livereload_port = find_available_port(next, probes)?;
        }

        let url = format!("http://localhost:{}/{}", port, self.files.wrapper_filename());
        info!(port, livereload_port, "Starting content server");
        if let Some(cb) = self.progress() {
            cb.on_server_starting(port, livereload_port, &url);
        }

        let server = ContentServer::spawn(&self.dir, port, livereload_port, &self.config)?;
        let server = self.server.insert(server);
        server
            .wait_until_ready(self.config.ready_attempts, self.config.ready_interval())
            .await?;

        probe_url(&url).await;
        if let Some(cb) = self.progress() {
            cb.on_server_ready(&url);
        }
        self.url = Some(url);
        Ok(())
    }

    /// Render the PDF once and run the metadata pipeline on it.
    ///
    /// `trigger` is the file whose change caused this render, if any.
    pub async fn render_once(&self, trigger: Option<&Path>) -> Result<(), MarkPdfError> {
        let url = self.url.as_deref().ok_or_else(|| {
            MarkPdfError::Internal("render requested before the content server was ready".into())
        })?;

        match trigger {
            Some(path) => info!("Change detected in {}, regenerating PDF", path.display()),
            None => info!("Generating PDF"),
        }
        if let Some(cb) = self.progress() {
            cb.on_render_start(trigger);
        }

        let started = Instant::now();
        match self.render_and_tag(url).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(duration_ms, "PDF ready: {}", self.output.display());
                if let Some(cb) = self.progress() {
                    cb.on_render_complete(&self.output, duration_ms);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(cb) = self.progress() {
                    cb.on_render_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn render_and_tag(&self, url: &str) -> Result<(), MarkPdfError> {
        render_pdf(url, &self.input, &self.output, &self.config).await?;
        if self.config.post_process {
            post_process(&self.output, &self.sidecar, &self.config, self.progress()).await?;
        }
        Ok(())
    }

    /// Re-run the preparer, recreating any working file that went missing.
    ///
    /// Returns the files that were written.
    pub async fn refresh_working_files(&self) -> Result<Vec<PathBuf>, MarkPdfError> {
        let actions = self.files.prepare(self.progress()).await?;
        Ok(actions
            .into_iter()
            .filter(|(_, action)| *action == WorkingFileAction::Created)
            .map(|(path, _)| path)
            .collect())
    }

    /// Watch the document and working files, re-rendering on change.
    ///
    /// Returns only if the watcher itself fails.
    pub async fn watch(&self) -> Result<(), MarkPdfError> {
        watch_and_render(self).await
    }

    /// Stop the content server and remove unmodified working files.
    ///
    /// Safe to call more than once and after a partial start.
    pub async fn cleanup(&mut self) {
        info!("Cleaning up");
        if let Some(mut server) = self.server.take() {
            server.shutdown().await;
        }
        self.url = None;

        let skipped = self.files.in_template_dir();
        self.files.cleanup(self.progress()).await;
        if let Some(cb) = self.progress() {
            cb.on_cleanup_complete(skipped);
        }
    }

    /// Start, render, and (unless configured for a single render) watch,
    /// until `shutdown` resolves. Always cleans up before returning.
    ///
    /// Returns `Ok` on shutdown or after a single render completes, and the
    /// first error if startup or the initial render fails.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), MarkPdfError>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            biased;
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            result = self.run() => result,
        };

        if outcome.is_err() {
            debug!("Run failed, cleaning up");
        }
        self.cleanup().await;
        outcome
    }

    async fn run(&mut self) -> Result<(), MarkPdfError> {
        self.start().await?;
        self.render_once(None).await?;
        if !self.config.watch {
            return Ok(());
        }
        let result = self.watch().await;
        if let Err(ref e) = result {
            warn!("Watcher stopped: {}", e);
        }
        result
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("url", &self.url)
            .field("running", &self.server.is_some())
            .finish()
    }
}

/// Resolves on the first SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received interrupt signal"),
        _ = terminate => info!("Received termination signal"),
    }
}
