//! Configuration types for a markpdf job.
//!
//! Everything a [`crate::Job`] needs beyond the input path lives in
//! [`JobConfig`], built via its [`JobConfigBuilder`]. The CLI maps its flags
//! (and `MARKPDF_*` environment variables) onto the builder; library callers
//! set only what they care about and rely on the documented defaults.

use crate::error::MarkPdfError;
use crate::progress::{PostProcessStage, ProgressCallback};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default first port probed for the content server.
pub const DEFAULT_BASE_PORT: u16 = 8000;

/// Default first port probed for the content server's live-reload channel.
pub const DEFAULT_LIVERELOAD_BASE_PORT: u16 = 35729;

/// Configuration for a markpdf job.
///
/// Built via [`JobConfig::builder()`] or using [`JobConfig::default()`].
///
/// # Example
/// ```rust
/// use markpdf::JobConfig;
///
/// let config = JobConfig::builder()
///     .template_dir("/usr/share/markpdf")
///     .base_port(9000)
///     .watch(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.base_port, 9000);
/// ```
#[derive(Clone)]
pub struct JobConfig {
    /// Directory holding the `index.html` and `styles.css` templates.
    /// Default: the directory of the running executable.
    pub template_dir: PathBuf,

    /// First port probed for the content server. Default: 8000.
    pub base_port: u16,

    /// First port probed for the live-reload companion port. Default: 35729.
    pub livereload_base_port: u16,

    /// Upper bound on sequential port probes. Default: 100.
    pub max_port_probes: u16,

    /// Connection attempts before the content server is declared dead. Default: 10.
    pub ready_attempts: u32,

    /// Delay between readiness attempts in milliseconds. Default: 1000.
    pub ready_interval_ms: u64,

    /// Program launched as the content server. Default: `npx`.
    pub server_program: String,

    /// Arguments placed before the port flags. Default: `["markserv"]`.
    pub server_args: Vec<String>,

    /// Explicit browser binary. If None, one is auto-detected.
    pub browser: Option<PathBuf>,

    /// Extra arguments appended to the browser command line.
    pub browser_args: Vec<String>,

    /// Virtual-time budget granted to the page before capture, in milliseconds. Default: 10000.
    ///
    /// The browser advances its virtual clock only while the network and
    /// timers are idle, so deferred rendering in the wrapper completes before
    /// the PDF is captured, bounded by this budget.
    pub virtual_time_budget_ms: u64,

    /// Fixed viewport used while laying out the page. Default: 1280x960.
    pub window_size: (u32, u32),

    /// Wall-clock limit on one browser invocation in seconds. Default: 60.
    pub render_timeout_secs: u64,

    /// Wall-clock limit on one metadata tool invocation in seconds. Default: 60.
    pub tool_timeout_secs: u64,

    /// Run the metadata pipeline after each render. Default: true.
    pub post_process: bool,

    /// Program for the clean stage. Default: `mutool`.
    pub mutool_program: String,

    /// Program for the strip stage. Default: `mat2`.
    pub mat2_program: String,

    /// Program for the inject stage. Default: `exiftool`.
    pub exiftool_program: String,

    /// Keep watching after the first render. Default: true.
    pub watch: bool,

    /// A changed file must stay unchanged this long before a render fires. Default: 500.
    pub debounce_ms: u64,

    /// How often a changed file is re-examined while debouncing. Default: 100.
    pub poll_interval_ms: u64,

    /// Receives human-readable progress events. Default: None.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            base_port: DEFAULT_BASE_PORT,
            livereload_base_port: DEFAULT_LIVERELOAD_BASE_PORT,
            max_port_probes: 100,
            ready_attempts: 10,
            ready_interval_ms: 1000,
            server_program: "npx".to_string(),
            server_args: vec!["markserv".to_string()],
            browser: None,
            browser_args: Vec::new(),
            virtual_time_budget_ms: 10_000,
            window_size: (1280, 960),
            render_timeout_secs: 60,
            tool_timeout_secs: 60,
            post_process: true,
            mutool_program: PostProcessStage::Clean.tool().to_string(),
            mat2_program: PostProcessStage::Strip.tool().to_string(),
            exiftool_program: PostProcessStage::Inject.tool().to_string(),
            watch: true,
            debounce_ms: 500,
            poll_interval_ms: 100,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("template_dir", &self.template_dir)
            .field("base_port", &self.base_port)
            .field("livereload_base_port", &self.livereload_base_port)
            .field("max_port_probes", &self.max_port_probes)
            .field("ready_attempts", &self.ready_attempts)
            .field("ready_interval_ms", &self.ready_interval_ms)
            .field("server_program", &self.server_program)
            .field("server_args", &self.server_args)
            .field("browser", &self.browser)
            .field("browser_args", &self.browser_args)
            .field("virtual_time_budget_ms", &self.virtual_time_budget_ms)
            .field("window_size", &self.window_size)
            .field("render_timeout_secs", &self.render_timeout_secs)
            .field("tool_timeout_secs", &self.tool_timeout_secs)
            .field("post_process", &self.post_process)
            .field("mutool_program", &self.mutool_program)
            .field("mat2_program", &self.mat2_program)
            .field("exiftool_program", &self.exiftool_program)
            .field("watch", &self.watch)
            .field("debounce_ms", &self.debounce_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn JobProgressCallback>"),
            )
            .finish()
    }
}

impl JobConfig {
    /// Create a new builder for `JobConfig`.
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Program run for `stage`.
    pub fn tool_program(&self, stage: PostProcessStage) -> &str {
        match stage {
            PostProcessStage::Clean => &self.mutool_program,
            PostProcessStage::Strip => &self.mat2_program,
            PostProcessStage::Inject => &self.exiftool_program,
        }
    }
}

/// Directory of the running executable, falling back to the working directory.
fn default_template_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Builder for [`JobConfig`].
#[derive(Debug)]
pub struct JobConfigBuilder {
    config: JobConfig,
}

impl JobConfigBuilder {
    pub fn template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.template_dir = dir.into();
        self
    }

    pub fn base_port(mut self, port: u16) -> Self {
        self.config.base_port = port;
        self
    }

    pub fn livereload_base_port(mut self, port: u16) -> Self {
        self.config.livereload_base_port = port;
        self
    }

    pub fn max_port_probes(mut self, n: u16) -> Self {
        self.config.max_port_probes = n.max(1);
        self
    }

    pub fn ready_attempts(mut self, n: u32) -> Self {
        self.config.ready_attempts = n;
        self
    }

    pub fn ready_interval_ms(mut self, ms: u64) -> Self {
        self.config.ready_interval_ms = ms;
        self
    }

    /// Replace the content server command. `args` go before the port flags.
    pub fn server_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.config.server_program = program.into();
        self.config.server_args = args;
        self
    }

    pub fn browser(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.browser = Some(path.into());
        self
    }

    pub fn browser_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.browser_args.push(arg.into());
        self
    }

    pub fn virtual_time_budget_ms(mut self, ms: u64) -> Self {
        self.config.virtual_time_budget_ms = ms;
        self
    }

    pub fn window_size(mut self, width: u32, height: u32) -> Self {
        self.config.window_size = (width, height);
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs;
        self
    }

    pub fn tool_timeout_secs(mut self, secs: u64) -> Self {
        self.config.tool_timeout_secs = secs;
        self
    }

    pub fn post_process(mut self, v: bool) -> Self {
        self.config.post_process = v;
        self
    }

    /// Run `program` instead of the stock tool for `stage`.
    pub fn tool_program(mut self, stage: PostProcessStage, program: impl Into<String>) -> Self {
        let program = program.into();
        match stage {
            PostProcessStage::Clean => self.config.mutool_program = program,
            PostProcessStage::Strip => self.config.mat2_program = program,
            PostProcessStage::Inject => self.config.exiftool_program = program,
        }
        self
    }

    pub fn watch(mut self, v: bool) -> Self {
        self.config.watch = v;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.debounce_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<JobConfig, MarkPdfError> {
        let c = &self.config;
        if c.base_port == 0 || c.livereload_base_port == 0 {
            return Err(MarkPdfError::InvalidConfig(
                "Base ports must be non-zero".into(),
            ));
        }
        if c.ready_attempts == 0 {
            return Err(MarkPdfError::InvalidConfig(
                "Readiness attempts must be ≥ 1".into(),
            ));
        }
        if c.server_program.trim().is_empty() {
            return Err(MarkPdfError::InvalidConfig(
                "Content server program must not be empty".into(),
            ));
        }
        if [&c.mutool_program, &c.mat2_program, &c.exiftool_program]
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return Err(MarkPdfError::InvalidConfig(
                "Metadata tool programs must not be empty".into(),
            ));
        }
        if c.render_timeout_secs == 0 || c.tool_timeout_secs == 0 {
            return Err(MarkPdfError::InvalidConfig(
                "Timeouts must be at least one second".into(),
            ));
        }
        if c.poll_interval_ms == 0 {
            return Err(MarkPdfError::InvalidConfig(
                "Poll interval must be non-zero".into(),
            ));
        }
        Ok(self.config)
    }
}
