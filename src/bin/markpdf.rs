//! CLI binary for markpdf.
//!
//! A thin shim over the library crate that maps CLI flags to `JobConfig`,
//! prints status lines, and wires Ctrl-C / SIGTERM to the job's cleanup.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use markpdf::{
    shutdown_signal, Job, JobConfig, JobProgressCallback, PostProcessStage, ProgressCallback,
    ToolOutcome, WorkingFileAction,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

fn short(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal status lines, plus a spinner while a render is in flight.
struct CliProgressCallback {
    /// Spinner for the render currently running, if any.
    spinner: Mutex<Option<ProgressBar>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            spinner: Mutex::new(None),
        })
    }

    /// Print above the spinner when one is active so it is not torn.
    fn line(&self, msg: String) {
        let guard = self.spinner.lock().ok();
        match guard.as_ref().and_then(|active| active.as_ref()) {
            Some(bar) => bar.println(msg),
            None => eprintln!("{msg}"),
        }
    }

    fn finish_spinner(&self) {
        if let Ok(mut guard) = self.spinner.lock() {
            if let Some(bar) = guard.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_working_file(&self, path: &Path, action: WorkingFileAction) {
        let name = short(path);
        let msg = match action {
            WorkingFileAction::Created => format!("  {} Created {}", green("✓"), name),
            WorkingFileAction::Skipped => {
                format!("  {} {} already exists, keeping it", yellow("⚠"), name)
            }
            WorkingFileAction::Removed => format!("  {} Removed {}", dim("🗑"), name),
            WorkingFileAction::Preserved => format!(
                "  {} Preserved {} {}",
                cyan("📝"),
                name,
                dim("(contains customizations)")
            ),
        };
        self.line(msg);
    }

    fn on_server_starting(&self, port: u16, livereload_port: u16, _url: &str) {
        self.line(format!(
            "{} Starting content server on port {} {}",
            cyan("◆"),
            bold(&port.to_string()),
            dim(&format!("(live-reload {livereload_port})"))
        ));
    }

    fn on_server_ready(&self, url: &str) {
        self.line(format!("  {} Serving {}", green("✓"), url));
    }

    fn on_render_start(&self, trigger: Option<&Path>) {
        if let Some(path) = trigger {
            self.line(format!("{} {} changed", cyan("↻"), short(path)));
        }

        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_message("Generating PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        if let Ok(mut guard) = self.spinner.lock() {
            if let Some(old) = guard.replace(bar) {
                old.finish_and_clear();
            }
        }
    }

    fn on_render_complete(&self, output: &Path, duration_ms: u64) {
        self.finish_spinner();
        eprintln!(
            "{} PDF saved: {}  {}",
            green("✔"),
            bold(&output.display().to_string()),
            dim(&format!("{:.1}s", duration_ms as f64 / 1000.0)),
        );
    }

    fn on_render_error(&self, error: &str) {
        self.finish_spinner();
        eprintln!("{} {}", red("✘"), red(error));
    }

    fn on_post_process(&self, stage: PostProcessStage, outcome: ToolOutcome) {
        let tool = stage.tool();
        let msg = match outcome {
            ToolOutcome::Succeeded => format!("  {} {} {}", green("✓"), stage, dim(tool)),
            ToolOutcome::NotInstalled => format!(
                "  {} {} not installed, skipping {}  {}",
                yellow("⚠"),
                tool,
                stage,
                dim(stage.install_hint())
            ),
            other => format!("  {} {} {}", red("✗"), tool, other),
        };
        self.line(msg);
    }

    fn on_watching(&self, paths: &[PathBuf]) {
        let names: Vec<String> = paths.iter().map(|p| short(p)).collect();
        eprintln!(
            "{} Watching {} {}",
            cyan("👀"),
            names.join(", "),
            dim("(Ctrl-C to stop)")
        );
    }

    fn on_cleanup_complete(&self, skipped: bool) {
        self.finish_spinner();
        if skipped {
            eprintln!(
                "{} Skipped cleanup {}",
                cyan("◆"),
                dim("(working in template directory)")
            );
        } else {
            eprintln!("{} Cleanup complete", green("✔"));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Render once, then keep report.pdf in sync with report.md
  markpdf docs/report.md

  # Render a single time and exit
  markpdf --once docs/report.md

  # Templates installed somewhere else
  markpdf --template-dir /usr/share/markpdf docs/report.md

  # Containers usually need the sandbox disabled
  markpdf --browser-arg=--no-sandbox docs/report.md

  # Skip mutool / mat2 / exiftool
  markpdf --no-post-process docs/report.md

FILES (next to the document):
  <name>.html            Wrapper page, generated from index.html
  styles.css             Print stylesheet, copied from the template directory
  <name>.pdf             Output
  <name>-metadata.md     Optional "Key: value" lines written into the PDF

  Working files that still match their templates are removed on exit;
  edited ones are kept.

EXTERNAL PROGRAMS:
  Program      Required  Install
  ─────────    ────────  ─────────────────────────────────────────
  markserv     yes       npm install -g markserv  (run through npx)
  chromium     yes       apt-get install chromium
  mutool       no        apt-get install mupdf-tools
  mat2         no        pip install mat2
  exiftool     no        apt-get install libimage-exiftool-perl

ENVIRONMENT VARIABLES:
  MARKPDF_TEMPLATE_DIR   Directory holding index.html and styles.css
  MARKPDF_BROWSER        Browser binary (also CHROME_BIN)
  MARKPDF_MUTOOL         mutool binary (likewise MARKPDF_MAT2, MARKPDF_EXIFTOOL)
  RUST_LOG               Override log filtering (e.g. markpdf=debug)
"#;

/// Convert Markdown to PDF and keep it up to date.
#[derive(Parser, Debug)]
#[command(
    name = "markpdf",
    version,
    about = "Convert Markdown to PDF and keep it up to date",
    long_about = "Convert a Markdown document to PDF by serving it locally and printing it \
with headless Chromium, then regenerate the PDF whenever the document or its stylesheet \
changes. Optional mutool/mat2/exiftool passes sanitise the PDF and write metadata from a \
sidecar file.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Markdown document to convert.
    input: PathBuf,

    /// Directory holding the index.html and styles.css templates.
    #[arg(long, env = "MARKPDF_TEMPLATE_DIR")]
    template_dir: Option<PathBuf>,

    /// First port probed for the content server.
    #[arg(long, env = "MARKPDF_PORT", default_value_t = markpdf::DEFAULT_BASE_PORT)]
    port: u16,

    /// First port probed for the live-reload channel.
    #[arg(long, env = "MARKPDF_LIVERELOAD_PORT", default_value_t = markpdf::DEFAULT_LIVERELOAD_BASE_PORT)]
    livereload_port: u16,

    /// Content server command; the port flags are appended.
    #[arg(long, env = "MARKPDF_SERVER", default_value = "npx markserv")]
    server: String,

    /// Chrome/Chromium binary. Auto-detected if not set.
    #[arg(long, env = "MARKPDF_BROWSER")]
    browser: Option<PathBuf>,

    /// Extra browser argument (repeatable).
    #[arg(long = "browser-arg", allow_hyphen_values = true)]
    browser_args: Vec<String>,

    /// Connection attempts before the content server is declared dead.
    #[arg(long, env = "MARKPDF_READY_ATTEMPTS", default_value_t = 10,
          value_parser = clap::value_parser!(u32).range(1..))]
    ready_attempts: u32,

    /// Milliseconds between readiness attempts.
    #[arg(long, env = "MARKPDF_READY_INTERVAL_MS", default_value_t = 1000)]
    ready_interval_ms: u64,

    /// Milliseconds the page may spend rendering before capture.
    #[arg(long, env = "MARKPDF_VIRTUAL_TIME_BUDGET_MS", default_value_t = 10_000)]
    virtual_time_budget_ms: u64,

    /// Browser timeout per render, in seconds.
    #[arg(long, env = "MARKPDF_RENDER_TIMEOUT", default_value_t = 60)]
    render_timeout: u64,

    /// Timeout per metadata tool invocation, in seconds.
    #[arg(long, env = "MARKPDF_TOOL_TIMEOUT", default_value_t = 60)]
    tool_timeout: u64,

    /// Milliseconds a changed file must stay unchanged before re-rendering.
    #[arg(long, env = "MARKPDF_DEBOUNCE_MS", default_value_t = 500)]
    debounce_ms: u64,

    /// Program used for the clean pass.
    #[arg(long, env = "MARKPDF_MUTOOL", default_value = "mutool")]
    mutool: String,

    /// Program used for the strip pass when clean is unavailable.
    #[arg(long, env = "MARKPDF_MAT2", default_value = "mat2")]
    mat2: String,

    /// Program used to write sidecar metadata.
    #[arg(long, env = "MARKPDF_EXIFTOOL", default_value = "exiftool")]
    exiftool: String,

    /// Skip the mutool / mat2 / exiftool passes.
    #[arg(long, env = "MARKPDF_NO_POST_PROCESS")]
    no_post_process: bool,

    /// Render once and exit instead of watching.
    #[arg(long, env = "MARKPDF_ONCE")]
    once: bool,

    /// Disable status lines and the spinner; log at info level instead.
    #[arg(long, env = "MARKPDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MARKPDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MARKPDF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage errors, including a missing document, exit 1.
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // ── Logging setup ────────────────────────────────────────────────────
    // Status lines already cover what INFO/WARN logs would say.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn JobProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    let mut job = Job::new(&cli.input, config)
        .with_context(|| format!("Cannot convert {}", cli.input.display()))?;

    if show_progress {
        eprintln!(
            "{} {} → {}",
            cyan("◆"),
            bold(job.filename()),
            bold(&short(job.output_path()))
        );
    }

    // ── Run until done or signalled ──────────────────────────────────────
    job.run_until(shutdown_signal())
        .await
        .with_context(|| format!("Failed to convert {}", cli.input.display()))?;

    Ok(())
}

/// Map CLI args to `JobConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<JobConfig> {
    let (program, args) = parse_server(&cli.server)?;

    let mut builder = JobConfig::builder()
        .base_port(cli.port)
        .livereload_base_port(cli.livereload_port)
        .server_command(program, args)
        .ready_attempts(cli.ready_attempts)
        .ready_interval_ms(cli.ready_interval_ms)
        .virtual_time_budget_ms(cli.virtual_time_budget_ms)
        .render_timeout_secs(cli.render_timeout)
        .tool_timeout_secs(cli.tool_timeout)
        .debounce_ms(cli.debounce_ms)
        .post_process(!cli.no_post_process)
        .tool_program(PostProcessStage::Clean, &cli.mutool)
        .tool_program(PostProcessStage::Strip, &cli.mat2)
        .tool_program(PostProcessStage::Inject, &cli.exiftool)
        .watch(!cli.once);

    if let Some(ref dir) = cli.template_dir {
        builder = builder.template_dir(dir);
    }
    if let Some(ref browser) = cli.browser {
        builder = builder.browser(browser);
    }
    for arg in &cli.browser_args {
        builder = builder.browser_arg(arg);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Split `--server` into program and leading arguments.
fn parse_server(s: &str) -> Result<(String, Vec<String>)> {
    let mut parts = s.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("--server must name a program"))?;
    Ok((program, parts.collect()))
}
