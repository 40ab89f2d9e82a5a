//! # markpdf
//!
//! Turn a Markdown document into a PDF, and keep the PDF current while the
//! document is edited.
//!
//! ## Why this crate?
//!
//! Markdown renderers disagree on extensions, math and diagrams, and PDF
//! engines disagree on typography. Instead of doing either job itself, this
//! crate hands the document to a Markdown-serving HTTP process and prints
//! the served page with headless Chromium, so the PDF looks exactly like the
//! browser preview. What remains is choreography: ports, readiness, a
//! rebuild loop and a tidy exit.
//!
//! ## Pipeline Overview
//!
//! ```text
//! report.md
//!  │
//!  ├─ 1. Prepare  write report.html + styles.css from the templates
//!  ├─ 2. Serve    launch markserv on a free port, wait until it answers
//!  ├─ 3. Render   chromium --print-to-pdf → report.pdf (atomic replace)
//!  ├─ 4. Tag      mutool clean | mat2, then exiftool from report-metadata.md
//!  ├─ 5. Watch    debounce edits, re-render through a single-slot queue
//!  └─ 6. Cleanup  stop the server, drop working files nobody edited
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use markpdf::{shutdown_signal, Job, JobConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = JobConfig::builder()
//!         .template_dir("/usr/share/markpdf")
//!         .build()?;
//!     let mut job = Job::new("docs/report.md", config)?;
//!     // Renders, then watches until Ctrl-C; cleans up either way.
//!     job.run_until(shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `markpdf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! markpdf = { version = "0.3", default-features = false }
//! ```
//!
//! ## External Programs
//!
//! | Program | Required | Used for |
//! |---------|----------|----------|
//! | `npx markserv` | yes | Serving the document and wrapper |
//! | `chromium` / `google-chrome` | yes | Printing to PDF |
//! | `mutool` | no | Sanitising and compressing the PDF |
//! | `mat2` | no | Stripping metadata when mutool is unavailable |
//! | `exiftool` | no | Writing tags from the sidecar |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod watch;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{JobConfig, JobConfigBuilder, DEFAULT_BASE_PORT, DEFAULT_LIVERELOAD_BASE_PORT};
pub use error::{MarkPdfError, ToolOutcome};
pub use job::{document_basename, shutdown_signal, Job};
pub use pipeline::metadata::{parse_sidecar, MetadataTag};
pub use progress::{
    JobProgressCallback, NoopProgressCallback, PostProcessStage, ProgressCallback,
    WorkingFileAction,
};
pub use watch::{RenderRequest, RenderSlot};
