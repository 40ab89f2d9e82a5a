//! Error types for the markpdf library.
//!
//! Two distinct types reflect two distinct failure modes:
//!
//! * [`MarkPdfError`] is **fatal** for the operation that returned it, e.g.
//!   a missing template or a content server that never came up. At
//!   startup these abort the run; once the watcher is running they are
//!   logged and the next change is awaited.
//!
//! * [`ToolOutcome`] is **non-fatal**. It is the result of invoking an optional
//!   external tool (mutool, mat2, exiftool). A tool that is not installed or
//!   exits nonzero is reported here so the metadata pipeline can fall
//!   through to the next stage instead of aborting.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// All fatal errors returned by the markpdf library.
#[derive(Debug, Error)]
pub enum MarkPdfError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The Markdown document does not exist (or is not a regular file).
    #[error("Markdown file not found: '{path}'")]
    InputNotFound { path: PathBuf },

    /// A template shipped with the tool is missing.
    #[error("Template file not found: '{path}'\nSet --template-dir or MARKPDF_TEMPLATE_DIR to the directory holding index.html and styles.css.")]
    TemplateNotFound { path: PathBuf },

    // ── Content server errors ─────────────────────────────────────────────
    /// No bindable port was found within the probe bound.
    #[error("No free port found in {attempts} probes starting at {start}")]
    PortRangeExhausted { start: u16, attempts: u16 },

    /// The content server process could not be launched.
    #[error("Failed to launch content server '{program}': {source}\nIs it installed? Try: npm install -g markserv")]
    ServerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The content server exited before it accepted connections.
    #[error("Content server exited before becoming ready ({status})")]
    ServerExited { status: ExitStatus },

    /// The content server did not accept connections in time.
    #[error("Content server not ready on port {port} after {attempts} attempts")]
    ServerNotReady { port: u16, attempts: u32 },

    // ── Browser errors ────────────────────────────────────────────────────
    /// No Chrome/Chromium binary could be located.
    #[error("No Chromium/Chrome binary found.\nInstall chromium or set --browser / MARKPDF_BROWSER.")]
    BrowserNotFound,

    /// The browser process could not be launched.
    #[error("Failed to launch browser '{path}': {source}")]
    BrowserSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The browser exited nonzero or produced no PDF.
    #[error("PDF generation failed: {detail}")]
    RenderFailed { detail: String },

    /// The browser did not finish within the render timeout.
    #[error("PDF generation timed out after {secs}s")]
    RenderTimeout { secs: u64 },

    // ── Metadata errors ───────────────────────────────────────────────────
    /// The tagging tool ran but failed; the PDF keeps its previous metadata.
    #[error("Metadata injection with '{tool}' failed: {detail}")]
    InjectionFailed { tool: String, detail: String },

    /// An external tool failed to launch for a reason other than not being installed.
    #[error("Failed to run '{tool}': {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    // ── Watcher errors ────────────────────────────────────────────────────
    /// The file-system watcher could not be created or attached.
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Reading or writing a file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarkPdfError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MarkPdfError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result of running an optional external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    /// The tool ran and exited zero.
    Succeeded,
    /// The tool binary is not on `PATH`.
    NotInstalled,
    /// The tool exited nonzero (`None` when killed by a signal).
    Failed(Option<i32>),
    /// The tool did not finish within the configured timeout and was killed.
    TimedOut,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Succeeded)
    }
}

impl std::fmt::Display for ToolOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolOutcome::Succeeded => write!(f, "succeeded"),
            ToolOutcome::NotInstalled => write!(f, "not installed"),
            ToolOutcome::Failed(Some(code)) => write!(f, "exited with code {code}"),
            ToolOutcome::Failed(None) => write!(f, "terminated by signal"),
            ToolOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_not_found_names_path() {
        let e = MarkPdfError::TemplateNotFound {
            path: PathBuf::from("/opt/markpdf/index.html"),
        };
        let msg = e.to_string();
        assert!(msg.contains("/opt/markpdf/index.html"), "got: {msg}");
    }

    #[test]
    fn server_not_ready_display() {
        let e = MarkPdfError::ServerNotReady {
            port: 8001,
            attempts: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("8001"));
        assert!(msg.contains("10 attempts"));
    }

    #[test]
    fn port_exhausted_display() {
        let e = MarkPdfError::PortRangeExhausted {
            start: 65530,
            attempts: 6,
        };
        assert!(e.to_string().contains("65530"));
    }

    #[test]
    fn tool_outcome_display() {
        assert_eq!(ToolOutcome::Failed(Some(2)).to_string(), "exited with code 2");
        assert_eq!(ToolOutcome::NotInstalled.to_string(), "not installed");
        assert!(ToolOutcome::Succeeded.is_success());
        assert!(!ToolOutcome::TimedOut.is_success());
    }
}
