//! PDF rendering: print the served wrapper page to PDF with headless Chromium.
//!
//! ## Readiness instead of a fixed delay
//!
//! The wrapper renders its Markdown client-side after the page loads. Rather
//! than sleeping a fixed time before capture, the browser is given a
//! virtual-time budget: its clock only advances while no network request or
//! timer is pending, so capture happens as soon as deferred rendering has
//! settled, and never later than the budget allows.
//!
//! ## Atomic output
//!
//! The browser prints into a temporary file beside the destination, which is
//! renamed over `<basename>.pdf` only after a successful, non-empty print. A
//! failed render leaves the previous PDF untouched, and the watcher never
//! exposes a half-written file.

use crate::config::JobConfig;
use crate::error::MarkPdfError;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use which::which;

/// Browser binaries tried on `PATH`, in order.
const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
    "msedge",
];

/// Locate the browser: explicit config, then `CHROME_BIN`-style variables,
/// then well-known names on `PATH`, then platform install locations.
pub fn resolve_browser(config: &JobConfig) -> Result<PathBuf, MarkPdfError> {
    if let Some(ref path) = config.browser {
        return Ok(path.clone());
    }

    for var in ["CHROME_BIN", "GOOGLE_CHROME_BIN"] {
        if let Some(path) = env::var_os(var) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    for candidate in BROWSER_CANDIDATES {
        if let Ok(path) = which(candidate) {
            debug!("Using browser {}", path.display());
            return Ok(path);
        }
    }

    #[cfg(target_os = "macos")]
    {
        for candidate in [
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        ] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        for candidate in [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(MarkPdfError::BrowserNotFound)
}

/// Command line for printing `url` into `pdf_path`.
pub fn browser_args(config: &JobConfig, pdf_path: &Path, url: &str) -> Vec<String> {
    let (width, height) = config.window_size;
    let mut args = vec![
        "--headless".to_string(),
        "--disable-gpu".to_string(),
        "--no-pdf-header-footer".to_string(),
        "--run-all-compositor-stages-before-draw".to_string(),
        format!("--virtual-time-budget={}", config.virtual_time_budget_ms),
        format!("--window-size={width},{height}"),
        format!("--print-to-pdf={}", pdf_path.display()),
    ];
    args.extend(config.browser_args.iter().cloned());
    args.push(url.to_string());
    args
}

/// Print the page at `url` to `output`.
///
/// `input` is the Markdown source behind the page; if it has gone missing the
/// browser is not launched at all.
pub async fn render_pdf(
    url: &str,
    input: &Path,
    output: &Path,
    config: &JobConfig,
) -> Result<(), MarkPdfError> {
    if !tokio::fs::try_exists(input).await.unwrap_or(false) {
        return Err(MarkPdfError::InputNotFound {
            path: input.to_path_buf(),
        });
    }

    let browser = resolve_browser(config)?;
    let out_dir = output.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new()
        .prefix(".markpdf-")
        .suffix(".pdf")
        .tempfile_in(out_dir)
        .map_err(|e| MarkPdfError::io(out_dir, e))?
        .into_temp_path();

    let args = browser_args(config, &staging, url);
    debug!(browser = %browser.display(), ?args, "Launching browser");

    let child = Command::new(&browser)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| MarkPdfError::BrowserSpawn {
            path: browser.clone(),
            source: e,
        })?;

    let result = tokio::time::timeout(config.render_timeout(), child.wait_with_output()).await;
    let output_data = match result {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            return Err(MarkPdfError::BrowserSpawn {
                path: browser,
                source: e,
            })
        }
        Err(_) => {
            return Err(MarkPdfError::RenderTimeout {
                secs: config.render_timeout_secs,
            })
        }
    };

    for line in String::from_utf8_lossy(&output_data.stdout).lines() {
        debug!("[Chromium] {}", line);
    }
    let stderr = String::from_utf8_lossy(&output_data.stderr);
    for line in stderr.lines() {
        if output_data.status.success() {
            debug!("[Chromium] {}", line);
        } else {
            warn!("[Chromium] {}", line);
        }
    }

    if !output_data.status.success() {
        let last = stderr.lines().last().unwrap_or("").trim();
        return Err(MarkPdfError::RenderFailed {
            detail: if last.is_empty() {
                format!("browser exited with {}", output_data.status)
            } else {
                format!("browser exited with {}: {}", output_data.status, last)
            },
        });
    }

    let size = tokio::fs::metadata(&staging)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if size == 0 {
        return Err(MarkPdfError::RenderFailed {
            detail: "browser produced no PDF output".to_string(),
        });
    }

    staging
        .persist(output)
        .map_err(|e| MarkPdfError::io(output, e.error))?;
    info!(bytes = size, "PDF saved: {}", output.display());
    Ok(())
}
