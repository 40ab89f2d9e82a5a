//! Working-directory preparation: materialise the HTML wrapper and the
//! stylesheet next to the document, and remove them again on cleanup.
//!
//! ## Policy
//!
//! Preparation is skip-if-exists: a wrapper or stylesheet already present in
//! the document's directory is never overwritten, only reported. Cleanup
//! deletes a working file only when its bytes equal what preparation would
//! write today (template with the placeholder substituted); anything else is
//! treated as a user customisation and preserved.

use crate::error::MarkPdfError;
use crate::progress::{JobProgressCallback, WorkingFileAction};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the HTML wrapper template inside the template directory.
pub const WRAPPER_TEMPLATE: &str = "index.html";

/// File name of the stylesheet, both as template and as working copy.
pub const STYLESHEET: &str = "styles.css";

/// Token in the wrapper template replaced by the document's file name.
pub const PLACEHOLDER: &str = "MARKDOWN_FILE";

/// Substitute the first placeholder in `template` with `doc_filename`.
pub fn render_wrapper(template: &str, doc_filename: &str) -> String {
    template.replacen(PLACEHOLDER, doc_filename, 1)
}

/// The pair of generated files owned by a job.
#[derive(Debug, Clone)]
pub struct WorkingFiles {
    template_dir: PathBuf,
    doc_dir: PathBuf,
    doc_filename: String,
    wrapper: PathBuf,
    stylesheet: PathBuf,
}

impl WorkingFiles {
    /// Working files for `doc_filename` in `doc_dir`, whose wrapper is named `<basename>.html`.
    pub fn new(
        template_dir: impl Into<PathBuf>,
        doc_dir: impl Into<PathBuf>,
        doc_filename: impl Into<String>,
        basename: &str,
    ) -> Self {
        let doc_dir = doc_dir.into();
        Self {
            template_dir: template_dir.into(),
            wrapper: doc_dir.join(format!("{basename}.html")),
            stylesheet: doc_dir.join(STYLESHEET),
            doc_dir,
            doc_filename: doc_filename.into(),
        }
    }

    pub fn wrapper_path(&self) -> &Path {
        &self.wrapper
    }

    pub fn stylesheet_path(&self) -> &Path {
        &self.stylesheet
    }

    /// File name of the wrapper, as requested from the content server.
    pub fn wrapper_filename(&self) -> String {
        self.wrapper
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn wrapper_template(&self) -> PathBuf {
        self.template_dir.join(WRAPPER_TEMPLATE)
    }

    pub fn stylesheet_template(&self) -> PathBuf {
        self.template_dir.join(STYLESHEET)
    }

    /// Whether the document lives in the template directory, where the
    /// working files must never be cleaned up.
    pub fn in_template_dir(&self) -> bool {
        same_dir(&self.doc_dir, &self.template_dir)
    }

    /// Whether `path` is one of the two working files.
    pub fn is_support_file(&self, path: &Path) -> bool {
        path == self.wrapper || path == self.stylesheet
    }

    /// Working files that do not currently exist.
    pub async fn missing(&self) -> Vec<PathBuf> {
        let mut absent = Vec::new();
        for path in [&self.wrapper, &self.stylesheet] {
            if !exists(path).await {
                absent.push(path.clone());
            }
        }
        absent
    }

    /// Create whichever working files are missing.
    ///
    /// Fails before touching the document directory if either template is
    /// absent. Returns what happened to each working file.
    pub async fn prepare(
        &self,
        progress: Option<&dyn JobProgressCallback>,
    ) -> Result<Vec<(PathBuf, WorkingFileAction)>, MarkPdfError> {
        let wrapper_template = self.wrapper_template();
        let stylesheet_template = self.stylesheet_template();
        for template in [&wrapper_template, &stylesheet_template] {
            if !is_file(template).await {
                return Err(MarkPdfError::TemplateNotFound {
                    path: template.clone(),
                });
            }
        }

        let mut actions = Vec::with_capacity(2);

        if exists(&self.wrapper).await {
            warn!("{} already exists, skipping creation", self.wrapper.display());
            report(progress, &self.wrapper, WorkingFileAction::Skipped);
            actions.push((self.wrapper.clone(), WorkingFileAction::Skipped));
        } else {
            let template = tokio::fs::read_to_string(&wrapper_template)
                .await
                .map_err(|e| MarkPdfError::io(&wrapper_template, e))?;
            tokio::fs::write(&self.wrapper, render_wrapper(&template, &self.doc_filename))
                .await
                .map_err(|e| MarkPdfError::io(&self.wrapper, e))?;
            info!("Created {} (HTML wrapper)", self.wrapper.display());
            report(progress, &self.wrapper, WorkingFileAction::Created);
            actions.push((self.wrapper.clone(), WorkingFileAction::Created));
        }

        if exists(&self.stylesheet).await {
            warn!("{} already exists, skipping creation", self.stylesheet.display());
            report(progress, &self.stylesheet, WorkingFileAction::Skipped);
            actions.push((self.stylesheet.clone(), WorkingFileAction::Skipped));
        } else {
            tokio::fs::copy(&stylesheet_template, &self.stylesheet)
                .await
                .map_err(|e| MarkPdfError::io(&self.stylesheet, e))?;
            info!("Created {} (PDF styles)", self.stylesheet.display());
            report(progress, &self.stylesheet, WorkingFileAction::Created);
            actions.push((self.stylesheet.clone(), WorkingFileAction::Created));
        }

        Ok(actions)
    }

    /// Remove working files that still match their templates.
    ///
    /// Best effort: failures are logged, never returned. Returns what
    /// happened to each file that was examined. Nothing is examined when the
    /// document lives in the template directory.
    pub async fn cleanup(
        &self,
        progress: Option<&dyn JobProgressCallback>,
    ) -> Vec<(PathBuf, WorkingFileAction)> {
        let mut actions = Vec::new();

        if self.in_template_dir() {
            info!("Skipped cleanup (working in template directory)");
            return actions;
        }

        let files = [
            (&self.wrapper, self.wrapper_template(), true),
            (&self.stylesheet, self.stylesheet_template(), false),
        ];

        for (target, template, substitute) in files {
            let action = match self.classify(target, &template, substitute).await {
                Some(a) => a,
                None => continue,
            };
            if action == WorkingFileAction::Removed {
                if let Err(e) = tokio::fs::remove_file(target).await {
                    warn!("Failed to remove {}: {}", target.display(), e);
                    continue;
                }
                info!("Removed {} (unchanged from template)", target.display());
            } else {
                info!("Preserved {} (contains customizations)", target.display());
            }
            report(progress, target, action);
            actions.push((target.clone(), action));
        }

        actions
    }

    /// Removed if `target` equals the expected template output, Preserved if
    /// it differs or the template is unreadable, None if `target` is absent.
    async fn classify(
        &self,
        target: &Path,
        template: &Path,
        substitute: bool,
    ) -> Option<WorkingFileAction> {
        let current = match tokio::fs::read(target).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Not cleaning {}: {}", target.display(), e);
                return None;
            }
        };

        let expected = match tokio::fs::read(template).await {
            Ok(bytes) if substitute => match String::from_utf8(bytes) {
                Ok(text) => render_wrapper(&text, &self.doc_filename).into_bytes(),
                Err(_) => return Some(WorkingFileAction::Preserved),
            },
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Template {} unreadable ({}); keeping {}",
                    template.display(),
                    e,
                    target.display()
                );
                return Some(WorkingFileAction::Preserved);
            }
        };

        if current == expected {
            Some(WorkingFileAction::Removed)
        } else {
            Some(WorkingFileAction::Preserved)
        }
    }
}

fn report(progress: Option<&dyn JobProgressCallback>, path: &Path, action: WorkingFileAction) {
    if let Some(cb) = progress {
        cb.on_working_file(path, action);
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEMPLATE: &str = "<html><body><zero-md src=\"MARKDOWN_FILE\"></zero-md></body></html>";
    const CSS: &str = "@page { size: Letter; margin: 0.5in; }\n";

    fn setup() -> (TempDir, TempDir, WorkingFiles) {
        let tools = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        std::fs::write(tools.path().join(WRAPPER_TEMPLATE), TEMPLATE).unwrap();
        std::fs::write(tools.path().join(STYLESHEET), CSS).unwrap();
        let files = WorkingFiles::new(tools.path(), docs.path(), "report.md", "report");
        (tools, docs, files)
    }

    #[test]
    fn placeholder_substituted_once() {
        assert_eq!(
            render_wrapper("a MARKDOWN_FILE b MARKDOWN_FILE", "x.md"),
            "a x.md b MARKDOWN_FILE"
        );
        assert_eq!(render_wrapper("no token", "x.md"), "no token");
    }

    #[test]
    fn paths_derive_from_basename() {
        let files = WorkingFiles::new("/opt/tool", "/docs", "report.md", "report");
        assert_eq!(files.wrapper_path(), Path::new("/docs/report.html"));
        assert_eq!(files.stylesheet_path(), Path::new("/docs/styles.css"));
        assert_eq!(files.wrapper_filename(), "report.html");
        assert_eq!(files.wrapper_template(), PathBuf::from("/opt/tool/index.html"));
        assert!(files.is_support_file(Path::new("/docs/styles.css")));
        assert!(!files.is_support_file(Path::new("/docs/report.md")));
    }

    #[tokio::test]
    async fn prepare_writes_both_files() {
        let (_tools, docs, files) = setup();
        files.prepare(None).await.unwrap();

        let html = std::fs::read_to_string(docs.path().join("report.html")).unwrap();
        assert!(html.contains("src=\"report.md\""));
        assert!(!html.contains(PLACEHOLDER));
        assert_eq!(std::fs::read_to_string(docs.path().join("styles.css")).unwrap(), CSS);
    }

    #[tokio::test]
    async fn prepare_reports_only_what_it_wrote() {
        let (_tools, docs, files) = setup();
        std::fs::write(docs.path().join("styles.css"), "body {}").unwrap();
        assert_eq!(files.missing().await, vec![docs.path().join("report.html")]);

        let actions = files.prepare(None).await.unwrap();

        assert_eq!(
            actions,
            vec![
                (docs.path().join("report.html"), WorkingFileAction::Created),
                (docs.path().join("styles.css"), WorkingFileAction::Skipped),
            ]
        );
        assert!(files.missing().await.is_empty());
    }

    #[tokio::test]
    async fn prepare_is_idempotent_and_keeps_edits() {
        let (_tools, docs, files) = setup();
        files.prepare(None).await.unwrap();
        std::fs::write(docs.path().join("styles.css"), "body { color: red; }").unwrap();
        let html_before = std::fs::read(docs.path().join("report.html")).unwrap();

        files.prepare(None).await.unwrap();

        assert_eq!(std::fs::read(docs.path().join("report.html")).unwrap(), html_before);
        assert_eq!(
            std::fs::read_to_string(docs.path().join("styles.css")).unwrap(),
            "body { color: red; }"
        );
    }

    #[tokio::test]
    async fn missing_template_fails_without_writing() {
        let (tools, docs, files) = setup();
        std::fs::remove_file(tools.path().join(STYLESHEET)).unwrap();

        let err = files.prepare(None).await.unwrap_err();
        match err {
            MarkPdfError::TemplateNotFound { path } => assert!(path.ends_with(STYLESHEET)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!docs.path().join("report.html").exists());
    }

    #[tokio::test]
    async fn cleanup_removes_untouched_and_preserves_edited() {
        let (_tools, docs, files) = setup();
        files.prepare(None).await.unwrap();
        std::fs::write(docs.path().join("report.html"), "<html>mine</html>").unwrap();

        let actions = files.cleanup(None).await;

        assert!(docs.path().join("report.html").exists());
        assert!(!docs.path().join("styles.css").exists());
        assert!(actions.contains(&(docs.path().join("report.html"), WorkingFileAction::Preserved)));
        assert!(actions.contains(&(docs.path().join("styles.css"), WorkingFileAction::Removed)));
    }

    #[tokio::test]
    async fn cleanup_preserves_when_template_vanished() {
        let (tools, docs, files) = setup();
        files.prepare(None).await.unwrap();
        std::fs::remove_file(tools.path().join(WRAPPER_TEMPLATE)).unwrap();

        files.cleanup(None).await;

        assert!(docs.path().join("report.html").exists());
    }

    #[tokio::test]
    async fn cleanup_skipped_in_template_directory() {
        let tools = TempDir::new().unwrap();
        std::fs::write(tools.path().join(WRAPPER_TEMPLATE), TEMPLATE).unwrap();
        std::fs::write(tools.path().join(STYLESHEET), CSS).unwrap();
        let files = WorkingFiles::new(tools.path(), tools.path(), "guide.md", "guide");
        files.prepare(None).await.unwrap();

        let actions = files.cleanup(None).await;

        assert!(actions.is_empty());
        assert!(tools.path().join("guide.html").exists());
        assert!(tools.path().join(STYLESHEET).exists());
    }
}
