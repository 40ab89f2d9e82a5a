//! Metadata post-processing: sanitise the PDF, then tag it from a sidecar.
//!
//! ## Stages
//!
//! 1. **Clean**: `mutool clean -d -s -z` rewrites the PDF into a temporary
//!    file (deduplicated objects, sanitised and compressed content streams),
//!    which then atomically replaces the original.
//! 2. **Strip**: if clean did not succeed, `mat2 --lightweight --inplace`
//!    removes metadata in place.
//! 3. **Inject**: when `<basename>-metadata.md` exists, each `Key: value`
//!    line becomes an `exiftool -Key=value` assignment written into the PDF.
//!
//! A missing tool is always a warning and the chain moves on. A failing
//! clean or strip also moves on, since the PDF they were given is still
//! intact. A failing inject is an error: the caller asked for tags that are
//! not in the file.

use crate::config::JobConfig;
use crate::error::{MarkPdfError, ToolOutcome};
use crate::pipeline::tool::run_tool;
use crate::progress::{JobProgressCallback, PostProcessStage};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Tag names accepted from a sidecar.
static RE_TAG_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());

/// One `Key: value` assignment read from a sidecar file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTag {
    pub key: String,
    pub value: String,
}

impl MetadataTag {
    /// The exiftool assignment argument, `-Key=value`.
    pub fn to_arg(&self) -> String {
        format!("-{}={}", self.key, self.value)
    }
}

/// Path of the sidecar metadata file for `basename` in `dir`.
pub fn sidecar_path(dir: &Path, basename: &str) -> PathBuf {
    dir.join(format!("{basename}-metadata.md"))
}

/// Parse sidecar text into tags, one per `Key: value` line.
///
/// The first `:` splits key from value, so values may contain colons. Keys
/// and values are trimmed; an empty value is kept (it clears the tag). Lines
/// without a colon or with a key that is not a tag name are skipped.
pub fn parse_sidecar(text: &str) -> Vec<MetadataTag> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if !RE_TAG_KEY.is_match(key) {
                if !key.is_empty() {
                    debug!("Skipping sidecar line with invalid key: {:?}", line);
                }
                return None;
            }
            Some(MetadataTag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Run the three-stage chain on `pdf`.
///
/// `sidecar` is the metadata file to inject from; it may not exist.
pub async fn post_process(
    pdf: &Path,
    sidecar: &Path,
    config: &JobConfig,
    progress: Option<&dyn JobProgressCallback>,
) -> Result<(), MarkPdfError> {
    let cleaned = clean(pdf, config, progress).await?;
    if !cleaned {
        strip(pdf, config, progress).await?;
    }
    inject(pdf, sidecar, config, progress).await
}

/// Stage 1. Returns whether the PDF was rewritten.
async fn clean(
    pdf: &Path,
    config: &JobConfig,
    progress: Option<&dyn JobProgressCallback>,
) -> Result<bool, MarkPdfError> {
    let stage = PostProcessStage::Clean;
    let dir = pdf.parent().unwrap_or_else(|| Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(".markpdf-clean-")
        .suffix(".pdf")
        .tempfile_in(dir)
        .map_err(|e| MarkPdfError::io(dir, e))?
        .into_temp_path();

    info!("Cleaning PDF with mutool");
    let args: [&OsStr; 6] = [
        OsStr::new("clean"),
        OsStr::new("-d"),
        OsStr::new("-s"),
        OsStr::new("-z"),
        pdf.as_os_str(),
        scratch.as_os_str(),
    ];
    let mut outcome = run_tool(config.tool_program(stage), args, config.tool_timeout()).await?;

    if outcome.is_success() {
        if let Err(e) = scratch.persist(pdf) {
            warn!("Failed to replace {} with cleaned copy: {}", pdf.display(), e.error);
            outcome = ToolOutcome::Failed(None);
        }
    }

    report(progress, stage, outcome);
    match outcome {
        ToolOutcome::Succeeded => {
            info!("PDF cleaned with mutool");
            Ok(true)
        }
        ToolOutcome::NotInstalled => {
            warn!(
                "`mutool` not found, falling back to mat2. To install: {}",
                stage.install_hint()
            );
            Ok(false)
        }
        other => {
            warn!("mutool {}, falling back to mat2", other);
            Ok(false)
        }
    }
}

/// Stage 2. Failure is logged; the PDF is left as the browser produced it.
async fn strip(
    pdf: &Path,
    config: &JobConfig,
    progress: Option<&dyn JobProgressCallback>,
) -> Result<(), MarkPdfError> {
    let stage = PostProcessStage::Strip;
    info!("Stripping PDF metadata with mat2");
    let args: [&OsStr; 3] = [
        OsStr::new("--lightweight"),
        OsStr::new("--inplace"),
        pdf.as_os_str(),
    ];
    let outcome = run_tool(config.tool_program(stage), args, config.tool_timeout()).await?;

    report(progress, stage, outcome);
    match outcome {
        ToolOutcome::Succeeded => info!("Metadata stripped with mat2"),
        ToolOutcome::NotInstalled => warn!(
            "`mat2` not found, skipping metadata stripping. To install: {}",
            stage.install_hint()
        ),
        other => warn!("mat2 {}", other),
    }
    Ok(())
}

/// Stage 3. A no-op without a sidecar or without usable lines in it.
async fn inject(
    pdf: &Path,
    sidecar: &Path,
    config: &JobConfig,
    progress: Option<&dyn JobProgressCallback>,
) -> Result<(), MarkPdfError> {
    let stage = PostProcessStage::Inject;
    let text = match tokio::fs::read_to_string(sidecar).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No metadata file found, skipping metadata injection");
            return Ok(());
        }
        Err(e) => return Err(MarkPdfError::io(sidecar, e)),
    };

    let tags = parse_sidecar(&text);
    if tags.is_empty() {
        info!("No valid metadata in {}", sidecar.display());
        return Ok(());
    }

    info!(tags = tags.len(), "Injecting metadata from {}", sidecar.display());
    let mut args: Vec<String> = tags.iter().map(MetadataTag::to_arg).collect();
    args.push("-overwrite_original".to_string());
    args.push(pdf.display().to_string());

    let outcome = run_tool(config.tool_program(stage), &args, config.tool_timeout()).await?;
    report(progress, stage, outcome);
    match outcome {
        ToolOutcome::Succeeded => {
            info!("Metadata injected");
            Ok(())
        }
        ToolOutcome::NotInstalled => {
            warn!(
                "`exiftool` not found, skipping metadata injection. To install: {}",
                stage.install_hint()
            );
            Ok(())
        }
        other => Err(MarkPdfError::InjectionFailed {
            tool: config.tool_program(stage).to_string(),
            detail: other.to_string(),
        }),
    }
}

fn report(progress: Option<&dyn JobProgressCallback>, stage: PostProcessStage, outcome: ToolOutcome) {
    if let Some(cb) = progress {
        cb.on_post_process(stage, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_line_becomes_assignment() {
        let tags = parse_sidecar("Title: Quarterly Report\n");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].to_arg(), "-Title=Quarterly Report");
    }

    #[test]
    fn only_first_colon_splits() {
        let tags = parse_sidecar("Subject: Q3: revenue and costs");
        assert_eq!(tags[0].key, "Subject");
        assert_eq!(tags[0].value, "Q3: revenue and costs");
    }

    #[test]
    fn skips_noise_and_keeps_empty_values() {
        let text = "# Metadata for the report\r\n\
                    Author:   Ada Lovelace  \r\n\
                    \r\n\
                    just a sentence\r\n\
                    : orphan value\r\n\
                    Keywords:\r\n\
                    Creator: markpdf (https://example.org)\r\n";
        let tags = parse_sidecar(text);
        let args: Vec<String> = tags.iter().map(MetadataTag::to_arg).collect();
        assert_eq!(args, vec![
                "-Author=Ada Lovelace",
                "-Keywords=",
                "-Creator=markpdf (https://example.org)"
            ]);
    }

    #[test]
    fn sidecar_sits_beside_document() {
        assert_eq!(
            sidecar_path(Path::new("/docs"), "report"),
            PathBuf::from("/docs/report-metadata.md")
        );
    }

    #[tokio::test]
    async fn no_sidecar_is_a_no_op() {
        let dir = tempfile::TempDir::new().unwrap();
        let pdf = dir.path().join("a.pdf");
        std::fs::write(&pdf, "%PDF-1.7").unwrap();

        inject(&pdf, &dir.path().join("a-metadata.md"), &JobConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&pdf).unwrap(), "%PDF-1.7");
    }

    // ── Stage chain against stand-in tools ──────────────────────────────

    #[cfg(unix)]
    mod chain {
        use super::*;
        use crate::error::ToolOutcome;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Mutex;
        use tempfile::TempDir;

        const PDF: &str = "%PDF-1.7\n% from the browser\n";

        /// Each tool appends its name to `calls.log` next to the PDF.
        const MUTOOL_OK: &str = r#"echo mutool >> "$(dirname "$5")/calls.log"; printf '%%PDF-1.7\n%% cleaned\n' > "$6""#;
        const MUTOOL_FAILS: &str = r#"echo mutool >> "$(dirname "$5")/calls.log"; echo 'syntax error' >&2; exit 3"#;
        const MAT2_OK: &str = r#"eval "pdf=\${$#}"; echo mat2 >> "$(dirname "$pdf")/calls.log""#;
        const MAT2_FAILS: &str = r#"eval "pdf=\${$#}"; echo mat2 >> "$(dirname "$pdf")/calls.log"; exit 1"#;
        const EXIFTOOL_OK: &str = r#"eval "pdf=\${$#}"; echo exiftool >> "$(dirname "$pdf")/calls.log""#;
        const EXIFTOOL_FAILS: &str = r#"eval "pdf=\${$#}"; echo exiftool >> "$(dirname "$pdf")/calls.log"; exit 2"#;

        const MISSING: &str = "markpdf-test-no-such-tool";

        #[derive(Default)]
        struct Stages(Mutex<Vec<(PostProcessStage, ToolOutcome)>>);

        impl JobProgressCallback for Stages {
            fn on_post_process(&self, stage: PostProcessStage, outcome: ToolOutcome) {
                self.0.lock().unwrap().push((stage, outcome));
            }
        }

        struct Scratch {
            dir: TempDir,
        }

        impl Scratch {
            fn new(sidecar: Option<&str>) -> Self {
                let dir = TempDir::new().unwrap();
                std::fs::write(dir.path().join("a.pdf"), PDF).unwrap();
                if let Some(text) = sidecar {
                    std::fs::write(dir.path().join("a-metadata.md"), text).unwrap();
                }
                Self { dir }
            }

            /// A `sh` script in a `bin/` directory outside the PDF's directory.
            fn tool(&self, name: &str, body: &str) -> String {
                let bin = self.dir.path().join("bin");
                std::fs::create_dir_all(&bin).unwrap();
                let path = bin.join(name);
                std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                path.display().to_string()
            }

            fn pdf(&self) -> PathBuf {
                self.dir.path().join("a.pdf")
            }

            fn sidecar(&self) -> PathBuf {
                self.dir.path().join("a-metadata.md")
            }

            fn calls(&self) -> Vec<String> {
                std::fs::read_to_string(self.dir.path().join("calls.log"))
                    .unwrap_or_default()
                    .lines()
                    .map(str::to_string)
                    .collect()
            }
        }

        fn config(mutool: &str, mat2: &str, exiftool: &str) -> JobConfig {
            JobConfig::builder()
                .tool_program(PostProcessStage::Clean, mutool)
                .tool_program(PostProcessStage::Strip, mat2)
                .tool_program(PostProcessStage::Inject, exiftool)
                .tool_timeout_secs(10)
                .build()
                .unwrap()
        }

        #[tokio::test]
        async fn clean_success_skips_strip() {
            let s = Scratch::new(Some("Title: Q3\n"));
            let c = config(
                &s.tool("mutool", MUTOOL_OK),
                &s.tool("mat2", MAT2_OK),
                &s.tool("exiftool", EXIFTOOL_OK),
            );

            post_process(&s.pdf(), &s.sidecar(), &c, None).await.unwrap();

            assert_eq!(s.calls(), vec!["mutool", "exiftool"]);
            assert!(std::fs::read_to_string(s.pdf()).unwrap().contains("cleaned"));
        }

        #[tokio::test]
        async fn missing_mutool_falls_back_to_mat2() {
            let s = Scratch::new(None);
            let stages = Stages::default();
            let c = config(MISSING, &s.tool("mat2", MAT2_OK), &s.tool("exiftool", EXIFTOOL_OK));

            post_process(&s.pdf(), &s.sidecar(), &c, Some(&stages)).await.unwrap();

            assert_eq!(s.calls(), vec!["mat2"]);
            assert_eq!(std::fs::read_to_string(s.pdf()).unwrap(), PDF);
            assert_eq!(
                *stages.0.lock().unwrap(),
                vec![
                    (PostProcessStage::Clean, ToolOutcome::NotInstalled),
                    (PostProcessStage::Strip, ToolOutcome::Succeeded),
                ]
            );
        }

        #[tokio::test]
        async fn failing_mutool_leaves_pdf_intact_and_falls_back() {
            let s = Scratch::new(None);
            let c = config(
                &s.tool("mutool", MUTOOL_FAILS),
                &s.tool("mat2", MAT2_OK),
                &s.tool("exiftool", EXIFTOOL_OK),
            );

            post_process(&s.pdf(), &s.sidecar(), &c, None).await.unwrap();

            assert_eq!(s.calls(), vec!["mutool", "mat2"]);
            assert_eq!(std::fs::read_to_string(s.pdf()).unwrap(), PDF);
            let leftovers: Vec<_> = std::fs::read_dir(s.dir.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(".markpdf-clean-"))
                .collect();
            assert!(leftovers.is_empty(), "scratch file left behind");
        }

        #[tokio::test]
        async fn failing_mat2_still_injects() {
            let s = Scratch::new(Some("Author: Finance Team\n"));
            let stages = Stages::default();
            let c = config(
                MISSING,
                &s.tool("mat2", MAT2_FAILS),
                &s.tool("exiftool", EXIFTOOL_OK),
            );

            post_process(&s.pdf(), &s.sidecar(), &c, Some(&stages)).await.unwrap();

            assert_eq!(s.calls(), vec!["mat2", "exiftool"]);
            let stages = stages.0.lock().unwrap();
            assert!(matches!(stages[1], (PostProcessStage::Strip, ToolOutcome::Failed(Some(1)))));
            assert_eq!(stages[2], (PostProcessStage::Inject, ToolOutcome::Succeeded));
        }

        #[tokio::test]
        async fn failing_exiftool_is_an_injection_error() {
            let s = Scratch::new(Some("Title: Q3\n"));
            let exiftool = s.tool("exiftool", EXIFTOOL_FAILS);
            let c = config(MISSING, MISSING, &exiftool);

            let err = post_process(&s.pdf(), &s.sidecar(), &c, None).await.unwrap_err();

            match err {
                MarkPdfError::InjectionFailed { tool, .. } => assert_eq!(tool, exiftool),
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(std::fs::read_to_string(s.pdf()).unwrap(), PDF);
        }

        #[tokio::test]
        async fn missing_exiftool_is_only_a_warning() {
            let s = Scratch::new(Some("Title: Q3\n"));
            let c = config(MISSING, MISSING, MISSING);

            post_process(&s.pdf(), &s.sidecar(), &c, None).await.unwrap();

            assert!(s.calls().is_empty());
            assert_eq!(std::fs::read_to_string(s.pdf()).unwrap(), PDF);
        }
    }
}
