//! Internal pipeline stages.
//!
//! Each sub-module owns one step of a job:
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`port`] | Find free ports for the content server |
//! | [`workdir`] | Create and clean up the wrapper HTML and stylesheet |
//! | [`server`] | Launch the content server and wait for readiness |
//! | [`render`] | Print the served page to PDF with headless Chromium |
//! | [`tool`] | Run optional external tools with timeout and not-found handling |
//! | [`metadata`] | Clean, strip and tag the PDF |
//!
//! These are `pub` so integration tests and advanced callers can reuse
//! individual stages.

pub mod metadata;
pub mod port;
pub mod render;
pub mod server;
pub mod tool;
pub mod workdir;
