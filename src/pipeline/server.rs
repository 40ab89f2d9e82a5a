//! Content server supervision: launch the Markdown-serving HTTP process and
//! wait until it accepts connections.
//!
//! The server (markserv by default) renders the document and serves the
//! wrapper HTML from the document's directory. Its stdout/stderr are drained
//! into `tracing` at debug level; an undrained pipe would eventually block a
//! chatty server.
//!
//! On Unix the server leads its own process group. The default command is a
//! launcher (`npx`) whose child is the real server, so shutdown signals the
//! whole group: SIGTERM first, SIGKILL for whatever is left after the grace
//! period.

use crate::config::JobConfig;
use crate::error::MarkPdfError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// How long the server group gets to exit after SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running content server bound to `port`.
#[derive(Debug)]
pub struct ContentServer {
    child: Child,
    /// Process group led by the server; None once it has been stopped.
    group: Option<u32>,
    port: u16,
    livereload_port: u16,
}

/// Full argument list for the content server.
pub fn server_args(config: &JobConfig, port: u16, livereload_port: u16) -> Vec<String> {
    let mut args = config.server_args.clone();
    args.extend([
        "--port".to_string(),
        port.to_string(),
        "--no-browser".to_string(),
        "--silent".to_string(),
        "--livereloadport".to_string(),
        livereload_port.to_string(),
    ]);
    args
}

impl ContentServer {
    /// Launch the server in `dir`. Does not wait for readiness.
    pub fn spawn(
        dir: &Path,
        port: u16,
        livereload_port: u16,
        config: &JobConfig,
    ) -> Result<Self, MarkPdfError> {
        let args = server_args(config, port, livereload_port);
        debug!(program = %config.server_program, ?args, "Spawning content server");

        let mut cmd = Command::new(&config.server_program);
        cmd.args(&args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| MarkPdfError::ServerSpawn {
                program: config.server_program.clone(),
                source: e,
            })?;

        if let Some(out) = child.stdout.take() {
            drain(out, "stdout");
        }
        if let Some(err) = child.stderr.take() {
            drain(err, "stderr");
        }

        Ok(Self {
            group: child.id(),
            child,
            port,
            livereload_port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn livereload_port(&self) -> u16 {
        self.livereload_port
    }

    /// URL under which the server exposes `filename`.
    pub fn url_for(&self, filename: &str) -> String {
        format!("http://localhost:{}/{}", self.port, filename)
    }

    /// Poll until the server accepts a TCP connection.
    ///
    /// Tries `attempts` times, sleeping `interval` between tries. Fails early
    /// if the server process exits.
    pub async fn wait_until_ready(
        &mut self,
        attempts: u32,
        interval: Duration,
    ) -> Result<(), MarkPdfError> {
        for attempt in 1..=attempts {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(MarkPdfError::ServerExited { status });
            }

            match TcpStream::connect(("localhost", self.port)).await {
                Ok(_) => {
                    info!(port = self.port, attempt, "Content server is ready");
                    return Ok(());
                }
                Err(e) => {
                    debug!(port = self.port, attempt, "Content server not ready: {}", e);
                }
            }

            if attempt < attempts {
                sleep(interval).await;
            }
        }

        Err(MarkPdfError::ServerNotReady {
            port: self.port,
            attempts,
        })
    }

    /// Stop the server and everything it launched, then reap it.
    pub async fn shutdown(&mut self) {
        let Some(pid) = self.group.take() else {
            return;
        };
        if let Ok(Some(_)) = self.child.try_wait() {
            // The launcher is gone; its children may not be.
            signal_group(pid, Signal::Kill);
            return;
        }

        if !signal_group(pid, Signal::Term) {
            if let Err(e) = self.child.start_kill() {
                warn!("Failed to stop content server: {}", e);
                return;
            }
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Content server stopped"),
            Ok(Err(e)) => warn!("Failed to reap content server: {}", e),
            Err(_) => {
                warn!("Content server did not exit within {:?}, killing it", SHUTDOWN_GRACE);
                if !signal_group(pid, Signal::Kill) {
                    let _ = self.child.start_kill();
                }
                let _ = self.child.wait().await;
            }
        }
        signal_group(pid, Signal::Kill);
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the launcher.
        if let Some(pid) = self.group.take() {
            signal_group(pid, Signal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Send `signal` to the process group led by `pid`. Returns false when
/// groups are unsupported or the signal could not be delivered.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signo) };
    if rc != 0 {
        debug!(pgid, ?signal, "killpg: {}", std::io::Error::last_os_error());
    }
    rc == 0
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

/// Issue one GET against `url` and return the HTTP status code.
///
/// Used as a sanity check once the port is open; a failure here is only
/// logged since the browser reports its own load errors.
pub async fn probe_url(url: &str) -> Option<u16> {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("HTTP client unavailable: {}", e);
            return None;
        }
    };

    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                debug!(%url, %status, "Wrapper reachable");
            } else {
                warn!(%url, %status, "Content server answered with an error");
            }
            Some(status.as_u16())
        }
        Err(e) => {
            warn!(%url, "Wrapper not reachable: {}", e);
            None
        }
    }
}

fn drain<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream = name, "[server] {}", line);
        }
    });
}
