use std::{
    ffi::OsString,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use tokio::{io::AsyncWriteExt, process::ChildStdin, process::Command};
use tracing::{debug, info, warn};

use super::{channel::OutputTarget, error::RenderError};
use crate::domain::format::FormatSpec;

/// Request body as it arrives, chunk by chunk.
pub type InputStream = BoxStream<'static, io::Result<Bytes>>;

/// Bytes of renderer output kept for error reports.
const DIAGNOSTICS_TAIL_BYTES: usize = 2048;

/// Turns a PDF stream into an image written to `target`.
///
/// Implementations must stop writing to `target` before returning.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        input: InputStream,
        target: OutputTarget,
        spec: &FormatSpec,
    ) -> Result<(), RenderError>;
}

/// Runs the Ghostscript executable with the document on stdin and the image
/// written to a path.
#[derive(Debug, Clone)]
pub struct GhostscriptRenderer {
    binary: PathBuf,
    timeout: Duration,
}

impl GhostscriptRenderer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn arguments(output: &Path, spec: &FormatSpec) -> Vec<OsString> {
        vec![
            "-dNOPAUSE".into(),
            "-dBATCH".into(),
            "-o".into(),
            output.as_os_str().to_owned(),
            "-dUseCropBox".into(),
            format!("-r{}", spec.resolution_dpi).into(),
            format!("-dDownScaleFactor={}", spec.downscale_factor).into(),
            format!("-sDEVICE={}", spec.device).into(),
            format!("-dJPEGQ={}", spec.jpeg_quality).into(),
            // Read the document from stdin.
            "-".into(),
        ]
    }
}

#[async_trait]
impl Renderer for GhostscriptRenderer {
    async fn render(
        &self,
        input: InputStream,
        target: OutputTarget,
        spec: &FormatSpec,
    ) -> Result<(), RenderError> {
        let output_path = match target {
            OutputTarget::Path(path) => path,
            other => return Err(RenderError::UnsupportedTarget(other.kind())),
        };

        let started_at = Instant::now();
        let mut child = Command::new(&self.binary)
            .args(Self::arguments(&output_path, spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                warn!(
                    target = "application::rasterize::ghostscript",
                    op = "ghostscript::render",
                    result = "error",
                    error_code = "spawn",
                    binary = %self.binary.display(),
                    error = %err,
                    "Failed to spawn Ghostscript"
                );
                RenderError::Spawn(err)
            })?;

        let stdin = child.stdin.take();
        let running = async move { tokio::join!(feed_stdin(stdin, input), child.wait_with_output()) };

        // Wall-clock limit over the whole run, including time the child spends
        // blocked on a slow reader. Dropping `running` drops the child, which
        // kills it.
        let (fed, output) = match tokio::time::timeout(self.timeout, running).await {
            Ok(finished) => finished,
            Err(_) => {
                warn!(
                    target = "application::rasterize::ghostscript",
                    op = "ghostscript::render",
                    result = "error",
                    error_code = "timeout",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Ghostscript timed out and was killed"
                );
                return Err(RenderError::TimedOut(self.timeout));
            }
        };

        let output = output.map_err(RenderError::Wait)?;

        if !output.status.success() {
            let exit_code = output.status.code();
            let diagnostics = diagnostics(&output);
            warn!(
                target = "application::rasterize::ghostscript",
                op = "ghostscript::render",
                result = "error",
                error_code = "exit_status",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                diagnostics = %diagnostics,
                "Ghostscript invocation failed"
            );
            return Err(RenderError::Exit {
                exit_code,
                diagnostics,
            });
        }

        let input_bytes = match fed {
            Ok(bytes) => bytes,
            Err(FeedError::Input(err)) => {
                warn!(
                    target = "application::rasterize::ghostscript",
                    op = "ghostscript::render",
                    result = "error",
                    error_code = "input",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "Input document stream failed"
                );
                return Err(RenderError::Input(err));
            }
            // Ghostscript stopped reading stdin but still exited cleanly.
            Err(FeedError::Write { written, source }) => {
                debug!(
                    target = "application::rasterize::ghostscript",
                    op = "ghostscript::render",
                    written,
                    error = %source,
                    "Ghostscript closed stdin early"
                );
                written
            }
        };

        info!(
            target = "application::rasterize::ghostscript",
            op = "ghostscript::render",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            device = spec.device,
            input_bytes,
            "Ghostscript rendered document"
        );

        Ok(())
    }
}

enum FeedError {
    Input(io::Error),
    Write { written: u64, source: io::Error },
}

async fn feed_stdin(stdin: Option<ChildStdin>, mut input: InputStream) -> Result<u64, FeedError> {
    let Some(mut stdin) = stdin else {
        return Ok(0);
    };

    let mut written = 0u64;
    while let Some(chunk) = input.next().await {
        let chunk = chunk.map_err(FeedError::Input)?;
        match stdin.write_all(&chunk).await {
            Ok(()) => written += chunk.len() as u64,
            Err(source) => return Err(FeedError::Write { written, source }),
        }
    }

    match stdin.shutdown().await {
        Ok(()) => Ok(written),
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(written),
        Err(source) => Err(FeedError::Write { written, source }),
    }
}

fn diagnostics(output: &Output) -> String {
    let stream = if output.stderr.iter().any(|b| !b.is_ascii_whitespace()) {
        &output.stderr
    } else {
        &output.stdout
    };
    let start = stream.len().saturating_sub(DIAGNOSTICS_TAIL_BYTES);
    String::from_utf8_lossy(&stream[start..]).trim().to_string()
}
