#![allow(dead_code)]

use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use pdfrasterizer::{
    application::rasterize::{InputStream, OutputTarget, RenderError, Renderer},
    domain::format::FormatSpec,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
pub const JPEG_SIGNATURE: &[u8] = b"\xff\xd8\xff";

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Write the fixed payload.
    Emit(&'static [u8]),
    /// Copy the input document to the output.
    Echo,
    /// Fail without ever opening the output.
    FailBeforeOpen,
    /// Write the payload, then fail.
    FailAfter(&'static [u8]),
}

/// In-process stand-in for Ghostscript that writes to either target kind.
pub struct FakeRenderer {
    behavior: Behavior,
    calls: AtomicUsize,
    targets: Mutex<Vec<Option<PathBuf>>>,
    devices: Mutex<Vec<&'static str>>,
}

impl FakeRenderer {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.targets
            .lock()
            .expect("targets lock")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn devices(&self) -> Vec<&'static str> {
        self.devices.lock().expect("devices lock").clone()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(
        &self,
        mut input: InputStream,
        target: OutputTarget,
        spec: &FormatSpec,
    ) -> Result<(), RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.devices.lock().expect("devices lock").push(spec.device);
        self.targets.lock().expect("targets lock").push(match &target {
            OutputTarget::Path(path) => Some(path.clone()),
            OutputTarget::Writer(_) => None,
        });

        let mut document = Vec::new();
        while let Some(chunk) = input.next().await {
            document.extend_from_slice(&chunk.map_err(RenderError::Input)?);
        }

        let (payload, fail) = match self.behavior {
            Behavior::Emit(payload) => (payload.to_vec(), false),
            Behavior::Echo => (document, false),
            Behavior::FailBeforeOpen => {
                return Err(RenderError::Exit {
                    exit_code: Some(1),
                    diagnostics: "Unrecoverable error, exit code 1".to_string(),
                });
            }
            Behavior::FailAfter(payload) => (payload.to_vec(), true),
        };

        let mut writer = open_target(target).await.map_err(RenderError::Spawn)?;
        // File writes are buffered: a vanished reader may only surface at shutdown.
        let written = match writer.write_all(&payload).await {
            Ok(()) => writer.shutdown().await,
            Err(err) => Err(err),
        };
        drop(writer);
        written.map_err(|err| RenderError::Exit {
            exit_code: Some(1),
            diagnostics: err.to_string(),
        })?;

        if fail {
            return Err(RenderError::Exit {
                exit_code: Some(1),
                diagnostics: "failed after partial output".to_string(),
            });
        }
        Ok(())
    }
}

async fn open_target(
    target: OutputTarget,
) -> std::io::Result<std::pin::Pin<Box<dyn AsyncWrite + Send>>> {
    match target {
        OutputTarget::Writer(writer) => Ok(writer),
        OutputTarget::Path(path) => {
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            Ok(Box::pin(file))
        }
    }
}

/// A shell script that answers like Ghostscript: it drains stdin and writes
/// an image signature matching `-sDEVICE` to the `-o` path.
pub fn fake_ghostscript(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-gs",
        r#"out=""
device=""
prev=""
for arg in "$@"; do
  case "$arg" in
    -sDEVICE=*) device="${arg#-sDEVICE=}" ;;
  esac
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
done
cat > /dev/null
if [ "$device" = "jpeg" ]; then
  printf '\377\330\377\340fake-jpeg' > "$out"
else
  printf '\211PNG\r\n\032\nfake-png' > "$out"
fi
"#,
    )
}

/// A script that rejects every document before opening its output.
pub fn failing_ghostscript(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "failing-gs",
        "cat > /dev/null\necho \"Error: /syntaxerror in --nostringval--\" >&2\nexit 1\n",
    )
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("set perms");
    path
}

/// Entries left behind in a FIFO directory.
pub fn leftover_entries(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .expect("read fifo dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect()
}

/// Formatted log output collected from the current thread.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Install a plain-text subscriber for the current thread. Tasks spawned
    /// on a current-thread runtime log into it as well.
    pub fn install() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("logs lock")).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("logs lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
