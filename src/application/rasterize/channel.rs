//! Rendezvous channels between the renderer (producer) and the response
//! (consumer).
//!
//! A channel is created per request, never reused, and removed exactly once
//! through [`ChannelRelease`], which also runs on drop so that every exit
//! path cleans up.

use std::{
    any::Any,
    fmt,
    path::{Path, PathBuf},
    pin::Pin,
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::ResourceError;

pub type ChannelReader = Pin<Box<dyn AsyncRead + Send>>;
pub type ChannelWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Default capacity for in-memory channels, matching a Linux pipe buffer.
pub const DEFAULT_MEMORY_CAPACITY: usize = 64 * 1024;

/// Where the producer writes its output.
pub enum OutputTarget {
    /// A filesystem node the renderer opens by path.
    Path(PathBuf),
    /// An in-process writer; dropping it ends the stream.
    Writer(ChannelWriter),
}

impl OutputTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            OutputTarget::Path(_) => "path",
            OutputTarget::Writer(_) => "in-memory",
        }
    }
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Path(path) => f.debug_tuple("Path").field(path).finish(),
            OutputTarget::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Allocates a fresh rendezvous channel per call.
pub trait ChannelBroker: Send + Sync {
    fn acquire(&self) -> Result<RendezvousChannel, ResourceError>;
}

/// A write end owned by the bridge rather than the renderer. While it is
/// alive the consumer never sees end-of-stream, so it has to be dropped as
/// soon as the producer is done.
pub struct ProducerHold {
    _end: Option<Box<dyn Any + Send>>,
}

impl ProducerHold {
    pub fn none() -> Self {
        Self { _end: None }
    }

    pub fn new(end: impl Any + Send) -> Self {
        Self {
            _end: Some(Box::new(end)),
        }
    }

    pub fn finish(self) {
        drop(self);
    }
}

/// Removes the channel's filesystem node. Idempotent; also runs on drop.
#[derive(Debug)]
pub struct ChannelRelease {
    path: Option<PathBuf>,
}

impl ChannelRelease {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Nothing to remove, e.g. for in-memory channels.
    pub fn none() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn release(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!(
                target = "application::rasterize::channel",
                op = "channel::release",
                channel = %path.display(),
                "Rendezvous channel removed"
            ),
            // The response is already committed at this point; a stale node is
            // only worth a log line.
            Err(err) => warn!(
                target = "application::rasterize::channel",
                op = "channel::release",
                result = "error",
                channel = %path.display(),
                error = %err,
                "Failed to remove rendezvous channel"
            ),
        }
    }
}

impl Drop for ChannelRelease {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct RendezvousChannel {
    label: String,
    target: OutputTarget,
    reader: ChannelReader,
    hold: ProducerHold,
    release: ChannelRelease,
}

/// A channel taken apart so that both sides can run concurrently.
pub struct ChannelParts {
    pub target: OutputTarget,
    pub reader: ChannelReader,
    pub hold: ProducerHold,
    pub release: ChannelRelease,
}

impl RendezvousChannel {
    pub fn new(
        label: impl Into<String>,
        target: OutputTarget,
        reader: ChannelReader,
        hold: ProducerHold,
        release: ChannelRelease,
    ) -> Self {
        Self {
            label: label.into(),
            target,
            reader,
            hold,
            release,
        }
    }

    /// Human-readable identity for logs: the path, or a memory token.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn path(&self) -> Option<&Path> {
        self.release.path()
    }

    pub fn into_parts(self) -> ChannelParts {
        ChannelParts {
            target: self.target,
            reader: self.reader,
            hold: self.hold,
            release: self.release,
        }
    }
}

impl fmt::Debug for RendezvousChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousChannel")
            .field("label", &self.label)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// URL-safe token from 16 random bytes.
pub fn random_token() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// Bounded in-process pipe with the same contract as a FIFO: writes wait for
/// the reader to drain, and dropping the writer ends the stream.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    capacity: usize,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl ChannelBroker for MemoryBroker {
    fn acquire(&self) -> Result<RendezvousChannel, ResourceError> {
        let (writer, reader) = tokio::io::duplex(self.capacity);
        Ok(RendezvousChannel::new(
            format!("memory:{}", random_token()),
            OutputTarget::Writer(Box::pin(writer)),
            Box::pin(reader),
            ProducerHold::none(),
            ChannelRelease::none(),
        ))
    }
}

#[cfg(unix)]
pub use fifo::{FIFO_PREFIX, FifoBroker};

#[cfg(unix)]
mod fifo {
    use std::{
        ffi::CString,
        io::{self, ErrorKind},
        os::unix::ffi::OsStrExt,
        path::{Path, PathBuf},
    };

    use tokio::net::unix::pipe;
    use tracing::debug;

    use super::{
        ChannelBroker, ChannelRelease, OutputTarget, ProducerHold, RendezvousChannel,
        ResourceError, random_token,
    };

    pub const FIFO_PREFIX: &str = "rasterize-";

    /// Named pipes under a directory, one per request.
    #[derive(Debug, Clone)]
    pub struct FifoBroker {
        dir: PathBuf,
    }

    impl FifoBroker {
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self { dir: dir.into() }
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        fn next_path(&self) -> PathBuf {
            self.dir.join(format!("{FIFO_PREFIX}{}", random_token()))
        }
    }

    impl ChannelBroker for FifoBroker {
        /// Must be called from within a tokio runtime.
        fn acquire(&self) -> Result<RendezvousChannel, ResourceError> {
            let path = self.next_path();
            make_fifo(&path).map_err(|err| ResourceError::new(&path, err))?;
            // From here on the node is removed on every exit path.
            let release = ChannelRelease::new(&path);

            // A non-blocking open for reading succeeds without a writer, and
            // once it exists the write end below opens without blocking too.
            let reader = pipe::OpenOptions::new()
                .open_receiver(&path)
                .map_err(|err| ResourceError::new(&path, err))?;
            let hold = pipe::OpenOptions::new()
                .open_sender(&path)
                .map_err(|err| ResourceError::new(&path, err))?;

            debug!(
                target = "application::rasterize::channel",
                op = "channel::acquire",
                channel = %path.display(),
                "Rendezvous channel created"
            );

            Ok(RendezvousChannel::new(
                path.display().to_string(),
                OutputTarget::Path(path),
                Box::pin(reader),
                ProducerHold::new(hold),
                release,
            ))
        }
    }

    fn make_fifo(path: &Path) -> io::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "path contains null byte"))?;

        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn tokens_are_url_safe_and_distinct() {
        let first = random_token();
        let second = random_token();
        assert_ne!(first, second);
        assert_eq!(first.len(), 22);
        assert!(
            first
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "token is not url-safe: {first}"
        );
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("node");
        std::fs::write(&path, b"").expect("write node");

        let mut release = ChannelRelease::new(&path);
        release.release();
        assert!(!path.exists());
        release.release();
        assert!(release.path().is_none());
    }

    #[test]
    fn dropping_release_removes_node() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("node");
        std::fs::write(&path, b"").expect("write node");

        drop(ChannelRelease::new(&path));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn memory_channel_ends_when_writer_drops() {
        let channel = MemoryBroker::new(4).acquire().expect("memory channel");
        assert!(channel.label().starts_with("memory:"));
        assert!(channel.path().is_none());

        let ChannelParts {
            target, mut reader, ..
        } = channel.into_parts();
        let OutputTarget::Writer(mut writer) = target else {
            panic!("memory channel must hand out a writer");
        };

        let producer = tokio::spawn(async move {
            // Larger than the capacity: completes only while the reader drains.
            writer.write_all(b"rendered image bytes").await.expect("write");
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.expect("read");
        producer.await.expect("producer task");
        assert_eq!(received, b"rendered image bytes");
    }

    #[cfg(unix)]
    mod fifo {
        use std::os::unix::fs::{FileTypeExt, PermissionsExt};

        use super::*;

        #[tokio::test]
        async fn acquire_creates_owner_only_fifo() {
            let dir = tempfile::tempdir().expect("temp dir");
            let broker = FifoBroker::new(dir.path());
            let channel = broker.acquire().expect("fifo channel");

            let path = channel.path().expect("fifo path").to_path_buf();
            assert!(path.starts_with(dir.path()));
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            assert!(name.starts_with(FIFO_PREFIX), "unexpected name: {name}");

            let metadata = std::fs::metadata(&path).expect("metadata");
            assert!(metadata.file_type().is_fifo());
            assert_eq!(metadata.permissions().mode() & 0o077, 0);

            drop(channel);
            assert!(!path.exists(), "fifo must be removed on drop");
        }

        #[tokio::test]
        async fn bytes_written_by_path_reach_reader() {
            let dir = tempfile::tempdir().expect("temp dir");
            let channel = FifoBroker::new(dir.path()).acquire().expect("fifo");
            let ChannelParts {
                target,
                mut reader,
                hold,
                mut release,
            } = channel.into_parts();
            let OutputTarget::Path(path) = target else {
                panic!("fifo channel must hand out a path");
            };

            let producer = tokio::spawn(async move {
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .await
                    .expect("open fifo for writing");
                file.write_all(b"\x89PNG").await.expect("write");
                drop(file);
                hold.finish();
            });

            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.expect("read");
            producer.await.expect("producer task");
            assert_eq!(received, b"\x89PNG");

            let path = release.path().expect("path").to_path_buf();
            release.release();
            assert!(!path.exists());
        }

        #[tokio::test]
        async fn reader_sees_end_of_stream_when_producer_never_opens() {
            let dir = tempfile::tempdir().expect("temp dir");
            let channel = FifoBroker::new(dir.path()).acquire().expect("fifo");
            let ChannelParts {
                mut reader, hold, ..
            } = channel.into_parts();

            hold.finish();
            let mut received = Vec::new();
            let read = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                reader.read_to_end(&mut received),
            )
            .await
            .expect("reader must not hang")
            .expect("read");
            assert_eq!(read, 0);
        }

        #[tokio::test]
        async fn acquire_in_missing_directory_fails_cleanly() {
            let dir = tempfile::tempdir().expect("temp dir");
            let missing = dir.path().join("does-not-exist");
            let err = FifoBroker::new(&missing)
                .acquire()
                .expect_err("missing directory");
            assert!(err.path.starts_with(&missing));
            assert!(!missing.exists());
        }
    }
}
