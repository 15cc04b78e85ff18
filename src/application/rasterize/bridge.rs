use std::{sync::Arc, time::Instant};

use metrics::{counter, histogram};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use super::{
    channel::{ChannelBroker, ChannelParts, ChannelReader, RendezvousChannel},
    error::{RenderError, ResourceError, StreamError},
    renderer::{InputStream, Renderer},
};
use crate::domain::format::FormatSpec;

const COPY_CHUNK_BYTES: usize = 32 * 1024;

pub type RenderOutcome = Result<(), RenderError>;
pub type StreamOutcome = Result<u64, StreamError>;

/// Both halves of one request. Neither failure cancels the other half.
#[derive(Debug)]
pub struct BridgeOutcome {
    pub render: RenderOutcome,
    pub stream: StreamOutcome,
}

impl BridgeOutcome {
    pub fn is_success(&self) -> bool {
        self.render.is_ok() && self.stream.is_ok()
    }

    pub fn streamed_bytes(&self) -> u64 {
        match &self.stream {
            Ok(bytes) => *bytes,
            Err(err) => err.copied(),
        }
    }
}

/// Connects a renderer writing into a rendezvous channel with a sink reading
/// out of it, concurrently.
#[derive(Clone)]
pub struct StreamBridge {
    broker: Arc<dyn ChannelBroker>,
    renderer: Arc<dyn Renderer>,
}

impl StreamBridge {
    pub fn new(broker: Arc<dyn ChannelBroker>, renderer: Arc<dyn Renderer>) -> Self {
        Self { broker, renderer }
    }

    /// Acquire the channel up front so allocation failures can still be
    /// reported before the response is committed.
    pub fn open(&self) -> Result<RendezvousChannel, ResourceError> {
        self.broker.acquire().inspect_err(|err| {
            error!(
                target = "application::rasterize::bridge",
                op = "bridge::open",
                result = "error",
                error = %err,
                "Failed to allocate rendezvous channel"
            );
        })
    }

    /// Acquire a channel and run both halves to completion.
    pub async fn bridge<W>(
        &self,
        input: InputStream,
        sink: &mut W,
        spec: &FormatSpec,
    ) -> Result<BridgeOutcome, ResourceError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let channel = self.open()?;
        Ok(self.run(channel, input, sink, spec).await)
    }

    /// Run the renderer and the copy into `sink` concurrently, then release
    /// the channel and shut the sink down. Returns only once both halves
    /// have finished and the channel is gone.
    pub async fn run<W>(
        &self,
        channel: RendezvousChannel,
        input: InputStream,
        sink: &mut W,
        spec: &FormatSpec,
    ) -> BridgeOutcome
    where
        W: AsyncWrite + Unpin + Send,
    {
        let label = channel.label().to_string();
        let ChannelParts {
            target,
            reader,
            hold,
            mut release,
        } = channel.into_parts();
        let started_at = Instant::now();

        let renderer = Arc::clone(&self.renderer);
        let producer = async move {
            let render_started = Instant::now();
            let outcome = renderer.render(input, target, spec).await;
            // Once the producer is done nothing else writes; let the reader
            // reach end-of-stream.
            hold.finish();
            histogram!("pdfrasterizer_render_ms").record(render_started.elapsed().as_millis() as f64);
            outcome
        };
        let consumer = copy_channel(reader, sink);

        let (render, stream) = tokio::join!(producer, consumer);
        release.release();

        let outcome = BridgeOutcome { render, stream };
        log_outcome(&label, &outcome, started_at);
        // The sink may already be gone; its failure is in `outcome.stream`.
        let _ = sink.shutdown().await;
        outcome
    }
}

async fn copy_channel<W>(mut reader: ChannelReader, sink: &mut W) -> StreamOutcome
where
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut copied = 0u64;
    loop {
        let read = reader
            .read(&mut buf)
            .await
            .map_err(|source| StreamError::Read { copied, source })?;
        if read == 0 {
            break;
        }
        sink.write_all(&buf[..read])
            .await
            .map_err(|source| StreamError::Write { copied, source })?;
        copied += read as u64;
    }
    sink.flush()
        .await
        .map_err(|source| StreamError::Write { copied, source })?;
    Ok(copied)
}

fn log_outcome(label: &str, outcome: &BridgeOutcome, started_at: Instant) {
    let elapsed_ms = started_at.elapsed().as_millis() as u64;
    let streamed = outcome.streamed_bytes();
    histogram!("pdfrasterizer_streamed_bytes").record(streamed as f64);

    if let Err(err) = &outcome.render {
        counter!("pdfrasterizer_render_failures_total", "reason" => err.code()).increment(1);
        error!(
            target = "application::rasterize::bridge",
            op = "bridge::run",
            result = "render_error",
            channel = label,
            elapsed_ms,
            streamed_bytes = streamed,
            error_code = err.code(),
            error = %err,
            "Renderer failed"
        );
    }

    if let Err(err) = &outcome.stream {
        counter!("pdfrasterizer_stream_failures_total").increment(1);
        warn!(
            target = "application::rasterize::bridge",
            op = "bridge::run",
            result = "stream_error",
            channel = label,
            elapsed_ms,
            streamed_bytes = streamed,
            error = %err,
            "Streaming rendered image failed"
        );
    }

    if outcome.is_success() {
        info!(
            target = "application::rasterize::bridge",
            op = "bridge::run",
            result = "ok",
            channel = label,
            elapsed_ms,
            streamed_bytes = streamed,
            "Rendered image streamed"
        );
    }
}
