use std::io;

use async_stream::stream;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, HeaderValue,
        header::{ACCEPT, CONTENT_TYPE},
    },
    response::Response,
};
use bytes::BytesMut;
use futures::{Stream, StreamExt, TryStreamExt};
use metrics::counter;
use tokio::io::{AsyncReadExt, DuplexStream};
use tracing::{Instrument, info_span};

use super::{
    HttpState, RESPONSE_BUFFER_BYTES,
    middleware::{CommittedRender, RequestContext},
};
use crate::{application::error::AppError, domain::request::RenderRequest};

const BODY_CHUNK_BYTES: usize = 16 * 1024;

/// `POST /rasterize`: validate, commit the status line, then stream the image
/// while the renderer is still running.
pub(super) async fn rasterize(
    State(state): State<HttpState>,
    request: Request,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let request_id = parts
        .extensions
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let render_request = RenderRequest::new(
        header_str(&parts.headers, CONTENT_TYPE.as_str()),
        header_str(&parts.headers, ACCEPT.as_str()),
    );
    if let Err(err) = render_request.validate() {
        counter!("pdfrasterizer_rejected_total", "reason" => "content_type").increment(1);
        return Err(err.into());
    }
    let spec = render_request.output_spec();

    // Last point at which a failure can still change the status code.
    let channel = state.bridge.open().inspect_err(|_| {
        counter!("pdfrasterizer_rejected_total", "reason" => "channel").increment(1);
    })?;
    counter!("pdfrasterizer_requests_total", "format" => spec.format.as_str()).increment(1);

    let committed = CommittedRender {
        format: spec.format.as_str(),
        channel: channel.label().to_string(),
    };
    let span = info_span!(
        target: "pdfrasterizer::http::rasterize",
        "rasterize",
        request_id = %request_id,
        format = spec.format.as_str(),
        channel = channel.label(),
    );
    let input = body.into_data_stream().map_err(io::Error::other).boxed();
    let (mut sink, source) = tokio::io::duplex(RESPONSE_BUFFER_BYTES);
    let bridge = state.bridge.clone();
    tokio::spawn(
        async move {
            bridge.run(channel, input, &mut sink, spec).await;
        }
        .instrument(span),
    );

    let mut response = Response::new(Body::from_stream(body_stream(source)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(spec.content_type));
    response.extensions_mut().insert(committed);
    Ok(response)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn body_stream(mut source: DuplexStream) -> impl Stream<Item = io::Result<bytes::Bytes>> {
    stream! {
        let mut buf = BytesMut::with_capacity(BODY_CHUNK_BYTES);
        loop {
            buf.reserve(BODY_CHUNK_BYTES);
            match source.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => yield Ok(buf.split().freeze()),
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
    }
}
