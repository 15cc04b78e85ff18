//! Client for the pdfrasterizer HTTP service.
//!
//! ```no_run
//! # async fn demo() -> Result<(), pdfrasterizer_client::ClientError> {
//! use pdfrasterizer_client::{Client, TokenSource, LOCALHOST};
//!
//! let client = Client::new(LOCALHOST, TokenSource::None)?;
//! let pdf = std::fs::read("invoice.pdf").unwrap_or_default();
//! let png = client.rasterize_to_png(pdf).await?.bytes().await?;
//! # let _ = png;
//! # Ok(())
//! # }
//! ```

mod token;

use std::io;

use bytes::Bytes;
use reqwest::{
    Body, Response, StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue},
};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

pub use token::{TOKEN_ENV, TokenError, TokenSource};

/// Hosted service endpoint.
pub const REMOTE: &str = "https://function61.com/api/pdfrasterizer";
/// A server started locally with the default listener settings.
pub const LOCALHOST: &str = "http://localhost";

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to obtain bearer token: {0}")]
    Token(#[from] TokenError),
    #[error("invalid base URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("bearer token is not a valid header value")]
    InvalidToken,
    #[error("rasterization request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("rasterization request failed: server responded {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to read rasterized image: {0}")]
    Body(#[source] reqwest::Error),
    #[error("failed to write rasterized image: {0}")]
    Output(#[source] io::Error),
}

/// Output image formats the service can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    endpoint: Url,
    bearer: Option<HeaderValue>,
}

impl Client {
    /// Resolve the token and the endpoint. Nothing touches the network here, so a
    /// missing token is reported before any request is attempted.
    pub fn new(base_url: &str, token: TokenSource) -> Result<Self, ClientError> {
        let bearer = token
            .resolve()?
            .map(|token| {
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ClientError::InvalidToken)
            })
            .transpose()?;
        let endpoint = rasterize_endpoint(base_url)?;
        let http = reqwest::Client::builder()
            .user_agent(Self::user_agent())
            .build()
            .map_err(ClientError::Request)?;

        Ok(Self {
            http,
            endpoint,
            bearer,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("pdfrasterizer-client/", env!("CARGO_PKG_VERSION"))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn rasterize_to_png(
        &self,
        pdf: impl Into<Body>,
    ) -> Result<RasterizedImage, ClientError> {
        self.rasterize(pdf, ImageFormat::Png).await
    }

    pub async fn rasterize_to_jpeg(
        &self,
        pdf: impl Into<Body>,
    ) -> Result<RasterizedImage, ClientError> {
        self.rasterize(pdf, ImageFormat::Jpeg).await
    }

    pub async fn rasterize(
        &self,
        pdf: impl Into<Body>,
        format: ImageFormat,
    ) -> Result<RasterizedImage, ClientError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, PDF_CONTENT_TYPE)
            .header(ACCEPT, format.content_type())
            .body(pdf);
        if let Some(bearer) = &self.bearer {
            request = request.header(AUTHORIZATION, bearer.clone());
        }

        let response = request.send().await.map_err(ClientError::Request)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        Ok(RasterizedImage { response })
    }
}

/// Streaming handle to a rasterized image; the caller drains it.
#[derive(Debug)]
pub struct RasterizedImage {
    response: Response,
}

impl RasterizedImage {
    pub fn content_type(&self) -> Option<&str> {
        self.response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Next chunk of the image, or `None` once the body is exhausted.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        self.response.chunk().await.map_err(ClientError::Body)
    }

    pub async fn bytes(self) -> Result<Bytes, ClientError> {
        self.response.bytes().await.map_err(ClientError::Body)
    }

    /// Copy the whole image into `writer`, returning the number of bytes written.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.chunk().await? {
            writer.write_all(&chunk).await.map_err(ClientError::Output)?;
            written += chunk.len() as u64;
        }
        writer.flush().await.map_err(ClientError::Output)?;
        Ok(written)
    }
}

fn rasterize_endpoint(base_url: &str) -> Result<Url, ClientError> {
    let mut base = Url::parse(base_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join("rasterize")?)
}
