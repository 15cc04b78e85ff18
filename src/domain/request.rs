use super::{
    error::DomainError,
    format::{FormatSpec, negotiate},
};

/// The only accepted input media type.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Header-level view of one rasterization call. The document bytes travel
/// separately as a stream.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub content_type: Option<&'a str>,
    pub accept: Option<&'a str>,
}

impl<'a> RenderRequest<'a> {
    pub fn new(content_type: Option<&'a str>, accept: Option<&'a str>) -> Self {
        Self {
            content_type,
            accept,
        }
    }

    /// Reject anything that is not exactly `application/pdf`.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self.content_type {
            Some(PDF_CONTENT_TYPE) => Ok(()),
            other => Err(DomainError::unsupported_input(other)),
        }
    }

    pub fn output_spec(&self) -> &'static FormatSpec {
        negotiate(self.accept)
    }
}
