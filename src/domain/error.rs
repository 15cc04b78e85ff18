use thiserror::Error;

use super::request::PDF_CONTENT_TYPE;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unsupported input content type {found:?}; expected `{PDF_CONTENT_TYPE}`")]
    UnsupportedInputType { found: Option<String> },
}

impl DomainError {
    pub fn unsupported_input(found: Option<&str>) -> Self {
        Self::UnsupportedInputType {
            found: found.map(str::to_string),
        }
    }
}
