use std::env;

use thiserror::Error;

/// Environment variable holding the bearer token for the hosted service.
pub const TOKEN_ENV: &str = "PDFRASTERIZER_TOKEN";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("required environment variable `{0}` is not set")]
    MissingEnv(String),
    #[error("environment variable `{0}` is not valid unicode")]
    InvalidEnv(String),
}

/// Where the client gets its bearer token from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TokenSource {
    /// Read from the named environment variable; it must be set and non-empty.
    Env(String),
    /// Use the supplied token as-is.
    Fixed(String),
    /// Send requests without an `Authorization` header.
    #[default]
    None,
}

impl TokenSource {
    pub fn from_env() -> Self {
        Self::Env(TOKEN_ENV.to_string())
    }

    pub fn fixed(token: impl Into<String>) -> Self {
        Self::Fixed(token.into())
    }

    pub fn resolve(&self) -> Result<Option<String>, TokenError> {
        match self {
            TokenSource::Env(name) => match env::var(name) {
                Ok(value) if !value.trim().is_empty() => Ok(Some(value.trim().to_string())),
                Ok(_) | Err(env::VarError::NotPresent) => Err(TokenError::MissingEnv(name.clone())),
                Err(env::VarError::NotUnicode(_)) => Err(TokenError::InvalidEnv(name.clone())),
            },
            TokenSource::Fixed(token) => Ok(Some(token.clone())),
            TokenSource::None => Ok(None),
        }
    }
}
