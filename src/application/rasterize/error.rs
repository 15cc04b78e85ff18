use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// The rendezvous channel could not be created.
#[derive(Debug, Error)]
#[error("failed to create rendezvous channel `{}`: {source}", path.display())]
pub struct ResourceError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl ResourceError {
    pub fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer unavailable: {0}")]
    Spawn(#[source] io::Error),
    #[error("renderer exited with {exit_code:?}: {diagnostics}")]
    Exit {
        exit_code: Option<i32>,
        diagnostics: String,
    },
    #[error("failed to read input document: {0}")]
    Input(#[source] io::Error),
    #[error("failed to wait for renderer: {0}")]
    Wait(#[source] io::Error),
    #[error("renderer did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("renderer cannot write to {0} output targets")]
    UnsupportedTarget(&'static str),
}

impl RenderError {
    pub fn code(&self) -> &'static str {
        match self {
            RenderError::Spawn(_) => "spawn",
            RenderError::Exit { .. } => "exit_status",
            RenderError::Input(_) => "input",
            RenderError::Wait(_) => "wait",
            RenderError::TimedOut(_) => "timeout",
            RenderError::UnsupportedTarget(_) => "unsupported_target",
        }
    }
}

/// Copying from the channel to the sink failed after `copied` bytes.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("reading rendezvous channel failed after {copied} bytes: {source}")]
    Read {
        copied: u64,
        #[source]
        source: io::Error,
    },
    #[error("writing response failed after {copied} bytes: {source}")]
    Write {
        copied: u64,
        #[source]
        source: io::Error,
    },
}

impl StreamError {
    pub fn copied(&self) -> u64 {
        match self {
            StreamError::Read { copied, .. } | StreamError::Write { copied, .. } => *copied,
        }
    }
}
