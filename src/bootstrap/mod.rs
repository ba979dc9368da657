// src/bootstrap/mod.rs

//! One-shot protocols run at fixed points of a deployment.

pub mod admin_cli;
pub mod firewall;
pub mod handoff;
pub mod subzone;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::rewrite::RewriteError;
use crate::execution::executor::ExecutionError;

pub use admin_cli::AdminCli;
pub use firewall::{FirewallBootstrapper, FirewallSettings};
pub use handoff::{standard_handoffs, BoxedHandoff, Handoff};
pub use subzone::{SubzoneBootstrapper, SubzoneSettings};

/// Name of the file agent-style services poll for
pub const TOKEN_FILE: &str = "token";

/// A protocol the sequencer runs once
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Runs the protocol to completion
    async fn setup(&self) -> Result<(), BootstrapError>;
}

/// Bootstrap errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("External tool failed: {0}")]
    Tool(#[from] ExecutionError),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error("Expected {0} to exist")]
    MissingArtifact(PathBuf),

    #[error("{0}")]
    Configuration(String),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> BootstrapError + '_ {
    move |source| BootstrapError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `token` into `<dir>/token` unless that file already exists.
///
/// Returns whether the file was written. The file is created exclusively, so
/// a concurrent writer can never be overwritten.
pub fn persist_token(dir: &Path, token: &str) -> Result<bool, BootstrapError> {
    let path = dir.join(TOKEN_FILE);
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!("{} already exists, keeping it", path.display());
            return Ok(false);
        }
        Err(e) => return Err(io_error(&path)(e)),
    };

    file.write_all(token.as_bytes()).map_err(io_error(&path))?;
    info!("Wrote bootstrap token to {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn tokens_are_written_once() {
        let dir = tempfile::tempdir().unwrap();

        assert!(persist_token(dir.path(), "first").unwrap());
        assert!(!persist_token(dir.path(), "second").unwrap());
        assert_eq!(fs::read_to_string(dir.path().join(TOKEN_FILE)).unwrap(), "first");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = persist_token(&dir.path().join("absent"), "t").unwrap_err();
        assert!(matches!(err, BootstrapError::Io { .. }));
    }
}
