//! Run-scoped workspaces
//!
//! Every execution gets its own directory under the configured root. The
//! directory name comes from `tempfile` and the file names are fixed, so no part
//! of a path is ever derived from submitted code or the language string.
//!
//! Removal is tied to [`Workspace`]'s lifetime: [`Workspace::close`] removes it
//! and reports failures, and `Drop` removes it on every other path (errors,
//! panics, a cancelled execute future). A host crash or SIGKILL of the engine
//! itself leaves the directory behind; sweeping the root at startup is left to
//! deployment tooling.

use crate::language::Language;
use crate::{FuturideError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const DIR_PREFIX: &str = "futuride-";
const SOURCE_STEM: &str = "main";
const BINARY_NAME: &str = "main";
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Isolated directory owned by a single execution
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    source_file: PathBuf,
    binary_file: Option<PathBuf>,
}

impl Workspace {
    /// Create a workspace under `root` and write `code` into its source file.
    ///
    /// A failure is retried once before it is reported.
    pub fn create(root: &Path, language: Language, code: &str) -> Result<Self> {
        match Self::try_create(root, language, code) {
            Ok(workspace) => Ok(workspace),
            Err(first) => {
                tracing::warn!(error = %first, "workspace creation failed, retrying once");
                std::thread::sleep(RETRY_DELAY);
                Self::try_create(root, language, code).map_err(|e| {
                    FuturideError::Workspace(format!("failed to create workspace: {e}"))
                })
            }
        }
    }

    fn try_create(root: &Path, language: Language, code: &str) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir_in(root)?;

        let source_file = dir
            .path()
            .join(format!("{SOURCE_STEM}.{}", language.extension()));
        fs::write(&source_file, code)?;

        let binary_file = matches!(language, Language::C).then(|| dir.path().join(BINARY_NAME));

        tracing::debug!(path = ?dir.path(), %language, "workspace created");

        Ok(Self {
            dir,
            source_file,
            binary_file,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    /// Output path for compiled languages
    #[must_use]
    pub fn binary_file(&self) -> Option<&Path> {
        self.binary_file.as_deref()
    }

    /// Remove the workspace now, reporting failures instead of swallowing them
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| {
            FuturideError::Workspace(format!("failed to remove {}: {e}", path.display()))
        })?;
        tracing::debug!(?path, "workspace removed");
        Ok(())
    }
}
