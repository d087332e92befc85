// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Transactional environment file writer.
//!
//! Nixopus rewrites service environment files whenever the user changes a
//! setting. A half-written environment file takes a service down on its next
//! restart, so every write goes through [`ConfigWriter`], which guarantees
//! that the file on disk is always either the previous complete version or
//! the new complete version.
//!
//! # Write Procedure
//!
//! 1. Copy any existing file to `<path>.backup`, keeping its permissions and
//!    timestamps. The original is never touched if this fails.
//! 2. Render the new content with keys in sorted order.
//! 3. Write the content to a temporary file in the same directory as the
//!    target, then fsync it.
//! 4. Rename the temporary file over the target. This is the commit point.
//! 5. Sync the parent directory and remove the backup. Failures here are
//!    reported as warnings and do not fail the write.
//!
//! If step 3 or 4 fails, the temporary file is discarded and the backup is
//! copied back over the target. The backup is only left behind when that
//! restore fails too, so the user can recover by hand.
//!
//! Concurrent writers to the same path are not coordinated.

use crate::{
    env::serialize,
    log::{self, SharedLogger},
    path::backup_path,
};

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{self, FileTimes, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::instrument;

/// Filesystem primitives used by [`ConfigWriter`].
///
/// Separates the individual steps of a transactional write so that each of
/// them can be swapped out or made to fail on purpose.
pub trait Persist {
    /// Copy file at `path` to `backup`, preserving metadata.
    fn backup(&self, path: &Path, backup: &Path) -> io::Result<()>;

    /// Write and sync contents into a temporary file next to `path`.
    fn stage(&self, path: &Path, contents: &[u8]) -> io::Result<NamedTempFile>;

    /// Atomically replace `path` with staged temporary file.
    fn commit(&self, staged: NamedTempFile, path: &Path) -> io::Result<()>;

    /// Flush directory entry of committed `path` to disk.
    fn sync_dir(&self, path: &Path) -> io::Result<()>;

    /// Copy `backup` back over `path`.
    fn restore(&self, backup: &Path, path: &Path) -> io::Result<()>;
}

/// Persistence through temporary files and atomic renames.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicPersist;

impl Persist for AtomicPersist {
    fn backup(&self, path: &Path, backup: &Path) -> io::Result<()> {
        fs::copy(path, backup)?;

        let metadata = fs::metadata(path)?;
        let mut times = FileTimes::new().set_modified(metadata.modified()?);
        if let Ok(accessed) = metadata.accessed() {
            times = times.set_accessed(accessed);
        }
        OpenOptions::new().write(true).open(backup)?.set_times(times)?;

        Ok(())
    }

    fn stage(&self, path: &Path, contents: &[u8]) -> io::Result<NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix(".nixopus-")
            .suffix(".tmp")
            .tempfile_in(parent_dir(path))?;

        // INVARIANT: Replacement keeps the permissions of the file it replaces.
        if let Ok(metadata) = fs::metadata(path) {
            staged.as_file().set_permissions(metadata.permissions())?;
        }

        staged.write_all(contents)?;
        staged.flush()?;
        staged.as_file().sync_all()?;

        Ok(staged)
    }

    fn commit(&self, staged: NamedTempFile, path: &Path) -> io::Result<()> {
        // Dropping the persist error drops the temporary file with it.
        staged.persist(path).map_err(|err| err.error)?;

        Ok(())
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        fs::File::open(parent_dir(path))?.sync_all()
    }

    fn restore(&self, backup: &Path, path: &Path) -> io::Result<()> {
        fs::copy(backup, path).map(|_| ())
    }
}

/// Crash-safe writer of environment files.
///
/// See the [module documentation](self) for the write procedure.
pub struct ConfigWriter<P = AtomicPersist>
where
    P: Persist,
{
    persist: P,
    logger: SharedLogger,
}

impl ConfigWriter {
    /// Construct new writer backed by [`AtomicPersist`].
    pub fn new() -> Self {
        Self::with_persist(AtomicPersist)
    }
}

impl Default for ConfigWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ConfigWriter<P>
where
    P: Persist,
{
    /// Construct new writer with custom persistence steps.
    pub fn with_persist(persist: P) -> Self {
        Self {
            persist,
            logger: log::noop(),
        }
    }

    /// Report progress through given logger.
    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Replace file at `path` with rendered `config`.
    ///
    /// # Errors
    ///
    /// - Return [`WriteError::BackupCreationFailed`] if existing file cannot
    ///   be backed up. Target file is left untouched.
    /// - Return [`WriteError::WriteFailed`] if the new content cannot be
    ///   committed. Target file holds its previous content, or does not exist
    ///   if it did not exist before.
    /// - Return [`WriteError::RestoreFailed`] if the new content cannot be
    ///   committed, and the previous content cannot be restored either.
    #[instrument(skip(self, path, config), fields(path = %path.as_ref().display()), level = "debug")]
    pub fn write(&self, path: impl AsRef<Path>, config: &BTreeMap<String, String>) -> Result<()> {
        let path = path.as_ref();
        let backup = backup_path(path);

        let has_backup = path.exists();
        if has_backup {
            self.persist
                .backup(path, &backup)
                .map_err(|source| WriteError::BackupCreationFailed {
                    source,
                    path: path.to_path_buf(),
                    backup: backup.clone(),
                })?;
            self.logger
                .debug(&format!("backed up {} to {}", path.display(), backup.display()));
        }

        let contents = serialize(config);
        let (step, source) = match self.stage_and_commit(path, contents.as_bytes()) {
            Ok(()) => {
                self.logger
                    .debug(&format!("wrote {} entries to {}", config.len(), path.display()));
                if let Err(err) = self.persist.sync_dir(path) {
                    self.logger.warning(&format!(
                        "failed to sync directory of {}: {err}",
                        path.display()
                    ));
                }
                if has_backup {
                    self.discard_backup(&backup);
                }
                return Ok(());
            }
            Err(failure) => failure,
        };

        self.logger
            .error(&format!("failed to {step} {}: {source}", path.display()));
        if !has_backup {
            return Err(WriteError::WriteFailed {
                source,
                step,
                path: path.to_path_buf(),
            });
        }

        if let Err(restore_error) = self.persist.restore(&backup, path) {
            self.logger.error(&format!(
                "failed to restore {} from {}: {restore_error}",
                path.display(),
                backup.display()
            ));
            return Err(WriteError::RestoreFailed {
                restore_error,
                write_error: source,
                step,
                path: path.to_path_buf(),
                backup,
            });
        }

        self.logger
            .warning(&format!("restored {} from {}", path.display(), backup.display()));
        self.discard_backup(&backup);

        Err(WriteError::WriteFailed {
            source,
            step,
            path: path.to_path_buf(),
        })
    }

    fn stage_and_commit(&self, path: &Path, contents: &[u8]) -> Result<(), (WriteStep, io::Error)> {
        fs::create_dir_all(parent_dir(path)).map_err(|err| (WriteStep::CreateDir, err))?;
        let staged = self
            .persist
            .stage(path, contents)
            .map_err(|err| (WriteStep::Stage, err))?;
        self.persist
            .commit(staged, path)
            .map_err(|err| (WriteStep::Commit, err))
    }

    fn discard_backup(&self, backup: &Path) {
        if let Err(err) = fs::remove_file(backup) {
            self.logger
                .warning(&format!("failed to remove backup {}: {err}", backup.display()));
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Step of a write that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    /// Creating the parent directory.
    CreateDir,

    /// Writing and syncing the temporary file.
    Stage,

    /// Renaming the temporary file over the target.
    Commit,
}

impl Display for WriteStep {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::CreateDir => fmt.write_str("create parent directory of"),
            Self::Stage => fmt.write_str("stage new content for"),
            Self::Commit => fmt.write_str("commit new content to"),
        }
    }
}

/// Transactional write error types.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// Existing file could not be backed up, so nothing was written.
    #[error("failed to back up {:?} to {:?}", path.display(), backup.display())]
    BackupCreationFailed {
        #[source]
        source: io::Error,
        path: PathBuf,
        backup: PathBuf,
    },

    /// New content could not be written, previous state is intact.
    #[error("failed to {step} {:?}", path.display())]
    WriteFailed {
        #[source]
        source: io::Error,
        step: WriteStep,
        path: PathBuf,
    },

    /// New content could not be written, and previous content could not be
    /// restored from the backup.
    #[error(
        "failed to {step} {:?} ({write_error}), then failed to restore it from {:?}: {restore_error}",
        path.display(),
        backup.display()
    )]
    RestoreFailed {
        #[source]
        restore_error: io::Error,
        write_error: io::Error,
        step: WriteStep,
        path: PathBuf,
        backup: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = WriteError> = std::result::Result<T, E>;
