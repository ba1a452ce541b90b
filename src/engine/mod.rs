//! # Archive Engine
//!
//! Public entry point for every archive operation. Each method checks its
//! inputs synchronously and returns a [`ValidationError`] before any work is
//! scheduled; otherwise it starts the pipeline on its own thread and returns a
//! [`TaskHandle`] right away.
//!
//! Entry-level failures abort the task by default, with the entry path
//! attached. With `continue_on_error` they are collected in
//! [`TaskOutput::failures`](crate::progress::TaskOutput) and the task still
//! produces output for every entry that succeeded.

mod compress;
mod encrypt;
mod extract;
pub mod options;
mod split;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{info, warn};

pub use options::{
    CompressOptions, DecryptOptions, EncryptOptions, ExtractOptions, FormatTag, SplitOptions,
};

use crate::archive::ArchiveReader;
use crate::common::ArchiveManifest;
use crate::error::{ArchiveError, Result, ValidationError};
use crate::progress::{self, EntryFailure, Stop, TaskHandle, TaskKind};

/// Runs archive operations as background tasks.
///
/// The engine holds no state between operations, so one instance can drive
/// any number of concurrent tasks on different archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct Engine;

impl Engine {
    pub fn new() -> Self {
        Engine
    }

    /// Packs `inputs` (files or directory trees) into `output`.
    pub fn compress(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        opts: CompressOptions,
    ) -> Result<TaskHandle> {
        let plan = compress::plan(inputs, output, opts)?;
        info!(inputs = inputs.len(), output = %output.display(), format = %plan.opts.format, "starting compress");
        Ok(progress::spawn(TaskKind::Compress, move |ctx| plan.run(ctx)))
    }

    /// Unpacks every entry of `archive` under `destination`, which must exist.
    pub fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        opts: ExtractOptions,
    ) -> Result<TaskHandle> {
        let job = extract::ExtractJob::new(archive, destination, opts)?;
        info!(archive = %archive.display(), destination = %destination.display(), "starting extract");
        Ok(progress::spawn(TaskKind::Extract, move |ctx| job.run(ctx)))
    }

    /// Reads every entry and checks its CRC-32 without writing anything.
    pub fn verify(&self, archive: &Path, opts: ExtractOptions) -> Result<TaskHandle> {
        let job = extract::VerifyJob::new(archive, opts)?;
        info!(archive = %archive.display(), "starting verify");
        Ok(progress::spawn(TaskKind::Verify, move |ctx| job.run(ctx)))
    }

    /// Seals every entry of `archive`. Writes to `output`, or replaces the
    /// archive when `output` is `None`.
    pub fn encrypt_entries(
        &self,
        archive: &Path,
        output: Option<&Path>,
        opts: EncryptOptions,
    ) -> Result<TaskHandle> {
        let job = encrypt::RewriteJob::encrypt(archive, output, opts)?;
        info!(archive = %archive.display(), "starting encrypt");
        Ok(progress::spawn(TaskKind::Encrypt, move |ctx| job.run(ctx)))
    }

    /// Opens every sealed entry and rewrites the archive in clear.
    pub fn decrypt_entries(
        &self,
        archive: &Path,
        output: Option<&Path>,
        opts: DecryptOptions,
    ) -> Result<TaskHandle> {
        let job = encrypt::RewriteJob::decrypt(archive, output, opts)?;
        info!(archive = %archive.display(), "starting decrypt");
        Ok(progress::spawn(TaskKind::Decrypt, move |ctx| job.run(ctx)))
    }

    /// Cuts `archive` into numbered volumes in `out_dir` (default: next to the archive).
    pub fn split_archive(
        &self,
        archive: &Path,
        out_dir: Option<&Path>,
        opts: SplitOptions,
    ) -> Result<TaskHandle> {
        let job = split::SplitJob::new(archive, out_dir, opts)?;
        info!(archive = %archive.display(), part_size = opts.part_size, "starting split");
        Ok(progress::spawn(TaskKind::Split, move |ctx| job.run(ctx)))
    }

    /// Reassembles the volume set described by `manifest_path` into `output`.
    pub fn join_volumes(&self, manifest_path: &Path, output: &Path) -> Result<TaskHandle> {
        let job = split::JoinJob::new(manifest_path, output)?;
        info!(manifest = %manifest_path.display(), output = %output.display(), "starting join");
        Ok(progress::spawn(TaskKind::Join, move |ctx| job.run(ctx)))
    }

    /// Parses the central directory of `archive`.
    pub fn list(&self, archive: &Path) -> Result<ArchiveManifest> {
        require_file(archive)?;
        Ok(open_archive(archive)?.into_manifest())
    }
}

pub(crate) fn open_archive(path: &Path) -> Result<ArchiveReader<BufReader<File>>> {
    let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    ArchiveReader::new(BufReader::new(file)).map_err(|e| e.at(path))
}

pub(crate) fn require_file(path: &Path) -> std::result::Result<(), ValidationError> {
    if !path.is_file() {
        return Err(ValidationError::SourceNotFound(path.to_path_buf()));
    }
    Ok(())
}

pub(crate) fn require_dir(path: &Path) -> std::result::Result<(), ValidationError> {
    if !path.exists() {
        return Err(ValidationError::DestinationNotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(ValidationError::DestinationNotDirectory(path.to_path_buf()));
    }
    Ok(())
}

/// Directory an output file will be created in. It must already exist.
pub(crate) fn parent_dir(output: &Path) -> std::result::Result<PathBuf, ValidationError> {
    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    require_dir(&dir)?;
    Ok(dir)
}

pub(crate) fn temp_in(dir: &Path) -> Result<NamedTempFile> {
    NamedTempFile::new_in(dir).map_err(|e| ArchiveError::io(dir, e))
}

/// Moves a finished temporary file into place.
pub(crate) fn persist(tmp: NamedTempFile, dest: &Path, overwrite: bool) -> Result<()> {
    if overwrite {
        tmp.persist(dest).map_err(|e| ArchiveError::io(dest, e.error))?;
    } else {
        tmp.persist_noclobber(dest).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                ValidationError::OutputExists(dest.to_path_buf()).into()
            } else {
                ArchiveError::io(dest, e.error)
            }
        })?;
    }
    Ok(())
}

/// Fail-fast or collect, per entry.
pub(crate) struct EntryPolicy {
    continue_on_error: bool,
    failures: Vec<EntryFailure>,
}

impl EntryPolicy {
    pub(crate) fn new(continue_on_error: bool) -> Self {
        Self {
            continue_on_error,
            failures: Vec::new(),
        }
    }

    /// Either records the failure and lets the task go on, or stops the task.
    pub(crate) fn fail(&mut self, path: &str, error: ArchiveError) -> std::result::Result<(), Stop> {
        let error = error.for_entry(path);
        if !self.continue_on_error {
            return Err(Stop::Failed(error));
        }
        warn!(entry = path, error = %error, "skipping entry");
        self.failures.push(EntryFailure {
            path: path.to_string(),
            error,
        });
        Ok(())
    }

    /// Ends the entry stage. Fails with the first collected error when no
    /// entry succeeded at all.
    pub(crate) fn finish(self, succeeded: u64) -> std::result::Result<Vec<EntryFailure>, Stop> {
        if succeeded == 0 {
            if let Some(first) = self.failures.into_iter().next() {
                return Err(Stop::Failed(first.error));
            }
            return Ok(Vec::new());
        }
        Ok(self.failures)
    }
}
