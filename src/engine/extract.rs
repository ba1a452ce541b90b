//! Extract and verify pipelines.
//!
//! Each entry is decoded into a temporary file beside its destination and only
//! renamed into place once its size and CRC-32 checked out, so a corrupt entry
//! never leaves data on disk.

use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::options::ExtractOptions;
use super::{open_archive, persist, require_dir, require_file, temp_in, EntryPolicy};
use crate::common::{self, ArchiveEntry};
use crate::compress::{self, DecodeFailure, GZIP_MAGIC};
use crate::error::{ArchiveError, CodecError, Result, ValidationError};
use crate::fsx;
use crate::progress::{Phase, Stop, TaskContext, TaskOutput};

pub(super) struct ExtractJob {
    archive: PathBuf,
    destination: PathBuf,
    opts: ExtractOptions,
}

impl ExtractJob {
    pub(super) fn new(archive: &Path, destination: &Path, opts: ExtractOptions) -> Result<Self> {
        opts.validate()?;
        require_file(archive)?;
        require_dir(destination)?;
        Ok(Self {
            archive: archive.to_path_buf(),
            destination: destination.to_path_buf(),
            opts,
        })
    }

    pub(super) fn run(self, ctx: &TaskContext) -> std::result::Result<TaskOutput, Stop> {
        ctx.set_phase(Phase::Extracting);
        if is_gzip(&self.archive)? {
            return self.run_gzip(ctx);
        }
        let mut reader = open_archive(&self.archive)?;
        let entries = reader.manifest().entries.clone();
        ctx.set_total(entries.len() as u64);

        let password = self.opts.password.as_deref();
        let mut policy = EntryPolicy::new(self.opts.continue_on_error);
        let mut outputs = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            ctx.checkpoint()?;
            match self.extract_one(&mut reader, index, entry, password) {
                Ok(path) => {
                    debug!(entry = %entry.path, "extracted");
                    outputs.push(path);
                }
                Err(e) => policy.fail(&entry.path, e)?,
            }
            ctx.advance(&entry.path);
        }
        let entries_processed = outputs.len() as u64;
        let failures = policy.finish(entries_processed)?;
        Ok(TaskOutput {
            outputs,
            manifest: Some(reader.into_manifest()),
            volumes: None,
            failures,
            entries_processed,
        })
    }

    fn extract_one<R: Read + io::Seek>(
        &self,
        reader: &mut crate::archive::ArchiveReader<R>,
        index: usize,
        entry: &ArchiveEntry,
        password: Option<&str>,
    ) -> Result<PathBuf> {
        let target = fsx::safe_join(&self.destination, &entry.path)?;
        if entry.is_dir() {
            fsx::create_dir_all(&target).map_err(|e| ArchiveError::io(&target, e))?;
            return Ok(target);
        }
        if !self.opts.overwrite && target.exists() {
            return Err(ValidationError::OutputExists(target).into());
        }
        let parent = target.parent().unwrap_or(&self.destination).to_path_buf();
        fsx::create_dir_all(&parent).map_err(|e| ArchiveError::io(&parent, e))?;

        let tmp = temp_in(&parent)?;
        let mut sink = BufWriter::new(tmp);
        reader
            .extract_to(index, password, &mut sink)
            .map_err(|e| attribute(e, &self.archive, &target))?;
        let tmp = sink
            .into_inner()
            .map_err(|e| ArchiveError::io(&target, e.into_error()))?;
        persist(tmp, &target, self.opts.overwrite)?;

        if let Err(e) = fsx::set_unix_permissions(&target, entry.permissions) {
            debug!(path = %target.display(), error = %e, "could not set permissions");
        }
        if let Err(e) = fsx::set_modified(&target, &entry.modified) {
            debug!(path = %target.display(), error = %e, "could not set modification time");
        }
        Ok(target)
    }

    /// A `.gz` archive holds one file, named by its header or after the archive.
    fn run_gzip(self, ctx: &TaskContext) -> std::result::Result<TaskOutput, Stop> {
        ctx.set_total(1);
        ctx.checkpoint()?;
        let file = File::open(&self.archive).map_err(|e| ArchiveError::io(&self.archive, e))?;
        let fallback = self
            .archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());

        let tmp = temp_in(&self.destination)?;
        let mut sink = BufWriter::new(tmp);
        let (name, _) = match compress::gzip_decode(file, &mut sink) {
            Ok(v) => v,
            Err(DecodeFailure::Sink(e)) => return Err(ArchiveError::io(&self.destination, e).into()),
            Err(DecodeFailure::Corrupt(source)) => {
                return Err(CodecError::CorruptPayload {
                    path: fallback,
                    source,
                }
                .into())
            }
            Err(DecodeFailure::Unsupported(method)) => {
                return Err(CodecError::UnsupportedMethod {
                    path: fallback,
                    method,
                }
                .into())
            }
        };
        // only the final component of a stored name is used
        let name = name
            .and_then(|n| {
                common::normalize_path(&n)
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty() && *s != "..")
                    .map(str::to_string)
            })
            .unwrap_or(fallback);
        let target = fsx::safe_join(&self.destination, &name).map_err(ArchiveError::from)?;
        if !self.opts.overwrite && target.exists() {
            return Err(ArchiveError::from(ValidationError::OutputExists(target))
                .for_entry(&name)
                .into());
        }
        let tmp = sink
            .into_inner()
            .map_err(|e| ArchiveError::io(&target, e.into_error()))?;
        persist(tmp, &target, self.opts.overwrite)?;
        ctx.advance(&name);

        Ok(TaskOutput {
            outputs: vec![target],
            entries_processed: 1,
            ..TaskOutput::default()
        })
    }
}

pub(super) struct VerifyJob {
    archive: PathBuf,
    opts: ExtractOptions,
}

impl VerifyJob {
    pub(super) fn new(archive: &Path, opts: ExtractOptions) -> Result<Self> {
        opts.validate()?;
        require_file(archive)?;
        Ok(Self {
            archive: archive.to_path_buf(),
            opts,
        })
    }

    pub(super) fn run(self, ctx: &TaskContext) -> std::result::Result<TaskOutput, Stop> {
        ctx.set_phase(Phase::Verifying);
        let mut reader = open_archive(&self.archive)?;
        let entries = reader.manifest().entries.clone();
        ctx.set_total(entries.len() as u64);

        let password = self.opts.password.as_deref();
        let mut policy = EntryPolicy::new(self.opts.continue_on_error);
        let mut verified = 0u64;
        for (index, entry) in entries.iter().enumerate() {
            ctx.checkpoint()?;
            match reader.extract_to(index, password, io::sink()) {
                Ok(_) => verified += 1,
                Err(e) => policy.fail(&entry.path, attribute(e, &self.archive, &self.archive))?,
            }
            ctx.advance(&entry.path);
        }
        let failures = policy.finish(verified)?;
        Ok(TaskOutput {
            manifest: Some(reader.into_manifest()),
            failures,
            entries_processed: verified,
            ..TaskOutput::default()
        })
    }
}

/// Archive read failures name the archive; failures writing the decoded bytes
/// name the destination file.
fn attribute(e: ArchiveError, archive: &Path, target: &Path) -> ArchiveError {
    match e {
        ArchiveError::Codec(CodecError::Io(source)) => ArchiveError::io(archive, source),
        ArchiveError::Io { source, .. } => ArchiveError::io(target, source),
        other => other,
    }
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(ArchiveError::io(path, e)),
    }
}
