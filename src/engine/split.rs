//! Split and join pipelines over volume files.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::options::SplitOptions;
use super::{parent_dir, persist, require_dir, require_file, temp_in};
use crate::error::{ArchiveError, Result, ValidationError};
use crate::progress::{Phase, Stop, TaskContext, TaskOutput};
use crate::volume::{FileJoiner, FileSplitter, VolumeManifest};

/// Splits `src` into parts inside `dir`, named after `src`.
pub(super) fn split_file(
    src: &Path,
    dir: &Path,
    part_size: u64,
    ctx: Option<&TaskContext>,
) -> std::result::Result<(VolumeManifest, Vec<PathBuf>), Stop> {
    let base_name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ValidationError::SourceNotFound(src.to_path_buf()))?;
    split_named(src, &base_name, dir, part_size, ctx)
}

/// Splits `src` into `<base_name>.NNN` parts inside `dir`. With a task
/// context, cancellation is checked before every part and each part counts as
/// one progress unit; the parts written so far are removed when the split does
/// not finish.
pub(super) fn split_named(
    src: &Path,
    base_name: &str,
    dir: &Path,
    part_size: u64,
    ctx: Option<&TaskContext>,
) -> std::result::Result<(VolumeManifest, Vec<PathBuf>), Stop> {
    let len = fs::metadata(src).map_err(|e| ArchiveError::io(src, e))?.len();
    let file = File::open(src).map_err(|e| ArchiveError::io(src, e))?;
    let mut splitter = FileSplitter::new(BufReader::new(file), len, dir, base_name, part_size)?;
    if let Some(ctx) = ctx {
        ctx.set_total(splitter.expected_parts());
    }

    loop {
        if let Some(ctx) = ctx {
            if let Err(stop) = ctx.checkpoint() {
                splitter.discard();
                return Err(stop);
            }
        }
        let wrote = splitter.write_next().map(|info| info.is_some());
        match wrote {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                splitter.discard();
                return Err(e.into());
            }
        }
        if let (Some(ctx), Some(part)) = (ctx, splitter.written().last()) {
            ctx.advance(&part.file_name().unwrap_or_default().to_string_lossy());
        }
        // no cancellation point after the last part
        if splitter.written().len() as u64 == splitter.expected_parts() {
            break;
        }
    }

    let mut files = splitter.written().to_vec();
    let (manifest, manifest_path) = splitter.finish()?;
    files.push(manifest_path);
    debug!(parts = manifest.volumes.len(), "split complete");
    Ok((manifest, files))
}

pub(super) struct SplitJob {
    archive: PathBuf,
    out_dir: PathBuf,
    part_size: u64,
}

impl SplitJob {
    pub(super) fn new(archive: &Path, out_dir: Option<&Path>, opts: SplitOptions) -> Result<Self> {
        opts.validate()?;
        require_file(archive)?;
        let len = fs::metadata(archive).map_err(|e| ArchiveError::io(archive, e))?.len();
        if len == 0 {
            return Err(ValidationError::EmptyStream.into());
        }
        let out_dir = match out_dir {
            Some(dir) => {
                require_dir(dir)?;
                dir.to_path_buf()
            }
            None => parent_dir(archive)?,
        };
        Ok(Self {
            archive: archive.to_path_buf(),
            out_dir,
            part_size: opts.part_size,
        })
    }

    pub(super) fn run(self, ctx: &TaskContext) -> std::result::Result<TaskOutput, Stop> {
        ctx.set_phase(Phase::Splitting);
        let (volumes, files) = split_file(&self.archive, &self.out_dir, self.part_size, Some(ctx))?;
        Ok(TaskOutput {
            outputs: files,
            entries_processed: volumes.volumes.len() as u64,
            volumes: Some(volumes),
            ..TaskOutput::default()
        })
    }
}

pub(super) struct JoinJob {
    manifest_path: PathBuf,
    output: PathBuf,
    out_dir: PathBuf,
}

impl JoinJob {
    pub(super) fn new(manifest_path: &Path, output: &Path) -> Result<Self> {
        require_file(manifest_path)?;
        let out_dir = parent_dir(output)?;
        if output.is_dir() {
            return Err(ValidationError::OutputExists(output.to_path_buf()).into());
        }
        Ok(Self {
            manifest_path: manifest_path.to_path_buf(),
            output: output.to_path_buf(),
            out_dir,
        })
    }

    pub(super) fn run(self, ctx: &TaskContext) -> std::result::Result<TaskOutput, Stop> {
        ctx.set_phase(Phase::Joining);
        let mut joiner = FileJoiner::open(&self.manifest_path)?;
        joiner.check_present()?;
        ctx.set_total(joiner.manifest().volumes.len() as u64);

        let tmp = temp_in(&self.out_dir)?;
        let mut sink = BufWriter::new(tmp);
        for _ in 0..joiner.manifest().volumes.len() {
            ctx.checkpoint()?;
            if let Some(index) = joiner.append_next(&mut sink)? {
                ctx.advance(&joiner.manifest().part_name(index));
            }
        }
        sink.flush().map_err(|e| ArchiveError::io(&self.output, e))?;
        let manifest = joiner.finish()?;
        let tmp = sink
            .into_inner()
            .map_err(|e| ArchiveError::io(&self.output, e.into_error()))?;
        persist(tmp, &self.output, true)?;

        Ok(TaskOutput {
            outputs: vec![self.output],
            entries_processed: manifest.volumes.len() as u64,
            volumes: Some(manifest),
            ..TaskOutput::default()
        })
    }
}
