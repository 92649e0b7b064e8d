use crate::process::{args, render_command, CommandRunner};
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{program} is not installed or not on PATH")]
    ToolMissing { program: String },
    #[error("archive command failed: {command}: {message}")]
    Command { command: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Zip archive operations used by updates (extract) and backups (pack).
pub trait ArchiveCodec {
    /// Entry names exactly as stored in the archive.
    fn entries(&self, archive: &Path) -> Result<Vec<String>, ArchiveError>;
    /// Extracts every entry except those named in `exclude`, overwriting
    /// existing files under `destination`.
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        exclude: &[String],
    ) -> Result<(), ArchiveError>;
    /// Packs the contents of `source_dir` (paths relative to it) into a new
    /// archive at `archive`.
    fn pack(&self, source_dir: &Path, archive: &Path) -> Result<(), ArchiveError>;
}

impl<T: ArchiveCodec + ?Sized> ArchiveCodec for &T {
    fn entries(&self, archive: &Path) -> Result<Vec<String>, ArchiveError> {
        (**self).entries(archive)
    }

    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        exclude: &[String],
    ) -> Result<(), ArchiveError> {
        (**self).extract(archive, destination, exclude)
    }

    fn pack(&self, source_dir: &Path, archive: &Path) -> Result<(), ArchiveError> {
        (**self).pack(source_dir, archive)
    }
}

/// Info-ZIP `zip`/`unzip` driven through a [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct ZipTool<R> {
    runner: R,
}

impl<R: CommandRunner> ZipTool<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// `accepted` lists exit codes that still mean success; unzip uses 1
    /// for warnings on an otherwise complete run.
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        accepted: &[i32],
    ) -> Result<String, ArchiveError> {
        let output = self.runner.run(program, args, cwd).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ArchiveError::ToolMissing {
                    program: program.to_string(),
                }
            } else {
                ArchiveError::Io(err)
            }
        })?;
        if !accepted.contains(&output.status_code) {
            return Err(ArchiveError::Command {
                command: render_command(program, args),
                message: format!(
                    "exit status {}: {}",
                    output.status_code,
                    output.stderr_text()
                ),
            });
        }
        Ok(output.stdout_text())
    }
}

impl<R: CommandRunner> ArchiveCodec for ZipTool<R> {
    fn entries(&self, archive: &Path) -> Result<Vec<String>, ArchiveError> {
        let listing = self.run(
            "unzip",
            &args(["-Z1", &archive.to_string_lossy()]),
            None,
            &[0],
        )?;
        Ok(listing
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        exclude: &[String],
    ) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(destination)?;
        let mut cmd_args = args([
            "-o",
            "-q",
            &archive.to_string_lossy(),
            "-d",
            &destination.to_string_lossy(),
        ]);
        if !exclude.is_empty() {
            cmd_args.push("-x".to_string());
            cmd_args.extend(exclude.iter().cloned());
        }
        self.run("unzip", &cmd_args, None, &[0, 1])?;
        Ok(())
    }

    fn pack(&self, source_dir: &Path, archive: &Path) -> Result<(), ArchiveError> {
        crate::fsutil::ensure_parent(archive)?;
        self.run(
            "zip",
            &args(["-r", "-q", &archive.to_string_lossy(), "."]),
            Some(source_dir),
            &[0],
        )?;
        Ok(())
    }
}
