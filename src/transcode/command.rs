//! Transcoder command line and executable resolution.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::audio::{OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE};
use crate::error::PipelineError;

/// Program plus arguments used to start one transcoder per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl TranscoderCommand {
    /// ffmpeg reading raw s16le / 48 kHz / stereo on stdin and writing ADTS AAC to stdout.
    pub fn ffmpeg(program: impl Into<PathBuf>, bitrate: &str) -> Self {
        let rate = OUTPUT_SAMPLE_RATE.to_string();
        let channels = OUTPUT_CHANNELS.to_string();
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "s16le",
            "-ar",
            rate.as_str(),
            "-ac",
            channels.as_str(),
            "-i",
            "pipe:0",
            "-c:a",
            "aac",
            "-b:a",
            bitrate,
            "-f",
            "adts",
            "pipe:1",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        Self { program: program.into(), args }
    }

    /// Arbitrary program, used to stand in for ffmpeg.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect() }
    }

    /// Resolve the program to an executable path before spawning.
    ///
    /// # Errors
    /// Returns [`PipelineError::Spawn`] if no executable can be found.
    pub fn resolve(&self) -> Result<PathBuf, PipelineError> {
        resolve_executable(&self.program)
            .ok_or_else(|| PipelineError::Spawn(format!("executable '{}' not found", self.program.display())))
    }
}

/// Locate an executable: paths with a separator are checked directly, bare names on `PATH`.
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.as_os_str().is_empty() {
        return None;
    }

    if program.components().count() > 1 || program.is_absolute() {
        return is_executable(program).then(|| program.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(program)).find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
