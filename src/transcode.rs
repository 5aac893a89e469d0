//! External transcoder: raw RGB intermediate to a compressed, streamable file.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifacts::{is_ready, remove_if_exists};

/// Geometry of the raw RGB24 intermediate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawVideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Produces the final compressed artifact from the raw intermediate.
///
/// A failure is fatal for the render stage; callers do not retry.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, input: &Path, format: RawVideoFormat, output: &Path) -> Result<()>;
}

/// Output encoder parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub codec: String,
    pub preset: String,
    pub crf: u8,
    pub pix_fmt: String,
    /// Move the index to the front so playback can start before download ends.
    pub faststart: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            crf: 28,
            pix_fmt: "yuv420p".to_string(),
            faststart: true,
        }
    }
}

/// Builder for one ffmpeg invocation.
#[derive(Clone, Debug)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    input_args: Vec<String>,
    output_args: Vec<String>,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    /// Add an argument before `-i`.
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add an argument after `-i`.
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Declare the input as headerless RGB24 frames.
    pub fn raw_input(self, format: RawVideoFormat) -> Self {
        self.input_arg("-f")
            .input_arg("rawvideo")
            .input_arg("-pix_fmt")
            .input_arg("rgb24")
            .input_arg("-s")
            .input_arg(format!("{}x{}", format.width, format.height))
            .input_arg("-r")
            .input_arg(format!("{}", format.fps))
    }

    pub fn encoder(self, settings: &EncoderSettings) -> Self {
        let cmd = self
            .output_arg("-c:v")
            .output_arg(settings.codec.clone())
            .output_arg("-preset")
            .output_arg(settings.preset.clone())
            .output_arg("-crf")
            .output_arg(settings.crf.to_string());
        let cmd = if settings.faststart {
            cmd.output_arg("-movflags").output_arg("+faststart")
        } else {
            cmd
        };
        cmd.output_arg("-pix_fmt").output_arg(settings.pix_fmt.clone())
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
            "-nostdin".to_string(),
        ];
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().into_owned());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Runs the `ffmpeg` binary.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
    settings: EncoderSettings,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>, settings: EncoderSettings) -> Self {
        Self {
            binary: binary.into(),
            settings,
        }
    }

    pub fn command(&self, input: &Path, format: RawVideoFormat, output: &Path) -> FfmpegCommand {
        // Outputs are written under a `.partial` name, so the muxer is named.
        FfmpegCommand::new(input, output)
            .raw_input(format)
            .encoder(&self.settings)
            .output_arg("-f")
            .output_arg("mp4")
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg", EncoderSettings::default())
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, input: &Path, format: RawVideoFormat, output: &Path) -> Result<()> {
        let args = self.command(input, format, output).build_args();
        log::info!("transcoding {} -> {}", input.display(), output.display());
        log::debug!("{} {}", self.binary.display(), args.join(" "));

        let result = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to run {}", self.binary.display()));
        let out = match result {
            Ok(out) => out,
            Err(err) => {
                remove_if_exists(output);
                return Err(err);
            }
        };
        if !out.status.success() {
            remove_if_exists(output);
            bail!(
                "ffmpeg exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        check_output(output)
    }
}

/// A zero exit status is not enough; the output must exist and be non-empty.
pub fn check_output(output: &Path) -> Result<()> {
    if is_ready(output) {
        return Ok(());
    }
    remove_if_exists(output);
    bail!("transcoder produced no output at {}", output.display())
}
