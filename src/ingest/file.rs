//! Local file decoding through the `ffprobe`/`ffmpeg` binaries.
//!
//! `ffprobe` supplies the stream geometry, then `ffmpeg` decodes to packed
//! RGB24 on stdout and frames are read off the pipe one at a time. Nothing is
//! written to disk.

use std::ffi::OsString;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use serde::Deserialize;

use super::{FrameSource, VideoDecoder, VideoInfo};

const DEFAULT_FPS: f64 = 30.0;

/// Decoder backed by external `ffprobe` and `ffmpeg` executables.
#[derive(Clone, Debug)]
pub struct FfprobeDecoder {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
}

impl FfprobeDecoder {
    pub fn new(ffprobe: impl Into<PathBuf>, ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            ffmpeg: ffmpeg.into(),
        }
    }

    /// Read stream parameters of the first video stream.
    pub fn probe(&self, path: &Path) -> Result<VideoInfo> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate,avg_frame_rate,nb_frames",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to run {}", self.ffprobe.display()))?;

        if !output.status.success() {
            bail!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_probe(&output.stdout)
            .with_context(|| format!("unexpected ffprobe output for {}", path.display()))
    }
}

impl Default for FfprobeDecoder {
    fn default() -> Self {
        Self::new("ffprobe", "ffmpeg")
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

fn parse_probe(raw: &[u8]) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_slice(raw)?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        bail!("video stream has no dimensions");
    }
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(DEFAULT_FPS);
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0);
    Ok(VideoInfo {
        width,
        height,
        fps,
        frame_count,
    })
}

/// Parse `"30000/1001"` or `"29.97"`. Zero rates count as unknown.
pub(crate) fn parse_frame_rate(raw: &str) -> Option<f64> {
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// `ffmpeg` arguments that stream packed RGB24 frames to stdout. Frames keep
/// the coded geometry `ffprobe` reports, so display rotation is not applied.
fn decode_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-nostdin", "-noautorotate", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_os_string());
    args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"].map(OsString::from));
    args
}

impl VideoDecoder for FfprobeDecoder {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let info = self.probe(path)?;
        let mut child = Command::new(&self.ffmpeg)
            .args(decode_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.ffmpeg.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout was not captured"))?;
        log::debug!(
            "decoding {} ({}x{} @ {:.2} fps)",
            path.display(),
            info.width,
            info.height,
            info.fps
        );
        Ok(Box::new(PipeSource {
            frame_len: info.width as usize * info.height as usize * 3,
            info,
            child: Some(child),
            reader: BufReader::new(stdout),
        }))
    }
}

/// Frames read from a running `ffmpeg` process.
struct PipeSource {
    info: VideoInfo,
    frame_len: usize,
    child: Option<Child>,
    reader: BufReader<ChildStdout>,
}

impl PipeSource {
    fn finish(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().context("failed to wait for ffmpeg decoder")?;
        if !status.success() {
            bail!("ffmpeg decoder exited with {}", status);
        }
        Ok(())
    }
}

impl FrameSource for PipeSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.child.is_none() {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.frame_len];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("failed to read decoded frame"),
            }
        }
        if filled == 0 {
            self.finish()?;
            return Ok(None);
        }
        if filled < buf.len() {
            self.finish()?;
            bail!("truncated frame: {} of {} bytes", filled, buf.len());
        }
        RgbImage::from_raw(self.info.width, self.info.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow!("decoded frame does not match stream dimensions"))
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
