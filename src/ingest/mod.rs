//! Frame decoding for local video files.
//!
//! Decoding is a transport concern: the pipeline only needs frames in order
//! plus the stream dimensions. Two decoders are provided:
//! - `FfprobeDecoder`: probes with `ffprobe` and pipes raw RGB out of the
//!   `ffmpeg` binary (default, no native linkage)
//! - `FfmpegLibDecoder`: in-process libav decode (feature: ingest-file-ffmpeg)
//!
//! Frames are produced one at a time and never written to disk by this layer.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub mod file_ffmpeg;

use std::path::Path;

use anyhow::{anyhow, Result};
use image::RgbImage;

pub use file::FfprobeDecoder;
#[cfg(feature = "ingest-file-ffmpeg")]
pub use file_ffmpeg::FfmpegLibDecoder;

/// Stream parameters known once the container is open.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Container-reported frame count; may be absent or approximate.
    pub frame_count: Option<u64>,
}

/// An open video, yielding decoded frames in presentation order.
pub trait FrameSource: Send {
    fn info(&self) -> &VideoInfo;

    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Opens video files for sequential decode.
pub trait VideoDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

/// Decode the temporal midpoint frame (`frame_count / 2`).
///
/// When the container does not report a frame count the file is decoded
/// once to count frames. If the reported count overshoots, the last decoded
/// frame is used.
pub fn midpoint_frame(decoder: &dyn VideoDecoder, path: &Path) -> Result<RgbImage> {
    let mut source = decoder.open(path)?;
    let target = match source.info().frame_count {
        Some(count) if count > 0 => count / 2,
        _ => {
            let mut count = 0u64;
            while source.next_frame()?.is_some() {
                count += 1;
            }
            if count == 0 {
                return Err(anyhow!("{} has no decodable frames", path.display()));
            }
            source = decoder.open(path)?;
            count / 2
        }
    };

    let mut last = None;
    let mut index = 0u64;
    while let Some(frame) = source.next_frame()? {
        if index == target {
            return Ok(frame);
        }
        last = Some(frame);
        index += 1;
    }
    if last.is_some() {
        log::debug!(
            "{}: reported frame count overshoots, using frame {}",
            path.display(),
            index.saturating_sub(1)
        );
    }
    last.ok_or_else(|| anyhow!("{} has no decodable frames", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct Counting {
        frames: u64,
        report_count: Option<u64>,
    }

    struct CountingSource {
        info: VideoInfo,
        remaining: u64,
        next: u8,
    }

    impl FrameSource for CountingSource {
        fn info(&self) -> &VideoInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let value = self.next;
            self.next += 1;
            Ok(Some(RgbImage::from_pixel(2, 2, Rgb([value, 0, 0]))))
        }
    }

    impl VideoDecoder for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(CountingSource {
                info: VideoInfo {
                    width: 2,
                    height: 2,
                    fps: 30.0,
                    frame_count: self.report_count,
                },
                remaining: self.frames,
                next: 0,
            }))
        }
    }

    fn index_of(frame: &RgbImage) -> u8 {
        frame.get_pixel(0, 0)[0]
    }

    #[test]
    fn picks_reported_midpoint() {
        let decoder = Counting { frames: 9, report_count: Some(9) };
        let frame = midpoint_frame(&decoder, Path::new("x.mp4")).unwrap();
        assert_eq!(index_of(&frame), 4);
    }

    #[test]
    fn counts_frames_when_unreported() {
        let decoder = Counting { frames: 6, report_count: None };
        let frame = midpoint_frame(&decoder, Path::new("x.mp4")).unwrap();
        assert_eq!(index_of(&frame), 3);
    }

    #[test]
    fn overshooting_count_falls_back_to_last_frame() {
        let decoder = Counting { frames: 3, report_count: Some(40) };
        let frame = midpoint_frame(&decoder, Path::new("x.mp4")).unwrap();
        assert_eq!(index_of(&frame), 2);
    }

    #[test]
    fn empty_video_is_an_error() {
        let decoder = Counting { frames: 0, report_count: None };
        assert!(midpoint_frame(&decoder, Path::new("x.mp4")).is_err());
    }
}
