//! Local file decoding through libav (ffmpeg-next).
//!
//! Frames are decoded and scaled to RGB24 in-process. Use this when the
//! `ffmpeg` binaries are not available on the host.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::{FrameSource, VideoDecoder, VideoInfo};

#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegLibDecoder;

impl FfmpegLibDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl VideoDecoder for FfmpegLibDecoder {
    fn name(&self) -> &'static str {
        "ffmpeg-lib"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(LibSource::open(path)?))
    }
}

struct LibSource {
    info: VideoInfo,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
}

// The libav contexts are only touched from the thread that owns the source.
unsafe impl Send for LibSource {}

impl LibSource {
    fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open '{}' with ffmpeg", path.display()))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = stream.index();
        let fps = f64::from(stream.avg_frame_rate());
        let frames = stream.frames();
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let info = VideoInfo {
            width: decoder.width(),
            height: decoder.height(),
            fps: if fps.is_finite() && fps > 0.0 { fps } else { 30.0 },
            frame_count: u64::try_from(frames).ok().filter(|n| *n > 0),
        };
        Ok(Self {
            info,
            input,
            stream_index,
            decoder,
            scaler,
            eof_sent: false,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<RgbImage> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("decoded frame does not match its dimensions"))
    }
}

impl FrameSource for LibSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("send packet to ffmpeg decoder")?;
                    }
                }
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
