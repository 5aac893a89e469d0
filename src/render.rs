//! Annotated render: boxes and captions burned into decoded frames.
//!
//! Frames are joined to detection records by exact frame index and written
//! to an uncompressed RGB24 intermediate; the transcoder turns that into the
//! final artifact.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::detect::{DetectionRecord, ObjectDetection};
use crate::ingest::FrameSource;

/// Caption baseline offset above the box top edge.
const CAPTION_OFFSET: i32 = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub box_color: [u8; 3],
    pub thickness: u32,
    /// TrueType/OpenType font for captions. The built-in bitmap font is used
    /// when unset.
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            box_color: [0, 255, 0],
            thickness: 2,
            font_path: None,
            font_size: 16.0,
        }
    }
}

enum CaptionFont {
    Bitmap { scale: u32 },
    Outline { font: FontVec, scale: PxScale },
}

/// Draws detections onto frames.
pub struct Annotator {
    color: Rgb<u8>,
    thickness: u32,
    font: CaptionFont,
}

/// `"{label} {confidence:.2}"`.
pub fn caption(detection: &ObjectDetection) -> String {
    format!("{} {:.2}", detection.label, detection.confidence)
}

impl Annotator {
    pub fn new(settings: &RenderSettings) -> Result<Self> {
        let font = match &settings.font_path {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read font {}", path.display()))?;
                let font = FontVec::try_from_vec(bytes)
                    .map_err(|_| anyhow!("invalid font file {}", path.display()))?;
                CaptionFont::Outline {
                    font,
                    scale: PxScale::from(settings.font_size),
                }
            }
            None => CaptionFont::Bitmap {
                scale: ((settings.font_size / 8.0).round() as u32).max(1),
            },
        };
        Ok(Self {
            color: Rgb(settings.box_color),
            thickness: settings.thickness.max(1),
            font,
        })
    }

    /// Draw every detection; boxes are clipped to the frame first and
    /// detections that clip to nothing are skipped.
    pub fn annotate(&self, frame: &mut RgbImage, objects: &[ObjectDetection]) -> usize {
        let (width, height) = frame.dimensions();
        let mut drawn = 0;
        for object in objects {
            let Some(bbox) = object.bbox.clamped(width, height) else {
                continue;
            };
            let w = bbox.width() as u32 + 1;
            let h = bbox.height() as u32 + 1;
            for t in 0..self.thickness {
                let inner_w = w.saturating_sub(2 * t);
                let inner_h = h.saturating_sub(2 * t);
                if inner_w == 0 || inner_h == 0 {
                    break;
                }
                let rect = Rect::at(bbox.x1 + t as i32, bbox.y1 + t as i32).of_size(inner_w, inner_h);
                draw_hollow_rect_mut(frame, rect, self.color);
            }
            self.draw_caption(frame, bbox.x1, bbox.y1 - CAPTION_OFFSET, &caption(object));
            drawn += 1;
        }
        drawn
    }

    /// `baseline_y` is the bottom of the text.
    fn draw_caption(&self, frame: &mut RgbImage, x: i32, baseline_y: i32, text: &str) {
        match &self.font {
            CaptionFont::Outline { font, scale } => {
                let top = baseline_y - scale.y as i32;
                draw_text_mut(frame, self.color, x, top, *scale, font, text);
            }
            CaptionFont::Bitmap { scale } => {
                let top = baseline_y - (GLYPH_ROWS as i32 * *scale as i32);
                draw_bitmap_text(frame, self.color, x, top, *scale, text);
            }
        }
    }
}

const GLYPH_ROWS: usize = 7;
const GLYPH_COLS: u32 = 5;

/// 5x7 glyphs, one byte per row, bit 4 is the leftmost column.
fn glyph(c: char) -> Option<[u8; GLYPH_ROWS]> {
    let rows = match c.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        _ => return None,
    };
    Some(rows)
}

fn draw_bitmap_text(frame: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, scale: u32, text: &str) {
    let (width, height) = frame.dimensions();
    let advance = ((GLYPH_COLS + 1) * scale) as i32;
    for (i, c) in text.chars().enumerate() {
        let Some(rows) = glyph(c) else {
            continue;
        };
        let origin_x = x + i as i32 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_COLS {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = origin_x + (col * scale + dx) as i32;
                        let py = y + (row as u32 * scale + dy) as i32;
                        if px >= 0 && py >= 0 && (px as u32) < width && (py as u32) < height {
                            frame.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

/// Records keyed by frame index.
pub fn index_records(records: &[DetectionRecord]) -> HashMap<u64, &DetectionRecord> {
    records.iter().map(|r| (r.frame_index, r)).collect()
}

/// Sequential writer for headerless RGB24 frames.
pub struct RawVideoWriter {
    path: PathBuf,
    out: BufWriter<File>,
    width: u32,
    height: u32,
    frames: u64,
}

impl RawVideoWriter {
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create intermediate {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            width,
            height,
            frames: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            bail!(
                "frame {} is {}x{}, expected {}x{}",
                self.frames,
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }
        self.out
            .write_all(frame.as_raw())
            .with_context(|| format!("failed to write to {}", self.path.display()))?;
        self.frames += 1;
        Ok(())
    }

    /// Flush and return the number of frames written.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        self.out
            .get_ref()
            .sync_all()
            .with_context(|| format!("failed to sync {}", self.path.display()))?;
        Ok(self.frames)
    }
}

/// Totals of one render pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub frames: u64,
    pub annotated_frames: u64,
}

/// Decode every frame, annotate frames with a matching record and append
/// them to the intermediate. `on_frame` receives the count of frames
/// written so far.
pub fn render_frames(
    source: &mut dyn FrameSource,
    records: &[DetectionRecord],
    annotator: &Annotator,
    intermediate: &Path,
    mut on_frame: impl FnMut(u64),
) -> Result<RenderSummary> {
    let by_frame = index_records(records);
    let (width, height) = (source.info().width, source.info().height);
    let mut writer = RawVideoWriter::create(intermediate, width, height)?;
    let mut summary = RenderSummary::default();

    let mut index = 0u64;
    while let Some(mut frame) = source.next_frame()? {
        if let Some(record) = by_frame.get(&index) {
            if annotator.annotate(&mut frame, &record.objects) > 0 {
                summary.annotated_frames += 1;
            }
        }
        writer.write_frame(&frame)?;
        index += 1;
        on_frame(index);
    }
    summary.frames = writer.finish()?;
    if summary.frames == 0 {
        bail!("no frames could be decoded");
    }
    Ok(summary)
}
