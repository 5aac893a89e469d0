//! Heatmap aggregation: Gaussian splatting of detection centers over a
//! darkened background frame.
//!
//! Each detection contributes `exp(-(dx²+dy²)/(2σ²)) * confidence` inside a
//! square window of half-size `3σ` around its box center, with
//! `σ = max(box width, box height) / 4`. The accumulated density is rescaled
//! to 0..255, thresholded, false-coloured and blended over the background.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};

use crate::artifacts::{remove_if_exists, write_atomic};
use crate::detect::{DetectionRecord, ObjectDetection};
use crate::error::{PipelineError, PipelineResult};

/// Fixed compositing parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeatmapSettings {
    /// Multiplier applied to the background frame.
    pub darken: f32,
    /// Normalised densities below this value are dropped to zero.
    pub floor: u8,
    /// Weight of the coloured density when added over the background.
    pub overlay_weight: f32,
}

impl Default for HeatmapSettings {
    fn default() -> Self {
        Self {
            darken: 0.3,
            floor: 50,
            overlay_weight: 0.7,
        }
    }
}

/// Single-channel float accumulator the size of the background frame.
#[derive(Clone, Debug)]
pub struct DensityGrid {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DensityGrid {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(0.0, f32::max)
    }

    fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Add one detection's kernel. Returns false when the box clamps to
    /// nothing and the detection was skipped.
    pub fn splat(&mut self, detection: &ObjectDetection) -> bool {
        let Some(bbox) = detection.bbox.clamped(self.width, self.height) else {
            return false;
        };
        let (cx, cy) = bbox.center();
        let sigma = f64::from(bbox.width().max(bbox.height())) / 4.0;
        let half = (sigma * 3.0) as i32;
        // the window always covers the center, even when `half` truncates to 0
        let x_min = (cx - half).max(0);
        let x_max = (cx + half + 1).min(self.width as i32);
        let y_min = (cy - half).max(0);
        let y_max = (cy + half + 1).min(self.height as i32);
        let two_sigma_sq = 2.0 * sigma * sigma;
        let confidence = f64::from(detection.confidence);

        for y in y_min..y_max {
            let dy = f64::from(y - cy);
            let row = y as usize * self.width as usize;
            for x in x_min..x_max {
                let dx = f64::from(x - cx);
                let weight = (-(dx * dx + dy * dy) / two_sigma_sq).exp();
                self.data[row + x as usize] += (weight * confidence) as f32;
            }
        }
        true
    }

    /// Min-max rescale to 0..255 (truncating), then zero everything below
    /// `floor`. A flat non-zero grid maps to 255.
    pub fn normalized(&self, floor: u8) -> Vec<u8> {
        let min = self.min();
        let max = self.max();
        let range = max - min;
        self.data
            .iter()
            .map(|&v| {
                let scaled = if range > f32::EPSILON {
                    ((v - min) / range * 255.0) as u8
                } else if max > 0.0 {
                    255
                } else {
                    0
                };
                if scaled < floor {
                    0
                } else {
                    scaled
                }
            })
            .collect()
    }
}

/// Accumulate every detection of every record into one grid.
pub fn accumulate(records: &[DetectionRecord], width: u32, height: u32) -> DensityGrid {
    let mut grid = DensityGrid::new(width, height);
    let mut skipped = 0usize;
    for detection in records.iter().flat_map(|r| r.objects.iter()) {
        if !grid.splat(detection) {
            skipped += 1;
        }
    }
    if skipped > 0 {
        log::debug!("heatmap skipped {} degenerate detection(s)", skipped);
    }
    grid
}

/// Scale every channel by `factor`, rounding and saturating.
pub fn darken(frame: &RgbImage, factor: f32) -> RgbImage {
    let mut out = frame.clone();
    for pixel in out.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (f32::from(*channel) * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Blue to red false-colour palette.
pub fn jet(value: u8) -> Rgb<u8> {
    let v = f32::from(value) / 255.0;
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// `background + weight * heat`, saturating per channel.
pub fn compose(background: &RgbImage, heat: &RgbImage, weight: f32) -> RgbImage {
    let mut out = background.clone();
    for (dst, src) in out.pixels_mut().zip(heat.pixels()) {
        for (d, s) in dst.0.iter_mut().zip(src.0.iter()) {
            *d = (f32::from(*d) + f32::from(*s) * weight).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Build the composited heatmap raster for `video_name`.
///
/// Fails with `NoData` when no detection contributes any density.
pub fn build_heatmap(
    video_name: &str,
    records: &[DetectionRecord],
    background: &RgbImage,
    settings: &HeatmapSettings,
) -> PipelineResult<RgbImage> {
    let (width, height) = background.dimensions();
    let grid = accumulate(records, width, height);
    if grid.max() <= 0.0 {
        log::warn!("{}: no detections to aggregate", video_name);
        return Err(PipelineError::NoData);
    }

    let levels = grid.normalized(settings.floor);
    let heat = RgbImage::from_fn(width, height, |x, y| {
        jet(levels[y as usize * width as usize + x as usize])
    });
    let base = darken(background, settings.darken);
    Ok(compose(&base, &heat, settings.overlay_weight))
}

/// Encode as PNG and move into place. Any failure leaves no file at `path`.
pub fn write_png(image: &RgbImage, path: &Path) -> Result<()> {
    let mut bytes = Vec::new();
    let result = image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode heatmap png")
        .and_then(|_| write_atomic(path, &bytes));
    if result.is_err() {
        remove_if_exists(path);
    }
    result
}
