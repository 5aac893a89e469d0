use anyhow::Result;
use image::RgbImage;

use super::result::ObjectDetection;

/// Detector backend trait.
///
/// This is the boundary to the object detector. Given one decoded RGB frame,
/// a backend returns the raw `(label, confidence, box)` tuples it found, in
/// pixel coordinates of that frame. The pipeline clips, thresholds and
/// filters the output; backends do not need to.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<ObjectDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
