use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::ObjectDetection;

/// Stub backend for testing and dry runs.
///
/// Detections are scripted by call order: the n-th `detect` call returns the
/// script entry for `n` (starting at 0), or nothing. The call counter is
/// shared so callers can observe how many frames were run through detection.
pub struct StubBackend {
    script: HashMap<u64, Vec<ObjectDetection>>,
    calls: Arc<AtomicU64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: HashMap::new(),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_script(script: HashMap<u64, Vec<ObjectDetection>>) -> Self {
        Self {
            script,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of `detect` calls made so far.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<ObjectDetection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.get(&call).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn replays_script_by_call_order() {
        let car = ObjectDetection::new("car", 0.9, BoundingBox::new(10, 10, 50, 50));
        let mut backend = StubBackend::with_script(HashMap::from([(1, vec![car.clone()])]));
        let counter = backend.call_counter();
        let frame = RgbImage::new(4, 4);

        assert!(backend.detect(&frame).unwrap().is_empty());
        assert_eq!(backend.detect(&frame).unwrap(), vec![car]);
        assert!(backend.detect(&frame).unwrap().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
