use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Axis-aligned box in integer pixel coordinates, `x1 < x2` and `y1 < y2`
/// once it has been through [`BoundingBox::clamped`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Round float detector output to pixel coordinates.
    pub fn from_f32(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1 as i32,
            y1: y1 as i32,
            x2: x2 as i32,
            y2: y2 as i32,
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_degenerate(&self) -> bool {
        self.x1 >= self.x2 || self.y1 >= self.y2
    }

    /// Clip to `[0, width-1] x [0, height-1]`. Returns `None` when the result
    /// has no area.
    pub fn clamped(&self, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;
        let clipped = Self {
            x1: self.x1.clamp(0, max_x),
            y1: self.y1.clamp(0, max_y),
            x2: self.x2.clamp(0, max_x),
            y2: self.y2.clamp(0, max_y),
        };
        if clipped.is_degenerate() {
            None
        } else {
            Some(clipped)
        }
    }

    /// Integer center, rounded toward the top-left.
    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x1, self.y1, self.x2, self.y2].serialize(serializer)
    }
}

/// Accepts `[x1,y1,x2,y2]` and the older nested `[[x1,y1,x2,y2]]` layout.
impl<'de> Deserialize<'de> for BoundingBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Coordinates {
            Flat([f64; 4]),
            Nested(Vec<[f64; 4]>),
        }

        let coords = match Coordinates::deserialize(deserializer)? {
            Coordinates::Flat(c) => c,
            Coordinates::Nested(list) => list
                .into_iter()
                .next()
                .ok_or_else(|| serde::de::Error::custom("empty coordinates list"))?,
        };
        Ok(Self {
            x1: coords[0] as i32,
            y1: coords[1] as i32,
            x2: coords[2] as i32,
            y2: coords[3] as i32,
        })
    }
}

/// One labelled box produced by the detector for a single frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "coordinates")]
    pub bbox: BoundingBox,
}

impl ObjectDetection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    /// Normalise raw detector output against the frame bounds.
    ///
    /// Confidence is clamped to `[0, 1]`; boxes are clipped to the frame and
    /// dropped when they degenerate.
    pub fn sanitized(mut self, width: u32, height: u32) -> Option<Self> {
        if !self.confidence.is_finite() {
            return None;
        }
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.bbox = self.bbox.clamped(width, height)?;
        Some(self)
    }
}

/// All detections kept for one decoded frame. Frames without detections are
/// never recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(rename = "frame")]
    pub frame_index: u64,
    pub objects: Vec<ObjectDetection>,
}

impl DetectionRecord {
    pub fn new(frame_index: u64, objects: Vec<ObjectDetection>) -> Self {
        Self {
            frame_index,
            objects,
        }
    }
}

/// Parse a metadata artifact.
pub fn parse_records(raw: &str) -> serde_json::Result<Vec<DetectionRecord>> {
    serde_json::from_str(raw)
}

/// Serialise records to the metadata artifact format.
pub fn encode_records(records: &[DetectionRecord]) -> serde_json::Result<String> {
    serde_json::to_string(records)
}
