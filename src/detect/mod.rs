//! Detection Producer boundary.
//!
//! Backends turn one decoded frame into labelled boxes. The data model here
//! (`DetectionRecord`, `ObjectDetection`, `BoundingBox`) is what the metadata
//! artifact and the record store persist.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{encode_records, parse_records, BoundingBox, DetectionRecord, ObjectDetection};
