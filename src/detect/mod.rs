//! Detector seam.
//!
//! The model itself is external; this module defines how the server calls it
//! (`DetectorBackend`), how backends are selected by name (`BackendRegistry`),
//! and the detection data model shared by server and client.

mod backend;
pub mod backends;
pub mod classes;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use result::{BoundingBox, Detection, DetectionResult, ResultError};
