pub mod annotate;
mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{HttpBackend, StubBackend};
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{BoundingBox, DetectedObject};
