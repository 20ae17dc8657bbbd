mod backend;
mod backends;
mod registry;
mod result;
#[cfg_attr(not(feature = "backend-tract"), allow(dead_code))]
mod yolo;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::BackendRegistry;
pub use result::{InferenceOutcome, RawDetection};
