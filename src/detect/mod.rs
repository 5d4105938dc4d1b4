mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{ColorBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{ModelOutput, ModelRegistry, RegisteredModel};
pub use result::{BoundingBox, Detection, ModelKind, ScoredBox};
