pub mod merge;
pub mod orchestrator;
pub mod queries;
pub mod registry;

pub use merge::*;
pub use orchestrator::*;
pub use queries::*;
pub use registry::*;
