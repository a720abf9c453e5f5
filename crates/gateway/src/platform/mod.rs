//! Lambda runtime and the platform registry.

pub mod actions;
pub mod fs;
pub mod lambda;
pub mod loader;
pub mod registry;

pub use fs::FileEntry;
pub use lambda::LocalLambda;
pub use loader::Workspace;
pub use registry::{Definition, Registry};
