//! The mempatch manager: the authoritative hook/patch-pack registries, the
//! codegen driver producing the hook artifact, and the connection manager
//! that launches targets and streams state to their cores.

pub mod codegen;
pub mod cores;
pub mod manager;
pub mod registry;
pub mod settings;

pub use codegen::Codegen;
pub use cores::{CoreId, CoreManager};
pub use manager::Manager;
pub use registry::PatchRegistry;
pub use settings::SettingsStore;
