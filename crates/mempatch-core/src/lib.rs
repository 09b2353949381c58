//! The injected core of the mempatch framework: the patcher worker that
//! retries and atomically applies byte patches, the hook runtime behind the
//! generated trampolines, and the control-channel client the manager drives.

pub mod core;
pub mod entry;
pub mod hooks;
pub mod loader;
pub mod logging;
pub mod patcher;
mod shutdown;

pub use crate::core::Core;
pub use hooks::{Artifact, HookCallbackFn, HookRuntime, RawExtraSetting, Registers};
pub use loader::PatchLoader;
pub use patcher::{GroupState, PatchGroupId, Patcher};
