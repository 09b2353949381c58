//! Shared foundation of the mempatch runtime patching framework: the memory
//! and module services, the pattern-search engine, the patch data model and
//! the manager/core control-channel protocol.

pub mod channel;
pub mod error;
pub mod hook;
pub mod info;
pub mod memory;
pub mod module;
pub mod patch;
pub mod pattern;
pub mod wire;

pub use channel::{ClientOp, Frame, HandlerId, HandlerRegistry, LogSeverity, ServerOp};
pub use error::{Error, Result};
pub use hook::{Hook, HookBody};
pub use info::{ExtraSetting, ExtraSettingKind, ExtraSettings, Info};
pub use memory::Region;
pub use module::Module;
pub use patch::{HookPatch, Patch, PatchPack, ReplaceNamePatch, ReplaceSearchPatch};
pub use pattern::{NameSearch, Search, SpecialSearch, SpecialSearchKind};
pub use wire::Wire;
