//! Translates manager messages into patcher and hook-runtime operations:
//! hook registration, patch-pack enable/disable, artifact load/unload.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use mempatch_common::channel::{HandlerRegistry, ServerOp};
use mempatch_common::error::Result;
use mempatch_common::hook::Hook;
use mempatch_common::module::Module;
use mempatch_common::patch::{pack_safename, Patch, PatchPack};
use mempatch_common::wire::WireReader;

use crate::hooks::{Artifact, HookCallbackFn, HookRuntime};
use crate::patcher::{PatchGroupId, Patcher, RelAddrReplaces};

struct LoadedPack {
    pack: PatchPack,
    group_id: Option<PatchGroupId>,
}

pub struct PatchLoader {
    patcher: Arc<Patcher>,
    runtime: Arc<HookRuntime>,
    packs: Mutex<Vec<LoadedPack>>,
}

impl PatchLoader {
    pub fn new(patcher: Arc<Patcher>, runtime: Arc<HookRuntime>) -> Self {
        Self {
            patcher,
            runtime,
            packs: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe the handlers that translate patch op codes into loader
    /// calls. Handler failures are logged; they never tear down the channel.
    pub fn subscribe(self: &Arc<Self>, registry: &HandlerRegistry<()>) {
        let loader = Arc::clone(self);
        registry.add(ServerOp::PatchHook as u32, move |_, data| {
            let result = WireReader::new(data)
                .entity::<Hook>()
                .and_then(|hook| loader.register_hook(hook));
            if let Err(error) = result {
                warn!("hook registration failed: {}", error);
            }
        });

        let loader = Arc::clone(self);
        registry.add(ServerOp::PatchHookRemove as u32, move |_, data| {
            let result = WireReader::new(data)
                .string()
                .and_then(|name| loader.remove_hook(&name));
            if let Err(error) = result {
                warn!("hook removal failed: {}", error);
            }
        });

        let loader = Arc::clone(self);
        registry.add(ServerOp::PatchPack as u32, move |_, data| {
            let result = WireReader::new(data)
                .entity::<PatchPack>()
                .and_then(|pack| loader.apply_pack(pack));
            if let Err(error) = result {
                warn!("patch pack update failed: {}", error);
            }
        });

        let loader = Arc::clone(self);
        registry.add(ServerOp::PatchPackRemove as u32, move |_, data| {
            let result = WireReader::new(data)
                .string()
                .and_then(|name| loader.remove_pack(&name));
            if let Err(error) = result {
                warn!("patch pack removal failed: {}", error);
            }
        });

        let loader = Arc::clone(self);
        registry.add(ServerOp::PatchLibLoad as u32, move |_, data| {
            let result = WireReader::new(data)
                .string()
                .and_then(|path| loader.load_artifact_file(&path));
            if let Err(error) = result {
                warn!("artifact load failed: {}", error);
            }
        });

        let loader = Arc::clone(self);
        registry.add(ServerOp::PatchLibUnload as u32, move |_, _| {
            if let Err(error) = loader.unload_artifact() {
                warn!("artifact unload failed: {}", error);
            }
        });
    }

    pub fn register_hook(&self, hook: Hook) -> Result<()> {
        self.runtime.register_hook(hook)
    }

    pub fn remove_hook(&self, name: &str) -> Result<()> {
        self.runtime.unregister_hook(name)
    }

    /// Add a pack, or flip an already-loaded pack to the enabled state the
    /// incoming copy carries.
    pub fn apply_pack(&self, pack: PatchPack) -> Result<()> {
        let mut packs = self.packs.lock().unwrap();
        if let Some(existing) = packs
            .iter_mut()
            .find(|loaded| loaded.pack.info.name == pack.info.name)
        {
            let want_enabled = pack.info.currently_enabled;
            if want_enabled && !existing.pack.info.currently_enabled {
                self.enable(existing)?;
            } else if !want_enabled && existing.pack.info.currently_enabled {
                self.disable(existing)?;
            }
            return Ok(());
        }

        debug!(pack = %pack.info.name, "patch pack loaded");
        let want_enabled = pack.info.currently_enabled;
        let mut loaded = LoadedPack {
            pack,
            group_id: None,
        };
        loaded.pack.info.currently_enabled = false;
        if want_enabled {
            self.enable(&mut loaded)?;
        }
        packs.push(loaded);
        Ok(())
    }

    /// Disable and forget a pack; unknown names are ignored.
    pub fn remove_pack(&self, name: &str) -> Result<()> {
        let mut packs = self.packs.lock().unwrap();
        let Some(index) = packs.iter().position(|loaded| loaded.pack.info.name == name) else {
            return Ok(());
        };
        self.disable(&mut packs[index])?;
        packs.remove(index);
        debug!(pack = name, "patch pack removed");
        Ok(())
    }

    pub fn is_pack_loaded(&self, name: &str) -> bool {
        self.packs
            .lock()
            .unwrap()
            .iter()
            .any(|loaded| loaded.pack.info.name == name)
    }

    pub fn is_pack_enabled(&self, name: &str) -> bool {
        self.packs
            .lock()
            .unwrap()
            .iter()
            .any(|loaded| loaded.pack.info.name == name && loaded.pack.info.currently_enabled)
    }

    pub fn load_artifact_file(&self, path: &str) -> Result<()> {
        self.load_artifact(Box::new(Module::load(path)?))
    }

    pub fn load_artifact(&self, artifact: Box<dyn Artifact>) -> Result<()> {
        self.runtime.load_artifact(artifact)
    }

    pub fn unload_artifact(&self) -> Result<()> {
        self.runtime.unload_artifact()
    }

    /// Full teardown for `DETACH`: every pack disabled, every hook
    /// unapplied, the artifact closed. The target keeps running.
    pub fn detach_all(&self) -> Result<()> {
        let names: Vec<String> = self
            .packs
            .lock()
            .unwrap()
            .iter()
            .map(|loaded| loaded.pack.info.name.clone())
            .collect();
        for name in names {
            self.remove_pack(&name)?;
        }
        self.runtime.shutdown()
    }

    /// Enable a pack: attach its hook-patch callbacks (resolved from the
    /// artifact) and enqueue one patch group holding every replace patch.
    fn enable(&self, loaded: &mut LoadedPack) -> Result<()> {
        if loaded.pack.info.currently_enabled {
            return Ok(());
        }

        let mut group: Vec<(Patch, RelAddrReplaces)> = Vec::new();
        let mut hook_patch_index = 0usize;
        for patch in &loaded.pack.patches {
            match patch {
                Patch::Hook(hook_patch) => {
                    match self.resolve_hook_patch(&loaded.pack, hook_patch_index) {
                        Ok(function) => {
                            if let Err(error) = self.runtime.attach(
                                &hook_patch.hook_name,
                                function,
                                &loaded.pack.info.extra_settings,
                            ) {
                                warn!(
                                    pack = %loaded.pack.info.name,
                                    "could not attach hook patch: {}", error
                                );
                            }
                        }
                        Err(error) => warn!(
                            pack = %loaded.pack.info.name,
                            "could not resolve hook patch {}: {}", hook_patch_index, error
                        ),
                    }
                    hook_patch_index += 1;
                }
                Patch::ReplaceName(_) | Patch::ReplaceSearch(_) => {
                    group.push((patch.clone(), RelAddrReplaces::new()));
                }
                // The manager rejects blank patches before broadcasting.
                Patch::Blank => warn!(pack = %loaded.pack.info.name, "skipping blank patch"),
            }
        }

        loaded.group_id = if group.is_empty() {
            None
        } else {
            Some(self.patcher.add_to_queue(group, None, None, None)?)
        };
        loaded.pack.info.currently_enabled = true;
        debug!(pack = %loaded.pack.info.name, "patch pack enabled");
        Ok(())
    }

    /// The exact reverse of [`PatchLoader::enable`].
    fn disable(&self, loaded: &mut LoadedPack) -> Result<()> {
        if !loaded.pack.info.currently_enabled {
            return Ok(());
        }

        if let Some(group_id) = loaded.group_id.take() {
            self.patcher.undo(group_id)?;
        }

        let mut hook_patch_index = 0usize;
        for patch in &loaded.pack.patches {
            if let Patch::Hook(hook_patch) = patch {
                match self.resolve_hook_patch(&loaded.pack, hook_patch_index) {
                    Ok(function) => {
                        if let Err(error) = self.runtime.detach(&hook_patch.hook_name, function) {
                            warn!(
                                pack = %loaded.pack.info.name,
                                "could not detach hook patch: {}", error
                            );
                        }
                    }
                    Err(error) => warn!(
                        pack = %loaded.pack.info.name,
                        "could not resolve hook patch {}: {}", hook_patch_index, error
                    ),
                }
                hook_patch_index += 1;
            }
        }
        loaded.pack.info.currently_enabled = false;
        debug!(pack = %loaded.pack.info.name, "patch pack disabled");
        Ok(())
    }

    /// Resolve the `<packsafename>_hookpatch<N>` callback the artifact
    /// compiled for this pack.
    fn resolve_hook_patch(&self, pack: &PatchPack, index: usize) -> Result<HookCallbackFn> {
        let symbol = format!("{}_hookpatch{}", pack_safename(&pack.info.name), index);
        let address = self.runtime.artifact_symbol(&symbol)?;
        // SAFETY: the manager generated this symbol with exactly the
        // HookCallbackFn signature.
        Ok(unsafe { std::mem::transmute::<usize, HookCallbackFn>(address) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::tests::{sample_hook, StubArtifact};
    use crate::hooks::{RawExtraSetting, Registers};
    use crate::patcher::GroupState;
    use mempatch_common::info::Info;
    use mempatch_common::patch::{HookPatch, ReplaceSearchPatch};
    use mempatch_common::pattern::Search;

    unsafe extern "C" fn pack_callback(
        _registers: *mut Registers,
        _return_address: *mut u32,
        _settings: *const RawExtraSetting,
        _settings_len: usize,
    ) {
    }

    fn loader_fixture() -> (Arc<PatchLoader>, Arc<Patcher>, Arc<HookRuntime>) {
        let patcher = Arc::new(Patcher::new());
        let runtime = Arc::new(HookRuntime::new(Arc::clone(&patcher)));
        let loader = Arc::new(PatchLoader::new(
            Arc::clone(&patcher),
            Arc::clone(&runtime),
        ));

        let mut artifact = StubArtifact::new();
        artifact.extra_symbols.insert(
            format!("{}_hookpatch0", pack_safename("combo")),
            pack_callback as usize,
        );
        loader.load_artifact(artifact).unwrap();
        loader.register_hook(sample_hook("on_tick")).unwrap();
        (loader, patcher, runtime)
    }

    fn combo_pack(enabled: bool) -> PatchPack {
        PatchPack {
            info: Info {
                name: "combo".to_string(),
                currently_enabled: enabled,
                ..Info::default()
            },
            patches: vec![
                Patch::Hook(HookPatch {
                    hook_name: "on_tick".to_string(),
                    function_body: "registers.ecx = 0;".to_string(),
                }),
                Patch::ReplaceSearch(ReplaceSearchPatch {
                    search: Search {
                        module_name: "libnot-loaded-anywhere.so".to_string(),
                        search_bytes: vec![0x11, 0x22, 0x33, 0x44],
                        ..Search::default()
                    },
                    replace_bytes: vec![0x44, 0x33, 0x22, 0x11],
                    ignored_replace_rvas: Default::default(),
                }),
            ],
            ..PatchPack::default()
        }
    }

    #[test]
    fn test_enable_attaches_callbacks_and_queues_replaces() {
        let (loader, patcher, runtime) = loader_fixture();
        loader.apply_pack(combo_pack(true)).unwrap();

        assert!(loader.is_pack_enabled("combo"));
        let callbacks = runtime.callbacks_of("on_tick").unwrap();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0] as usize, pack_callback as usize);

        // The replace patch sits in the queue; its module never loads here.
        let group_id = {
            let packs = loader.packs.lock().unwrap();
            packs[0].group_id.unwrap()
        };
        assert_eq!(patcher.state_of(group_id), Some(GroupState::Queued));
    }

    #[test]
    fn test_disable_reverses_enable() {
        let (loader, patcher, runtime) = loader_fixture();
        loader.apply_pack(combo_pack(true)).unwrap();
        let group_id = {
            let packs = loader.packs.lock().unwrap();
            packs[0].group_id.unwrap()
        };

        // A second copy with the enabled flag cleared disables in place.
        loader.apply_pack(combo_pack(false)).unwrap();
        assert!(loader.is_pack_loaded("combo"));
        assert!(!loader.is_pack_enabled("combo"));
        assert!(runtime.callbacks_of("on_tick").unwrap().is_empty());
        assert_eq!(patcher.state_of(group_id), None);
    }

    #[test]
    fn test_remove_pack_and_unknown_names() {
        let (loader, _patcher, _runtime) = loader_fixture();
        loader.apply_pack(combo_pack(true)).unwrap();

        loader.remove_pack("combo").unwrap();
        assert!(!loader.is_pack_loaded("combo"));

        // Removing things that are not there is a no-op.
        loader.remove_pack("combo").unwrap();
        loader.remove_hook("never-registered").unwrap();
    }

    #[test]
    fn test_detach_all_clears_everything() {
        let (loader, _patcher, runtime) = loader_fixture();
        loader.apply_pack(combo_pack(true)).unwrap();

        loader.detach_all().unwrap();
        assert!(!loader.is_pack_loaded("combo"));
        assert!(!runtime.is_hook_registered("on_tick"));
        assert!(!runtime.is_artifact_loaded());
    }
}
