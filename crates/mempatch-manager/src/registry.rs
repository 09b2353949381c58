//! Authoritative hook and patch-pack registries with the global invariants
//! enforced before anything is broadcast: unique names, non-overlapping
//! windows, resolvable hook references, loaded plugins.

use std::collections::BTreeSet;

use mempatch_common::error::{Error, Result};
use mempatch_common::hook::{Hook, HookBody};
use mempatch_common::patch::{Patch, PatchPack};

struct RegisteredHook {
    hook: Hook,
    /// Packs whose hook patches reference this hook; they go away first
    /// when the hook is unregistered.
    dependent_packs: Vec<String>,
}

#[derive(Default)]
pub struct PatchRegistry {
    hooks: Vec<RegisteredHook>,
    packs: Vec<PatchPack>,
    loaded_plugins: BTreeSet<String>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_plugin_loaded(&mut self, name: &str, loaded: bool) {
        if loaded {
            self.loaded_plugins.insert(name.to_string());
        } else {
            self.loaded_plugins.remove(name);
        }
    }

    pub fn is_hook_registered(&self, name: &str) -> bool {
        self.hooks.iter().any(|entry| entry.hook.name == name)
    }

    pub fn is_pack_loaded(&self, name: &str) -> bool {
        self.packs.iter().any(|pack| pack.info.name == name)
    }

    pub fn hooks(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().map(|entry| &entry.hook)
    }

    pub fn packs(&self) -> impl Iterator<Item = &PatchPack> {
        self.packs.iter()
    }

    pub fn hook(&self, name: &str) -> Result<&Hook> {
        self.hooks
            .iter()
            .map(|entry| &entry.hook)
            .find(|hook| hook.name == name)
            .ok_or_else(|| Error::validation(format!("no hook named `{}' is registered", name)))
    }

    pub fn pack(&self, name: &str) -> Result<&PatchPack> {
        self.packs
            .iter()
            .find(|pack| pack.info.name == name)
            .ok_or_else(|| Error::validation(format!("no patch pack named `{}' is loaded", name)))
    }

    fn pack_mut(&mut self, name: &str) -> Result<&mut PatchPack> {
        self.packs
            .iter_mut()
            .find(|pack| pack.info.name == name)
            .ok_or_else(|| Error::validation(format!("no patch pack named `{}' is loaded", name)))
    }

    /// Register a hook: valid, uniquely named, and (for name hooks) not
    /// overlapping any already-registered name hook's window.
    pub fn register_hook(&mut self, hook: Hook) -> Result<()> {
        if self.is_hook_registered(&hook.name) {
            return Err(Error::validation(
                "a hook with the same name is already registered",
            ));
        }
        hook.check_valid()?;
        if let HookBody::Name(search) = &hook.body {
            for existing in &self.hooks {
                if let HookBody::Name(existing_search) = &existing.hook.body {
                    search.check_overlap_with(existing_search)?;
                }
            }
        }
        self.hooks.push(RegisteredHook {
            hook,
            dependent_packs: Vec::new(),
        });
        Ok(())
    }

    /// Unregister a hook. Packs referencing it are removed first; their
    /// names come back so the caller can broadcast the removals.
    pub fn unregister_hook(&mut self, name: &str) -> Result<Vec<String>> {
        let index = self
            .hooks
            .iter()
            .position(|entry| entry.hook.name == name)
            .ok_or_else(|| Error::validation(format!("no hook named `{}' is registered", name)))?;

        let dependents = self.hooks[index].dependent_packs.clone();
        for pack_name in &dependents {
            self.remove_pack(pack_name)?;
        }
        // remove_pack may have reshuffled hook entries' dependent lists but
        // never the hook list itself; the index is still right.
        self.hooks.remove(index);
        Ok(dependents)
    }

    /// Add a pack: uniquely named, plugins present, every patch valid, hook
    /// patches referencing registered hooks, replace-name windows not
    /// overlapping those of already-loaded packs. The pack arrives with its
    /// extra settings at defaults and `currently_enabled` cleared.
    pub fn add_pack(&mut self, mut pack: PatchPack) -> Result<()> {
        pack.check_valid()?;
        if self.is_pack_loaded(&pack.info.name) {
            return Err(Error::validation(
                "a patch pack with the same name already exists",
            ));
        }
        for plugin in &pack.required_plugins {
            if !self.loaded_plugins.contains(plugin) {
                return Err(Error::validation(format!(
                    "required plugin `{}' is not loaded",
                    plugin
                )));
            }
        }

        let mut hooks_used = Vec::new();
        for patch in &pack.patches {
            match patch {
                Patch::Hook(hook_patch) => {
                    if !self.is_hook_registered(&hook_patch.hook_name) {
                        return Err(Error::validation(format!(
                            "hook `{}' referenced by a hook patch is not registered",
                            hook_patch.hook_name
                        )));
                    }
                    hooks_used.push(hook_patch.hook_name.clone());
                }
                Patch::ReplaceName(replace) => {
                    for existing_pack in &self.packs {
                        for existing_patch in &existing_pack.patches {
                            if let Patch::ReplaceName(existing) = existing_patch {
                                replace.search.check_overlap_with(&existing.search)?;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        pack.info.currently_enabled = false;
        for setting in &mut pack.info.extra_settings {
            setting.current_value = setting.default_value.clone();
        }

        let pack_name = pack.info.name.clone();
        for hook_name in hooks_used {
            if let Some(entry) = self.hooks.iter_mut().find(|e| e.hook.name == hook_name) {
                if !entry.dependent_packs.contains(&pack_name) {
                    entry.dependent_packs.push(pack_name.clone());
                }
            }
        }
        self.packs.push(pack);
        Ok(())
    }

    pub fn remove_pack(&mut self, name: &str) -> Result<PatchPack> {
        let index = self
            .packs
            .iter()
            .position(|pack| pack.info.name == name)
            .ok_or_else(|| Error::validation(format!("no patch pack named `{}' is loaded", name)))?;

        for entry in &mut self.hooks {
            entry.dependent_packs.retain(|pack_name| pack_name != name);
        }
        Ok(self.packs.remove(index))
    }

    pub fn set_pack_enabled(&mut self, name: &str, enabled: bool) -> Result<&PatchPack> {
        let pack = self.pack_mut(name)?;
        pack.info.currently_enabled = enabled;
        Ok(pack)
    }

    pub fn set_extra_setting(&mut self, name: &str, label: &str, value: &str) -> Result<&PatchPack> {
        let pack = self.pack_mut(name)?;
        mempatch_common::info::extra_setting_by_label_mut(&mut pack.info.extra_settings, label)?
            .current_value = value.to_string();
        Ok(pack)
    }

    pub fn restore_extra_setting_defaults(&mut self, name: &str) -> Result<&PatchPack> {
        let pack = self.pack_mut(name)?;
        for setting in &mut pack.info.extra_settings {
            setting.current_value = setting.default_value.clone();
        }
        Ok(pack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mempatch_common::info::{ExtraSetting, Info};
    use mempatch_common::patch::{HookPatch, ReplaceNamePatch};
    use mempatch_common::pattern::{NameSearch, Search};

    fn name_hook(name: &str, function: &str, rva: usize, len: usize) -> Hook {
        Hook {
            name: name.to_string(),
            hook_rva: 0,
            return_rva: 0,
            body: HookBody::Name(NameSearch {
                search: Search {
                    module_name: "libgame.so".to_string(),
                    search_bytes: vec![0x90; len],
                    ..Search::default()
                },
                function_name: function.to_string(),
                function_rva: rva,
            }),
            ..Hook::default()
        }
    }

    fn pack_with_hook_patch(name: &str, hook: &str) -> PatchPack {
        PatchPack {
            info: Info {
                name: name.to_string(),
                default_enabled: true,
                extra_settings: vec![ExtraSetting {
                    label: "level".to_string(),
                    current_value: "junk".to_string(),
                    default_value: "3".to_string(),
                    ..ExtraSetting::default()
                }],
                ..Info::default()
            },
            patches: vec![Patch::Hook(HookPatch {
                hook_name: hook.to_string(),
                function_body: String::new(),
            })],
            ..PatchPack::default()
        }
    }

    #[test]
    fn test_duplicate_hook_names_are_rejected() {
        let mut registry = PatchRegistry::new();
        registry.register_hook(name_hook("h", "f", 0, 8)).unwrap();
        assert!(registry.register_hook(name_hook("h", "g", 64, 8)).is_err());
    }

    #[test]
    fn test_name_hook_overlap_rejection_is_order_independent() {
        let first = name_hook("first", "f", 0, 8);
        let second = name_hook("second", "f", 4, 8);

        let mut registry = PatchRegistry::new();
        registry.register_hook(first.clone()).unwrap();
        let forward = registry.register_hook(second.clone()).is_err();

        let mut registry = PatchRegistry::new();
        registry.register_hook(second).unwrap();
        let backward = registry.register_hook(first).is_err();

        assert!(forward);
        assert!(backward);
    }

    #[test]
    fn test_disjoint_windows_on_one_function_are_fine() {
        let mut registry = PatchRegistry::new();
        registry.register_hook(name_hook("low", "f", 0, 8)).unwrap();
        registry.register_hook(name_hook("high", "f", 8, 8)).unwrap();
    }

    #[test]
    fn test_hook_patch_requires_registered_hook() {
        let mut registry = PatchRegistry::new();
        assert!(registry.add_pack(pack_with_hook_patch("p", "ghost")).is_err());

        registry.register_hook(name_hook("ghost", "f", 0, 8)).unwrap();
        registry.add_pack(pack_with_hook_patch("p", "ghost")).unwrap();
    }

    #[test]
    fn test_pack_arrives_disabled_with_default_settings() {
        let mut registry = PatchRegistry::new();
        registry.register_hook(name_hook("h", "f", 0, 8)).unwrap();
        registry.add_pack(pack_with_hook_patch("p", "h")).unwrap();

        let pack = registry.pack("p").unwrap();
        assert!(!pack.info.currently_enabled);
        assert_eq!(pack.info.extra_settings[0].current_value, "3");
    }

    #[test]
    fn test_required_plugins_must_be_loaded() {
        let mut registry = PatchRegistry::new();
        let mut pack = pack_with_hook_patch("p", "h");
        pack.patches.clear();
        pack.required_plugins.push("overlay".to_string());

        assert!(registry.add_pack(pack.clone()).is_err());
        registry.set_plugin_loaded("overlay", true);
        registry.add_pack(pack).unwrap();
    }

    #[test]
    fn test_replace_name_windows_must_not_overlap_across_packs() {
        let replace = |pack_name: &str, rva: usize| PatchPack {
            info: Info {
                name: pack_name.to_string(),
                ..Info::default()
            },
            patches: vec![Patch::ReplaceName(ReplaceNamePatch {
                search: NameSearch {
                    search: Search {
                        module_name: "libgame.so".to_string(),
                        search_bytes: vec![0x90; 8],
                        ..Search::default()
                    },
                    function_name: "f".to_string(),
                    function_rva: rva,
                },
                replace_bytes: vec![0xCC; 8],
                ignored_replace_rvas: Default::default(),
            })],
            ..PatchPack::default()
        };

        let mut registry = PatchRegistry::new();
        registry.add_pack(replace("a", 0)).unwrap();
        assert!(registry.add_pack(replace("b", 4)).is_err());
        registry.add_pack(replace("c", 8)).unwrap();
    }

    #[test]
    fn test_unregistering_a_hook_cascades_to_dependent_packs() {
        let mut registry = PatchRegistry::new();
        registry.register_hook(name_hook("h", "f", 0, 8)).unwrap();
        registry.add_pack(pack_with_hook_patch("p1", "h")).unwrap();
        registry.add_pack(pack_with_hook_patch("p2", "h")).unwrap();

        let removed = registry.unregister_hook("h").unwrap();
        assert_eq!(removed, vec!["p1".to_string(), "p2".to_string()]);
        assert!(!registry.is_hook_registered("h"));
        assert!(!registry.is_pack_loaded("p1"));
        assert!(!registry.is_pack_loaded("p2"));
    }

    #[test]
    fn test_extra_setting_edit_and_restore() {
        let mut registry = PatchRegistry::new();
        registry.register_hook(name_hook("h", "f", 0, 8)).unwrap();
        registry.add_pack(pack_with_hook_patch("p", "h")).unwrap();

        registry.set_extra_setting("p", "level", "9").unwrap();
        assert_eq!(
            registry.pack("p").unwrap().info.extra_settings[0].current_value,
            "9"
        );

        registry.restore_extra_setting_defaults("p").unwrap();
        assert_eq!(
            registry.pack("p").unwrap().info.extra_settings[0].current_value,
            "3"
        );
        assert!(registry.set_extra_setting("p", "missing", "1").is_err());
    }
}
