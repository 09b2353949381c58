//! Patches and patch packs: the unit of work the manager streams to cores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::info::Info;
use crate::pattern::{NameSearch, Search};
use crate::wire::{self, Wire, WireReader};

/// Linker-safe symbol stem for a patch pack, mirroring
/// [`crate::hook::hook_safename`].
pub fn pack_safename(name: &str) -> String {
    let mut result = String::with_capacity(10 + name.len() * 2);
    result.push_str("patchpack_");
    for byte in name.as_bytes() {
        result.push_str(&format!("{:02x}", byte));
    }
    result
}

/// Attaches a callback body to a named hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookPatch {
    pub hook_name: String,
    #[serde(default)]
    pub function_body: String,
}

impl HookPatch {
    pub fn check_valid(&self) -> Result<()> {
        if self.hook_name.is_empty() {
            return Err(Error::validation("the hook name cannot be empty"));
        }
        Ok(())
    }
}

/// Byte replacement at a symbol-anchored window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceNamePatch {
    #[serde(flatten)]
    pub search: NameSearch,
    pub replace_bytes: Vec<u8>,
    #[serde(default)]
    pub ignored_replace_rvas: std::collections::BTreeSet<usize>,
}

/// Byte replacement at every site a pattern search finds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceSearchPatch {
    #[serde(flatten)]
    pub search: Search,
    pub replace_bytes: Vec<u8>,
    #[serde(default)]
    pub ignored_replace_rvas: std::collections::BTreeSet<usize>,
}

fn check_replace_parts(
    search_len: usize,
    replace_bytes: &[u8],
    ignored: &std::collections::BTreeSet<usize>,
) -> Result<()> {
    if replace_bytes.len() != search_len {
        return Err(Error::validation(
            "the replace bytes must be as long as the search bytes",
        ));
    }
    for rva in ignored {
        if *rva >= replace_bytes.len() {
            return Err(Error::validation(
                "all ignored replace byte RVAs must be inside the replace bytes",
            ));
        }
    }
    Ok(())
}

impl ReplaceNamePatch {
    pub fn check_valid(&self) -> Result<()> {
        self.search.check_valid(1)?;
        check_replace_parts(
            self.search.search.search_bytes.len(),
            &self.replace_bytes,
            &self.ignored_replace_rvas,
        )
    }
}

impl ReplaceSearchPatch {
    pub fn check_valid(&self) -> Result<()> {
        self.search.check_valid(1)?;
        check_replace_parts(
            self.search.search_bytes.len(),
            &self.replace_bytes,
            &self.ignored_replace_rvas,
        )
    }
}

const WIRE_PATCH_BLANK: u32 = 0;
const WIRE_PATCH_HOOK: u32 = 1;
const WIRE_PATCH_REPLACE_NAME: u32 = 2;
const WIRE_PATCH_REPLACE_SEARCH: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Patch {
    /// Valid only while under construction; rejected by validation.
    #[default]
    Blank,
    Hook(HookPatch),
    ReplaceName(ReplaceNamePatch),
    ReplaceSearch(ReplaceSearchPatch),
}

impl Patch {
    pub fn check_valid(&self) -> Result<()> {
        match self {
            Patch::Blank => Err(Error::validation("a patch cannot be blank")),
            Patch::Hook(patch) => patch.check_valid(),
            Patch::ReplaceName(patch) => patch.check_valid(),
            Patch::ReplaceSearch(patch) => patch.check_valid(),
        }
    }

    pub fn is_replace(&self) -> bool {
        matches!(self, Patch::ReplaceName(_) | Patch::ReplaceSearch(_))
    }
}

/// A named, distributable bundle of patches plus the source-level context
/// (`header_includes`, `shared_variables`) its hook patches compile against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchPack {
    pub info: Info,
    #[serde(default)]
    pub required_plugins: Vec<String>,
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub header_includes: Vec<String>,
    /// Name to C++ type, ordered; shared by every hook patch in the pack.
    #[serde(default)]
    pub shared_variables: BTreeMap<String, String>,
}

impl PatchPack {
    pub fn check_valid(&self) -> Result<()> {
        if self.info.name.is_empty() {
            return Err(Error::validation("the patch pack name cannot be empty"));
        }
        for patch in &self.patches {
            patch.check_valid()?;
        }
        Ok(())
    }
}

impl Wire for HookPatch {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_string(out, &self.hook_name);
        wire::put_string(out, &self.function_body);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(HookPatch {
            hook_name: r.string()?,
            function_body: r.string()?,
        })
    }
}

impl Wire for ReplaceNamePatch {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_entity(out, &self.search);
        wire::put_bytes(out, &self.replace_bytes);
        wire::put_size_set(out, &self.ignored_replace_rvas);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(ReplaceNamePatch {
            search: r.entity()?,
            replace_bytes: r.bytes()?,
            ignored_replace_rvas: r.size_set()?,
        })
    }
}

impl Wire for ReplaceSearchPatch {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_entity(out, &self.search);
        wire::put_bytes(out, &self.replace_bytes);
        wire::put_size_set(out, &self.ignored_replace_rvas);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(ReplaceSearchPatch {
            search: r.entity()?,
            replace_bytes: r.bytes()?,
            ignored_replace_rvas: r.size_set()?,
        })
    }
}

impl Wire for Patch {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Patch::Blank => wire::put_u32(out, WIRE_PATCH_BLANK),
            Patch::Hook(patch) => {
                wire::put_u32(out, WIRE_PATCH_HOOK);
                wire::put_entity(out, patch);
            }
            Patch::ReplaceName(patch) => {
                wire::put_u32(out, WIRE_PATCH_REPLACE_NAME);
                wire::put_entity(out, patch);
            }
            Patch::ReplaceSearch(patch) => {
                wire::put_u32(out, WIRE_PATCH_REPLACE_SEARCH);
                wire::put_entity(out, patch);
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.u32()? {
            WIRE_PATCH_BLANK => Ok(Patch::Blank),
            WIRE_PATCH_HOOK => Ok(Patch::Hook(r.entity()?)),
            WIRE_PATCH_REPLACE_NAME => Ok(Patch::ReplaceName(r.entity()?)),
            WIRE_PATCH_REPLACE_SEARCH => Ok(Patch::ReplaceSearch(r.entity()?)),
            other => Err(Error::protocol(format!(
                "unknown patch discriminant {}",
                other
            ))),
        }
    }
}

impl Wire for PatchPack {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_entity(out, &self.info);
        wire::put_strings(out, &self.required_plugins);
        wire::put_entities(out, &self.patches);
        wire::put_strings(out, &self.header_includes);
        wire::put_size(out, self.shared_variables.len());
        for (name, type_name) in &self.shared_variables {
            wire::put_string(out, name);
            wire::put_string(out, type_name);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let info = r.entity()?;
        let required_plugins = r.strings()?;
        let patches = r.entities()?;
        let header_includes = r.strings()?;
        let count = r.size()?;
        let mut shared_variables = BTreeMap::new();
        for _ in 0..count {
            let name = r.string()?;
            let type_name = r.string()?;
            shared_variables.insert(name, type_name);
        }
        Ok(PatchPack {
            info,
            required_plugins,
            patches,
            header_includes,
            shared_variables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{ExtraSetting, ExtraSettingKind};

    fn replace_search_patch() -> ReplaceSearchPatch {
        ReplaceSearchPatch {
            search: Search {
                module_name: "libgame.so".to_string(),
                search_bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
                ..Search::default()
            },
            replace_bytes: vec![0xCA, 0xFE, 0xBA, 0xBE],
            ignored_replace_rvas: Default::default(),
        }
    }

    fn sample_pack() -> PatchPack {
        let mut shared_variables = BTreeMap::new();
        shared_variables.insert("hit_count".to_string(), "uint32_t".to_string());
        PatchPack {
            info: Info {
                name: "godmode".to_string(),
                description: "Never take damage".to_string(),
                currently_enabled: false,
                default_enabled: true,
                extra_settings: vec![ExtraSetting {
                    label: "damage scale".to_string(),
                    kind: ExtraSettingKind::Number,
                    default_value: "0".to_string(),
                    min: 0,
                    max: 100,
                    ..ExtraSetting::default()
                }],
            },
            required_plugins: vec!["overlay".to_string()],
            patches: vec![
                Patch::Hook(HookPatch {
                    hook_name: "on_damage".to_string(),
                    function_body: "registers.eax = 0;".to_string(),
                }),
                Patch::ReplaceSearch(replace_search_patch()),
            ],
            header_includes: vec!["cstdint".to_string()],
            shared_variables,
        }
    }

    #[test]
    fn test_blank_patch_is_rejected() {
        assert!(Patch::Blank.check_valid().is_err());
    }

    #[test]
    fn test_replace_length_must_match() {
        let mut patch = replace_search_patch();
        patch.replace_bytes.pop();
        assert!(patch.check_valid().is_err());
    }

    #[test]
    fn test_ignored_replace_rvas_must_be_inside() {
        let mut patch = replace_search_patch();
        patch.ignored_replace_rvas.insert(4);
        assert!(patch.check_valid().is_err());
        patch.ignored_replace_rvas.clear();
        patch.ignored_replace_rvas.insert(3);
        assert!(patch.check_valid().is_ok());
    }

    #[test]
    fn test_patch_wire_round_trip() {
        let patches = [
            Patch::Blank,
            Patch::Hook(HookPatch {
                hook_name: "on_damage".to_string(),
                function_body: "return;".to_string(),
            }),
            Patch::ReplaceSearch(replace_search_patch()),
        ];
        for patch in &patches {
            let decoded = Patch::from_bytes(&patch.to_bytes()).unwrap();
            assert_eq!(&decoded, patch);
        }
    }

    #[test]
    fn test_patch_pack_wire_round_trip() {
        let pack = sample_pack();
        let decoded = PatchPack::from_bytes(&pack.to_bytes()).unwrap();
        assert_eq!(decoded, pack);
    }

    #[test]
    fn test_patch_pack_json_round_trip() {
        // Packs are also authored as JSON definition files.
        let pack = sample_pack();
        let json = serde_json::to_string(&pack).unwrap();
        let decoded: PatchPack = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, pack);
    }

    #[test]
    fn test_pack_validation_covers_patches() {
        let mut pack = sample_pack();
        pack.patches.push(Patch::Blank);
        assert!(pack.check_valid().is_err());
    }
}
