//! Codegen/Link service: turns registered hooks and patch packs into C++
//! translation units, compiles them with `g++ -m32` and links the shared
//! artifact the cores load. Unchanged units are skipped via a checksum
//! recorded in the settings store; a `modified` marker forces the relink.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use mempatch_common::error::{Error, Result};
use mempatch_common::hook::{hook_safename, Hook};
use mempatch_common::patch::{pack_safename, Patch, PatchPack};

use crate::settings::SettingsStore;

/// Shared prelude every generated unit includes: the register frame, the
/// extra-setting view and the dispatch entry point exported by the core.
const PRELUDE_HEADER: &str = "mempatch_hooks.h";
const PRELUDE: &str = r#"#pragma once
#ifndef MEMPATCH_HOOKS_H
#define MEMPATCH_HOOKS_H

#include <stdint.h>
#include <stddef.h>

struct Registers
{
    uint32_t eax;
    uint32_t ebx;
    uint32_t ecx;
    uint32_t edx;
    uint32_t esp;
    uint32_t ebp;
    uint32_t esi;
    uint32_t edi;
};

struct ExtraSetting
{
    const char* label;
    const char* value;
};

extern "C" void mempatch_run_hook_callbacks(const char* hook,
                                            Registers* registers,
                                            uint32_t* returnAddress);

#endif
"#;

pub struct Codegen {
    objects_dir: PathBuf,
    include_dir: String,
    library_dir: String,
    artifact_path: PathBuf,
    extra_cxxflags: String,
    extra_ldflags: String,
}

impl Codegen {
    pub fn from_settings(settings: &SettingsStore) -> Result<Self> {
        let objects_dir = settings.get("manager.codegen.objects_path");
        if objects_dir.is_empty() {
            return Err(Error::validation(
                "manager.codegen.objects_path is not configured",
            ));
        }
        let artifact = settings.get("core.artifact");
        if artifact.is_empty() {
            return Err(Error::validation("core.artifact is not configured"));
        }
        Ok(Self {
            objects_dir: PathBuf::from(objects_dir),
            include_dir: settings.get("manager.codegen.include_path").to_string(),
            library_dir: settings.get("manager.codegen.library_path").to_string(),
            artifact_path: PathBuf::from(artifact),
            extra_cxxflags: settings.get("manager.codegen.extra_cxxflags").to_string(),
            extra_ldflags: settings.get("manager.codegen.extra_ldflags").to_string(),
        })
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Compile one hook's unit unless its source is unchanged. Returns true
    /// when the compile was skipped.
    pub fn compile_hook(
        &self,
        settings: &mut SettingsStore,
        hook: &Hook,
        force: bool,
    ) -> Result<bool> {
        let source = generate_hook_source(hook);
        let stem = hook_safename(&hook.name);
        let key = format!("hooks.{}.checksum", hook.name);
        self.compile_unit(settings, &key, &stem, &source, force)
    }

    /// Compile one pack's unit unless its source is unchanged. Returns true
    /// when the compile was skipped.
    pub fn compile_pack(
        &self,
        settings: &mut SettingsStore,
        pack: &PatchPack,
        force: bool,
    ) -> Result<bool> {
        let source = generate_pack_source(pack);
        let stem = pack_safename(&pack.info.name);
        let key = format!("packs.{}.checksum", pack.info.name);
        self.compile_unit(settings, &key, &stem, &source, force)
    }

    fn compile_unit(
        &self,
        settings: &mut SettingsStore,
        checksum_key: &str,
        stem: &str,
        source: &str,
        force: bool,
    ) -> Result<bool> {
        self.prepare_objects_dir()?;
        let checksum = crc32(source.as_bytes());
        let object = self.objects_dir.join(format!("{}.o", stem));
        if !force
            && settings.get(checksum_key) == checksum.to_string()
            && object.exists()
        {
            return Ok(true);
        }

        let source_path = self.objects_dir.join(format!("{}.cpp", stem));
        std::fs::write(&source_path, source)?;

        let mut arguments = vec![
            source_path.to_string_lossy().into_owned(),
            "-c".to_string(),
            "-o".to_string(),
            object.to_string_lossy().into_owned(),
        ];
        arguments.extend(self.cxxflags());
        run_compiler(&arguments)?;

        // Marker telling `link` there is something new to pick up.
        std::fs::write(self.objects_dir.join("modified"), b"")?;
        settings.set(checksum_key, checksum.to_string());
        debug!(unit = stem, "compiled");
        Ok(false)
    }

    /// Link every object in the objects directory into the shared artifact.
    /// Skipped when the artifact exists and nothing was recompiled since the
    /// last link. Returns true when a fresh artifact was produced.
    pub fn link(&self, force: bool) -> Result<bool> {
        let marker = self.objects_dir.join("modified");
        if !force && self.artifact_path.exists() {
            if !marker.exists() {
                return Ok(false);
            }
        }
        let _ = std::fs::remove_file(&marker);

        let mut objects = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.objects_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|ext| ext == "o").unwrap_or(false) {
                    objects.push(path.to_string_lossy().into_owned());
                }
            }
        }
        objects.sort();

        let mut arguments = objects;
        arguments.push("-o".to_string());
        arguments.push(self.artifact_path.to_string_lossy().into_owned());
        arguments.push("-shared".to_string());
        arguments.extend(self.ldflags());
        run_compiler(&arguments)?;
        info!(artifact = %self.artifact_path.display(), "artifact linked");
        Ok(true)
    }

    fn prepare_objects_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.objects_dir)?;
        let prelude = self.objects_dir.join(PRELUDE_HEADER);
        if !prelude.exists() {
            std::fs::write(&prelude, PRELUDE)?;
        }
        Ok(())
    }

    fn cxxflags(&self) -> Vec<String> {
        let mut flags = vec![
            "-m32".to_string(),
            "-std=gnu++11".to_string(),
            "-fPIC".to_string(),
            format!("-I{}", self.objects_dir.display()),
        ];
        if !self.include_dir.is_empty() {
            flags.push(format!("-I{}", self.include_dir));
        }
        flags.extend(split_flags(&self.extra_cxxflags));
        flags
    }

    fn ldflags(&self) -> Vec<String> {
        let mut flags = vec!["-m32".to_string()];
        if !self.library_dir.is_empty() {
            flags.push(format!("-L{}", self.library_dir));
        }
        flags.push("-lmempatch_core".to_string());
        flags.extend(split_flags(&self.extra_ldflags));
        flags
    }
}

fn split_flags(flags: &str) -> Vec<String> {
    flags.split_whitespace().map(str::to_string).collect()
}

fn run_compiler(arguments: &[String]) -> Result<String> {
    let output = Command::new("g++")
        .args(arguments)
        .output()
        .map_err(|error| Error::Codegen(format!("could not run g++: {}", error)))?;
    let mut combined = format!("g++ {}\n", arguments.join(" "));
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(Error::Codegen(format!("g++ failed:\n{}", combined)));
    }
    Ok(combined)
}

/// Emit the unit holding a hook's body function and its assembly wrapper.
pub fn generate_hook_source(hook: &Hook) -> String {
    let safename = hook_safename(&hook.name);
    let mut output = String::with_capacity(4096);

    output.push_str(&format!("#include \"{}\"\n", PRELUDE_HEADER));
    for include in &hook.header_includes {
        output.push_str(&format!("#include <{}>\n", include));
    }
    output.push('\n');

    // The body function. Argument order matches the ten pushes the wrapper
    // performs: pointers into the pusha frame from edi up to eax, then the
    // relocated return address and the extra stack space.
    output.push_str(&format!(
        "extern \"C\" void {}(uint32_t& edi, uint32_t& esi, uint32_t& ebp, \
const uint32_t& espInsideFrame, uint32_t& ebx, uint32_t& edx, uint32_t& ecx, uint32_t& eax, \
uint32_t& returnAddress, uint8_t* extraStackSpace)\n",
        safename
    ));
    output.push_str("{\n");
    output.push_str(&format!(
        "    const uint32_t esp = espInsideFrame + {}; // esp before the hook call\n",
        hook.extra_stack + 4
    ));
    output.push_str(&format!(
        "    returnAddress += {}; // resume past the patched bytes\n",
        hook.return_rva
    ));
    output.push_str("    // Prologue\n");
    output.push_str(&format!("    {}\n", hook.prologue_src));
    output.push_str("    Registers registers;\n");
    for register in ["eax", "ebx", "ecx", "edx", "esp", "ebp", "esi", "edi"] {
        output.push_str(&format!("    registers.{} = {};\n", register, register));
    }
    output.push_str(&format!(
        "    mempatch_run_hook_callbacks(\"{}\", &registers, &returnAddress);\n",
        escape_c_string(&hook.name)
    ));
    // Callback mutations flow back into the pusha frame and reach the
    // target through popa. esp itself stays untouched.
    for register in ["eax", "ebx", "ecx", "edx", "ebp", "esi", "edi"] {
        output.push_str(&format!("    {} = registers.{};\n", register, register));
    }
    output.push_str("    // Epilogue\n");
    output.push_str(&format!("    {}\n", hook.epilogue_src));
    output.push_str("    (void)extraStackSpace;\n");
    output.push_str("}\n\n");

    // The wrapper. 32 is the size of the pusha image.
    output.push_str(&format!(
        "extern \"C\" __attribute__ ((visibility (\"default\"))) void {}_wrapper();\n",
        safename
    ));
    output.push_str(&format!("asm(\".globl {}_wrapper\\n\"\n", safename));
    output.push_str(&format!("    \"{}_wrapper:\\n\\t\"\n", safename));
    // Raw prologue bytes run outside the call-frame pretence.
    output.push_str("    \"addl $4, %esp\\n\\t\"\n");
    for byte in &hook.prologue_raw_bytes {
        output.push_str(&format!("    \".byte {}\\n\\t\"\n", byte));
    }
    output.push_str("    \"subl $4, %esp\\n\\t\"\n");
    // Extra stack, register save, return-address relocation.
    output.push_str(&format!("    \"subl ${}, %esp\\n\\t\"\n", hook.extra_stack));
    output.push_str("    \"pusha\\n\\t\"\n");
    output.push_str(&format!(
        "    \"movl {}(%esp), %eax\\n\\t\"\n",
        32 + hook.extra_stack
    ));
    output.push_str("    \"movl %eax, 32(%esp)\\n\\t\"\n");
    // Ten argument pushes: extra-stack start, return address, then the
    // saved registers from eax down to edi.
    output.push_str(&format!(
        "    \"leal {}(%esp), %eax\\n\\t\"\n",
        32 + hook.extra_stack
    ));
    output.push_str("    \"push %eax\\n\\t\"\n");
    output.push_str(&format!("    \"subl ${}, %eax\\n\\t\"\n", hook.extra_stack));
    output.push_str("    \"push %eax\\n\\t\"\n");
    for _ in 0..8 {
        output.push_str("    \"subl $4, %eax\\n\\t\"\n");
        output.push_str("    \"push %eax\\n\\t\"\n");
    }
    output.push_str(&format!("    \"call {}\\n\\t\"\n", safename));
    output.push_str("    \"addl $40, %esp\\n\\t\"\n");
    output.push_str("    \"popa\\n\\t\"\n");
    // Raw epilogue bytes, also outside the call-frame pretence.
    output.push_str("    \"addl $4, %esp\\n\\t\"\n");
    for byte in &hook.epilogue_raw_bytes {
        output.push_str(&format!("    \".byte {}\\n\\t\"\n", byte));
    }
    output.push_str("    \"subl $4, %esp\\n\\t\"\n");
    output.push_str(&format!(
        "    \"ret ${}\\n\\t\"\n",
        hook.stack_pop_after_return
    ));
    output.push_str(");\n");

    output
}

/// Emit the unit holding a pack's shared variables and hook-patch callbacks.
pub fn generate_pack_source(pack: &PatchPack) -> String {
    let safename = pack_safename(&pack.info.name);
    let mut output = String::with_capacity(4096);

    output.push_str(&format!("#include \"{}\"\n", PRELUDE_HEADER));
    for include in &pack.header_includes {
        output.push_str(&format!("#include <{}>\n", include));
    }
    output.push('\n');

    if !pack.shared_variables.is_empty() {
        output.push_str("namespace\n{\n");
        for (name, type_name) in &pack.shared_variables {
            output.push_str(&format!("    {} {};\n", type_name, name));
        }
        output.push_str("}\n\n");
    }

    let mut index = 0usize;
    for patch in &pack.patches {
        if let Patch::Hook(hook_patch) = patch {
            output.push_str(&format!(
                "extern \"C\" __attribute__ ((visibility (\"default\"))) void {}_hookpatch{}\
(Registers* registersPtr, uint32_t* returnAddressPtr, const ExtraSetting* extraSettings, \
size_t extraSettingsCount)\n",
                safename, index
            ));
            output.push_str("{\n");
            output.push_str("    Registers& registers = *registersPtr;\n");
            output.push_str("    uint32_t& returnAddress = *returnAddressPtr;\n");
            output.push_str("    (void)registers; (void)returnAddress;\n");
            output.push_str("    (void)extraSettings; (void)extraSettingsCount;\n");
            output.push_str(&format!("    {}\n", hook_patch.function_body));
            output.push_str("}\n\n");
            index += 1;
        }
    }

    output
}

fn escape_c_string(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Standard reflected CRC-32. Only self-consistency matters here (the value
/// gates recompilation), but the standard polynomial means the stored
/// checksums are recognisable when debugging the settings file.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use mempatch_common::hook::HookBody;
    use mempatch_common::info::Info;
    use mempatch_common::patch::HookPatch;
    use mempatch_common::pattern::Search;

    fn sample_hook() -> Hook {
        Hook {
            name: "frame".to_string(),
            hook_rva: 0,
            return_rva: 2,
            extra_stack: 16,
            stack_pop_after_return: 8,
            prologue_raw_bytes: vec![0x60],
            epilogue_raw_bytes: vec![0x61],
            body: HookBody::Search(Search {
                module_name: "libgame.so".to_string(),
                search_bytes: vec![0x90; 7],
                ..Search::default()
            }),
            ..Hook::default()
        }
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_ne!(crc32(b"a"), crc32(b"b"));
    }

    #[test]
    fn test_hook_source_contains_the_wrapper_contract() {
        let source = generate_hook_source(&sample_hook());
        let safename = hook_safename("frame");

        assert!(source.contains(&format!("{}_wrapper:", safename)));
        // Frame: extra stack, pusha, return-address relocation by eax.
        assert!(source.contains("\"subl $16, %esp\\n\\t\""));
        assert!(source.contains("\"pusha\\n\\t\""));
        assert!(source.contains("\"movl 48(%esp), %eax\\n\\t\""));
        assert!(source.contains("\"movl %eax, 32(%esp)\\n\\t\""));
        // Cleanup: ten argument slots, popa, ret imm16.
        assert!(source.contains("\"addl $40, %esp\\n\\t\""));
        assert!(source.contains("\"popa\\n\\t\""));
        assert!(source.contains("\"ret $8\\n\\t\""));
        // Raw prologue/epilogue bytes run with the call-frame pretence
        // suppressed.
        assert!(source.contains("\".byte 96\\n\\t\""));
        assert!(source.contains("\".byte 97\\n\\t\""));

        // The body reconstructs esp, redirects the return address and
        // dispatches into the core.
        assert!(source.contains("espInsideFrame + 20"));
        assert!(source.contains("returnAddress += 2"));
        assert!(source.contains("mempatch_run_hook_callbacks(\"frame\""));
        // Callback register mutations are copied back for popa.
        assert!(source.contains("eax = registers.eax;"));
    }

    #[test]
    fn test_pack_source_numbers_hook_patches() {
        let pack = PatchPack {
            info: Info {
                name: "combo".to_string(),
                ..Info::default()
            },
            patches: vec![
                Patch::Hook(HookPatch {
                    hook_name: "a".to_string(),
                    function_body: "registers.eax = 1;".to_string(),
                }),
                Patch::Hook(HookPatch {
                    hook_name: "b".to_string(),
                    function_body: "returnAddress += 4;".to_string(),
                }),
            ],
            header_includes: vec!["vector".to_string()],
            shared_variables: [("counter".to_string(), "uint32_t".to_string())]
                .into_iter()
                .collect(),
            ..PatchPack::default()
        };

        let source = generate_pack_source(&pack);
        let safename = pack_safename("combo");
        assert!(source.contains(&format!("{}_hookpatch0", safename)));
        assert!(source.contains(&format!("{}_hookpatch1", safename)));
        assert!(source.contains("uint32_t counter;"));
        assert!(source.contains("#include <vector>"));
        assert!(source.contains("registers.eax = 1;"));
    }

    #[test]
    fn test_hook_names_are_escaped_into_the_source() {
        let mut hook = sample_hook();
        hook.name = "quo\"te".to_string();
        let source = generate_hook_source(&hook);
        assert!(source.contains("mempatch_run_hook_callbacks(\"quo\\\"te\""));
    }
}
