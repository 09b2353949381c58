//! Hook descriptions: where to splice a trampoline call and how the
//! generated wrapper must behave around it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pattern::{NameSearch, Search};
use crate::wire::{self, Wire, WireReader};

/// Linker-safe symbol stem for a hook: arbitrary display names become hex.
/// The generated artifact and the core must derive identical symbols from
/// the same hook name.
pub fn hook_safename(name: &str) -> String {
    let mut result = String::with_capacity(5 + name.len() * 2);
    result.push_str("hook_");
    for byte in name.as_bytes() {
        result.push_str(&format!("{:02x}", byte));
    }
    result
}

/// How a hook's patch site is located.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum HookBody {
    /// Valid only while under construction; rejected by validation.
    #[default]
    Blank,
    Name(NameSearch),
    Search(Search),
}

const WIRE_BODY_BLANK: u32 = 0;
const WIRE_BODY_NAME: u32 = 1;
const WIRE_BODY_SEARCH: u32 = 2;

/// A function hook. The patched site becomes `E8 <disp32>` at `hook_rva`
/// targeting the generated trampoline; execution resumes `return_rva` bytes
/// after the patched call.
///
/// `prologue_raw_bytes` and `epilogue_raw_bytes` run before and after the
/// trampoline frame. They must not move the stack pointer or write below it
/// (reads are fine): the return address has not been relocated yet when they
/// run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub name: String,
    #[serde(default)]
    pub hook_rva: usize,
    #[serde(default)]
    pub return_rva: usize,
    #[serde(default)]
    pub extra_stack: usize,
    #[serde(default)]
    pub stack_pop_after_return: usize,
    #[serde(default)]
    pub prologue_src: String,
    #[serde(default)]
    pub epilogue_src: String,
    #[serde(default)]
    pub prologue_raw_bytes: Vec<u8>,
    #[serde(default)]
    pub epilogue_raw_bytes: Vec<u8>,
    #[serde(default)]
    pub header_includes: Vec<String>,
    pub body: HookBody,
}

impl Hook {
    /// Bytes the search window must cover: the patched `E8 <disp32>` at
    /// `hook_rva` plus the skipped `return_rva` tail.
    pub fn min_window(&self) -> usize {
        self.hook_rva + 5 + self.return_rva
    }

    pub fn check_valid(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("the hook name cannot be empty"));
        }
        match &self.body {
            HookBody::Blank => Err(Error::validation("a hook cannot be blank")),
            HookBody::Name(search) => search.check_valid(self.min_window()),
            HookBody::Search(search) => search.check_valid(self.min_window()),
        }
    }

    /// The module the hook patches.
    pub fn module_name(&self) -> &str {
        match &self.body {
            HookBody::Blank => "",
            HookBody::Name(search) => &search.search.module_name,
            HookBody::Search(search) => &search.module_name,
        }
    }

    /// Length of the hook's search window.
    pub fn window_len(&self) -> usize {
        match &self.body {
            HookBody::Blank => 0,
            HookBody::Name(search) => search.search.search_bytes.len(),
            HookBody::Search(search) => search.search_bytes.len(),
        }
    }
}

impl Wire for Hook {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_string(out, &self.name);
        wire::put_size(out, self.hook_rva);
        wire::put_size(out, self.return_rva);
        wire::put_size(out, self.extra_stack);
        wire::put_size(out, self.stack_pop_after_return);
        wire::put_string(out, &self.prologue_src);
        wire::put_string(out, &self.epilogue_src);
        wire::put_bytes(out, &self.prologue_raw_bytes);
        wire::put_bytes(out, &self.epilogue_raw_bytes);
        wire::put_strings(out, &self.header_includes);
        match &self.body {
            HookBody::Blank => wire::put_u32(out, WIRE_BODY_BLANK),
            HookBody::Name(search) => {
                wire::put_u32(out, WIRE_BODY_NAME);
                wire::put_entity(out, search);
            }
            HookBody::Search(search) => {
                wire::put_u32(out, WIRE_BODY_SEARCH);
                wire::put_entity(out, search);
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let name = r.string()?;
        let hook_rva = r.size()?;
        let return_rva = r.size()?;
        let extra_stack = r.size()?;
        let stack_pop_after_return = r.size()?;
        let prologue_src = r.string()?;
        let epilogue_src = r.string()?;
        let prologue_raw_bytes = r.bytes()?;
        let epilogue_raw_bytes = r.bytes()?;
        let header_includes = r.strings()?;
        let body = match r.u32()? {
            WIRE_BODY_BLANK => HookBody::Blank,
            WIRE_BODY_NAME => HookBody::Name(r.entity()?),
            WIRE_BODY_SEARCH => HookBody::Search(r.entity()?),
            other => {
                return Err(Error::protocol(format!(
                    "unknown hook body discriminant {}",
                    other
                )))
            }
        };
        Ok(Hook {
            name,
            hook_rva,
            return_rva,
            extra_stack,
            stack_pop_after_return,
            prologue_src,
            epilogue_src,
            prologue_raw_bytes,
            epilogue_raw_bytes,
            header_includes,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hook(window: usize) -> Hook {
        Hook {
            name: "on_frame".to_string(),
            hook_rva: 2,
            return_rva: 1,
            extra_stack: 16,
            stack_pop_after_return: 4,
            prologue_src: "int frame = 0;".to_string(),
            epilogue_src: String::new(),
            prologue_raw_bytes: vec![0x60],
            epilogue_raw_bytes: vec![0x61],
            header_includes: vec!["cstdint".to_string()],
            body: HookBody::Name(NameSearch {
                search: Search {
                    module_name: "libgame.so".to_string(),
                    search_bytes: vec![0x90; window],
                    ..Search::default()
                },
                function_name: "render".to_string(),
                function_rva: 0,
            }),
        }
    }

    #[test]
    fn test_safename_is_hex_of_the_name() {
        assert_eq!(hook_safename("ab"), "hook_6162");
        assert_eq!(hook_safename("Frame Hook!"), "hook_4672616d6520486f6f6b21");
    }

    #[test]
    fn test_window_must_fit_patched_call() {
        // hook_rva + 5 + return_rva = 8 bytes needed.
        assert!(sample_hook(8).check_valid().is_ok());
        assert!(sample_hook(7).check_valid().is_err());
    }

    #[test]
    fn test_blank_hook_is_rejected() {
        let mut hook = sample_hook(8);
        hook.body = HookBody::Blank;
        assert!(hook.check_valid().is_err());
    }

    #[test]
    fn test_hook_wire_round_trip() {
        let hook = sample_hook(12);
        let decoded = Hook::from_bytes(&hook.to_bytes()).unwrap();
        assert_eq!(decoded, hook);

        let mut search_hook = sample_hook(12);
        search_hook.body = HookBody::Search(Search {
            module_name: "libgame.so".to_string(),
            search_bytes: vec![0x0F, 0x1F, 0x40, 0x00, 0x90, 0x90, 0x90, 0x90],
            ..Search::default()
        });
        let decoded = Hook::from_bytes(&search_hook.to_bytes()).unwrap();
        assert_eq!(decoded, search_hook);
    }
}
