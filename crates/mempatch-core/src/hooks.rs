//! Hook runtime: the callback sets behind every registered hook, the C ABI
//! the generated artifact dispatches through, and the trampoline patches
//! that splice hooks into the target.
//!
//! The artifact exports one `<safename>_wrapper` trampoline and one
//! `<safename>` body per hook; the body hands control back to this runtime
//! through [`mempatch_run_hook_callbacks`], which runs the attached
//! callbacks under the hook's own mutex, in attachment order. Keeping the
//! callback sets in the core (instead of artifact globals) is what lets
//! them survive artifact reloads.

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use mempatch_common::error::{Error, Result};
use mempatch_common::hook::{hook_safename, Hook, HookBody};
use mempatch_common::info::ExtraSettings;
use mempatch_common::module::Module;
use mempatch_common::patch::{Patch, ReplaceNamePatch, ReplaceSearchPatch};

use crate::patcher::{PatchGroupId, Patcher, RelAddrReplaces};

/// CPU state snapshot handed to hook callbacks, in the order the generated
/// body assembles it from the `pusha` frame. Mutations propagate back into
/// the target through `popa` when the trampoline returns.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
}

/// Label/value view of one extra setting, valid for the duration of a
/// callback invocation.
#[repr(C)]
pub struct RawExtraSetting {
    pub label: *const c_char,
    pub value: *const c_char,
}

/// Hook-patch callback ABI. `return_address` is authoritative: writing it
/// redirects where the target resumes.
pub type HookCallbackFn = unsafe extern "C" fn(
    registers: *mut Registers,
    return_address: *mut u32,
    extra_settings: *const RawExtraSetting,
    extra_settings_len: usize,
);

/// Symbol resolution facet of a loaded artifact. [`Module`] is the real
/// implementation; tests substitute their own.
pub trait Artifact: Send {
    fn symbol(&self, name: &str) -> Result<usize>;
    fn close(self: Box<Self>) -> Result<()>;
}

impl Artifact for Module {
    fn symbol(&self, name: &str) -> Result<usize> {
        Module::symbol(self, name)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.unload(true)?;
        Ok(())
    }
}

struct CallbackEntry {
    function: HookCallbackFn,
    labels: Vec<CString>,
    values: Vec<CString>,
}

impl CallbackEntry {
    fn new(function: HookCallbackFn, settings: &ExtraSettings) -> Self {
        let sanitize =
            |text: &str| CString::new(text.replace('\0', "")).unwrap_or_default();
        Self {
            function,
            labels: settings.iter().map(|s| sanitize(&s.label)).collect(),
            values: settings.iter().map(|s| sanitize(&s.current_value)).collect(),
        }
    }
}

struct HookEntry {
    hook: Hook,
    group_id: Option<PatchGroupId>,
    /// Attachment-ordered callback set; its mutex serialises callbacks per
    /// hook while leaving cross-hook parallelism possible.
    callbacks: Arc<Mutex<Vec<CallbackEntry>>>,
}

struct RuntimeInner {
    hooks: Vec<HookEntry>,
    artifact: Option<Box<dyn Artifact>>,
    /// Callback sets saved across an artifact swap, keyed by hook name.
    stash: HashMap<String, Vec<CallbackEntry>>,
}

pub struct HookRuntime {
    patcher: Arc<Patcher>,
    inner: Mutex<RuntimeInner>,
}

/// Routes [`mempatch_run_hook_callbacks`] to the runtime the entry point
/// installed. Held weakly so dropping the runtime disarms the shim.
static ACTIVE_RUNTIME: Mutex<Option<Weak<HookRuntime>>> = Mutex::new(None);

impl HookRuntime {
    pub fn new(patcher: Arc<Patcher>) -> Self {
        Self {
            patcher,
            inner: Mutex::new(RuntimeInner {
                hooks: Vec::new(),
                artifact: None,
                stash: HashMap::new(),
            }),
        }
    }

    /// Make this runtime the target of the C dispatch entry point.
    pub fn install(self: &Arc<Self>) {
        *ACTIVE_RUNTIME.lock().unwrap() = Some(Arc::downgrade(self));
    }

    /// Register a hook and, when an artifact is loaded, apply its trampoline
    /// patch.
    pub fn register_hook(&self, hook: Hook) -> Result<()> {
        hook.check_valid()?;
        let mut inner = self.inner.lock().unwrap();
        let mut entry = HookEntry {
            hook,
            group_id: None,
            callbacks: Arc::new(Mutex::new(Vec::new())),
        };
        if let Some(artifact) = &inner.artifact {
            entry.group_id = Some(apply_hook(&self.patcher, &entry.hook, artifact.as_ref())?);
        }
        debug!(hook = %entry.hook.name, "hook registered");
        inner.hooks.push(entry);
        Ok(())
    }

    /// Unapply and forget a hook. Unknown names are ignored.
    pub fn unregister_hook(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.hooks.iter().position(|entry| entry.hook.name == name) else {
            return Ok(());
        };
        let entry = inner.hooks.remove(index);
        if let Some(group_id) = entry.group_id {
            self.patcher.undo(group_id)?;
        }
        debug!(hook = name, "hook unregistered");
        Ok(())
    }

    pub fn is_hook_registered(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .hooks
            .iter()
            .any(|entry| entry.hook.name == name)
    }

    /// Attach a callback to a named hook. Re-attaching an already-attached
    /// function keeps its position and replaces its settings.
    pub fn attach(
        &self,
        hook_name: &str,
        function: HookCallbackFn,
        settings: &ExtraSettings,
    ) -> Result<()> {
        let callbacks = self.callbacks_handle(hook_name)?;
        let mut callbacks = callbacks.lock().unwrap();
        let entry = CallbackEntry::new(function, settings);
        match callbacks
            .iter_mut()
            .find(|existing| existing.function as usize == function as usize)
        {
            Some(existing) => *existing = entry,
            None => callbacks.push(entry),
        }
        Ok(())
    }

    /// Detach a callback; absent functions are ignored.
    pub fn detach(&self, hook_name: &str, function: HookCallbackFn) -> Result<()> {
        let callbacks = self.callbacks_handle(hook_name)?;
        let mut callbacks = callbacks.lock().unwrap();
        if let Some(index) = callbacks
            .iter()
            .position(|existing| existing.function as usize == function as usize)
        {
            callbacks.remove(index);
        }
        Ok(())
    }

    /// The attached callback functions, in attachment order.
    pub fn callbacks_of(&self, hook_name: &str) -> Result<Vec<HookCallbackFn>> {
        let callbacks = self.callbacks_handle(hook_name)?;
        let callbacks = callbacks.lock().unwrap();
        Ok(callbacks.iter().map(|entry| entry.function).collect())
    }

    fn callbacks_handle(&self, hook_name: &str) -> Result<Arc<Mutex<Vec<CallbackEntry>>>> {
        let inner = self.inner.lock().unwrap();
        inner
            .hooks
            .iter()
            .find(|entry| entry.hook.name == hook_name)
            .map(|entry| Arc::clone(&entry.callbacks))
            .ok_or_else(|| Error::validation(format!("no hook named `{}' is registered", hook_name)))
    }

    /// Resolve a symbol in the loaded artifact.
    pub fn artifact_symbol(&self, name: &str) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        match &inner.artifact {
            Some(artifact) => artifact.symbol(name),
            None => Err(Error::module("no artifact is loaded")),
        }
    }

    pub fn is_artifact_loaded(&self) -> bool {
        self.inner.lock().unwrap().artifact.is_some()
    }

    /// Swap in a (new) artifact: resolve every hook's symbols afresh, merge
    /// the stashed callback sets back in, reapply every trampoline patch.
    pub fn load_artifact(&self, artifact: Box<dyn Artifact>) -> Result<()> {
        if self.is_artifact_loaded() {
            self.unload_artifact()?;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.artifact = Some(artifact);

        let inner = &mut *inner;
        let mut stash = std::mem::take(&mut inner.stash);
        let artifact = inner.artifact.as_deref().unwrap();
        for entry in &mut inner.hooks {
            if let Some(saved) = stash.remove(&entry.hook.name) {
                let mut callbacks = entry.callbacks.lock().unwrap();
                merge_stashed(&mut callbacks, saved);
            }
            entry.group_id = Some(apply_hook(&self.patcher, &entry.hook, artifact)?);
        }
        debug!("artifact loaded, {} hook(s) applied", inner.hooks.len());
        Ok(())
    }

    /// Unapply every hook patch, stash the callback sets for the next load,
    /// close the artifact handle.
    pub fn unload_artifact(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.artifact.is_none() {
            return Ok(());
        }

        let mut stash = HashMap::new();
        for entry in &mut inner.hooks {
            if let Some(group_id) = entry.group_id.take() {
                self.patcher.undo(group_id)?;
            }
            let saved = std::mem::take(&mut *entry.callbacks.lock().unwrap());
            stash.insert(entry.hook.name.clone(), saved);
        }
        inner.stash = stash;

        if let Some(artifact) = inner.artifact.take() {
            artifact.close()?;
        }
        debug!("artifact unloaded, callback sets stashed");
        Ok(())
    }

    /// Tear down everything: hooks unapplied and forgotten, artifact closed.
    pub fn shutdown(&self) -> Result<()> {
        self.unload_artifact()?;
        let mut inner = self.inner.lock().unwrap();
        inner.hooks.clear();
        inner.stash.clear();
        Ok(())
    }

    /// Run the callbacks attached to `hook_name`. Invoked from the generated
    /// artifact on the target's thread.
    pub fn dispatch(&self, hook_name: &str, registers: &mut Registers, return_address: &mut u32) {
        let callbacks = match self.callbacks_handle(hook_name) {
            Ok(callbacks) => callbacks,
            Err(_) => {
                warn!(hook = hook_name, "dispatch for unknown hook");
                return;
            }
        };
        let callbacks = callbacks.lock().unwrap();
        for entry in callbacks.iter() {
            let raw: Vec<RawExtraSetting> = entry
                .labels
                .iter()
                .zip(&entry.values)
                .map(|(label, value)| RawExtraSetting {
                    label: label.as_ptr(),
                    value: value.as_ptr(),
                })
                .collect();
            // SAFETY: the callback contract is the C ABI declared above; the
            // raw settings outlive the call.
            unsafe {
                (entry.function)(registers, return_address, raw.as_ptr(), raw.len());
            }
        }
    }
}

/// Merge a stashed callback set into the live one, preserving stash order
/// and skipping functions the live set already holds.
fn merge_stashed(live: &mut Vec<CallbackEntry>, stashed: Vec<CallbackEntry>) {
    for entry in stashed {
        if !live
            .iter()
            .any(|existing| existing.function as usize == entry.function as usize)
        {
            live.push(entry);
        }
    }
}

/// Build and enqueue the trampoline patch for a hook: an `E8 <disp32>` at
/// `hook_rva` targeting the artifact's wrapper, every other window byte left
/// untouched.
fn apply_hook(patcher: &Patcher, hook: &Hook, artifact: &dyn Artifact) -> Result<PatchGroupId> {
    let wrapper = artifact.symbol(&format!("{}_wrapper", hook_safename(&hook.name)))?;

    let window_len = hook.window_len();
    let mut replace_bytes = vec![0u8; window_len];
    replace_bytes[hook.hook_rva] = 0xE8;
    let ignored_replace_rvas = (0..window_len)
        .filter(|rva| *rva != hook.hook_rva)
        .collect();

    let patch = match &hook.body {
        HookBody::Name(search) => Patch::ReplaceName(ReplaceNamePatch {
            search: search.clone(),
            replace_bytes,
            ignored_replace_rvas,
        }),
        HookBody::Search(search) => Patch::ReplaceSearch(ReplaceSearchPatch {
            search: search.clone(),
            replace_bytes,
            ignored_replace_rvas,
        }),
        HookBody::Blank => return Err(Error::validation("a hook cannot be blank")),
    };

    let mut rel_addr_replaces = RelAddrReplaces::new();
    rel_addr_replaces.insert(hook.hook_rva + 1, wrapper);
    patcher.add_to_queue(vec![(patch, rel_addr_replaces)], None, None, None)
}

/// C entry point the generated hook bodies call. `hook_name` is the hook's
/// display name as a NUL-terminated string baked into the artifact.
///
/// # Safety
///
/// All pointers must be valid for the duration of the call; the registers
/// and return-address referents must be exclusively borrowed by this frame.
#[no_mangle]
pub unsafe extern "C" fn mempatch_run_hook_callbacks(
    hook_name: *const c_char,
    registers: *mut Registers,
    return_address: *mut u32,
) {
    if hook_name.is_null() || registers.is_null() || return_address.is_null() {
        return;
    }
    let name = match CStr::from_ptr(hook_name).to_str() {
        Ok(name) => name,
        Err(_) => return,
    };
    let runtime = match ACTIVE_RUNTIME.lock() {
        Ok(guard) => guard.as_ref().and_then(Weak::upgrade),
        Err(_) => return,
    };
    if let Some(runtime) = runtime {
        // This frame sits between the target's code and the trampoline; a
        // panic must not unwind across it.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.dispatch(name, &mut *registers, &mut *return_address);
        }));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use mempatch_common::info::ExtraSetting;
    use mempatch_common::pattern::Search;

    /// Artifact stub resolving every `hook_*_wrapper` symbol to a dummy
    /// address; close is a no-op.
    pub(crate) struct StubArtifact {
        pub extra_symbols: HashMap<String, usize>,
    }

    impl StubArtifact {
        pub(crate) fn new() -> Box<Self> {
            Box::new(Self {
                extra_symbols: HashMap::new(),
            })
        }
    }

    impl Artifact for StubArtifact {
        fn symbol(&self, name: &str) -> Result<usize> {
            if let Some(address) = self.extra_symbols.get(name) {
                return Ok(*address);
            }
            if name.starts_with("hook_") && name.ends_with("_wrapper") {
                return Ok(0x1000_0000);
            }
            Err(Error::SymbolNotFound {
                symbol: name.to_string(),
                message: "not in stub".to_string(),
            })
        }

        fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn sample_hook(name: &str) -> Hook {
        Hook {
            name: name.to_string(),
            hook_rva: 0,
            return_rva: 0,
            body: HookBody::Search(Search {
                module_name: "libnot-loaded-anywhere.so".to_string(),
                search_bytes: vec![0x90; 5],
                ..Search::default()
            }),
            ..Hook::default()
        }
    }

    static CALLS_A: AtomicU32 = AtomicU32::new(0);
    static CALLS_B: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn callback_a(
        registers: *mut Registers,
        _return_address: *mut u32,
        _settings: *const RawExtraSetting,
        _settings_len: usize,
    ) {
        CALLS_A.fetch_add(1, Ordering::SeqCst);
        (*registers).eax = 0x1234;
    }

    unsafe extern "C" fn callback_b(
        _registers: *mut Registers,
        return_address: *mut u32,
        settings: *const RawExtraSetting,
        settings_len: usize,
    ) {
        CALLS_B.fetch_add(1, Ordering::SeqCst);
        *return_address += 2;
        if settings_len > 0 {
            // Touch the settings view so a bad pointer would crash loudly.
            let first = &*settings;
            let _ = CStr::from_ptr(first.label);
        }
    }

    fn runtime_with_hook(name: &str) -> (Arc<HookRuntime>, Arc<Patcher>) {
        let patcher = Arc::new(Patcher::new());
        let runtime = Arc::new(HookRuntime::new(Arc::clone(&patcher)));
        runtime.load_artifact(StubArtifact::new()).unwrap();
        runtime.register_hook(sample_hook(name)).unwrap();
        (runtime, patcher)
    }

    #[test]
    fn test_attach_keeps_insertion_order() {
        let (runtime, _patcher) = runtime_with_hook("ordered");
        runtime.attach("ordered", callback_a, &Vec::new()).unwrap();
        runtime.attach("ordered", callback_b, &Vec::new()).unwrap();

        let callbacks = runtime.callbacks_of("ordered").unwrap();
        assert_eq!(callbacks.len(), 2);
        assert_eq!(callbacks[0] as usize, callback_a as usize);
        assert_eq!(callbacks[1] as usize, callback_b as usize);

        // Re-attaching the first keeps its slot.
        runtime.attach("ordered", callback_a, &Vec::new()).unwrap();
        let callbacks = runtime.callbacks_of("ordered").unwrap();
        assert_eq!(callbacks.len(), 2);
        assert_eq!(callbacks[0] as usize, callback_a as usize);
    }

    #[test]
    fn test_attach_to_unknown_hook_fails() {
        let (runtime, _patcher) = runtime_with_hook("known");
        assert!(runtime.attach("unknown", callback_a, &Vec::new()).is_err());
    }

    #[test]
    fn test_dispatch_runs_callbacks_and_propagates_mutations() {
        let (runtime, _patcher) = runtime_with_hook("dispatched");
        let settings = vec![ExtraSetting {
            label: "scale".to_string(),
            current_value: "2".to_string(),
            ..ExtraSetting::default()
        }];
        runtime.attach("dispatched", callback_a, &settings).unwrap();
        runtime.attach("dispatched", callback_b, &settings).unwrap();

        let a_before = CALLS_A.load(Ordering::SeqCst);
        let b_before = CALLS_B.load(Ordering::SeqCst);

        let mut registers = Registers::default();
        let mut return_address = 0x4000u32;
        runtime.dispatch("dispatched", &mut registers, &mut return_address);

        assert_eq!(CALLS_A.load(Ordering::SeqCst), a_before + 1);
        assert_eq!(CALLS_B.load(Ordering::SeqCst), b_before + 1);
        assert_eq!(registers.eax, 0x1234);
        assert_eq!(return_address, 0x4002);
    }

    #[test]
    fn test_callbacks_survive_artifact_swap() {
        let (runtime, patcher) = runtime_with_hook("survivor");
        runtime.attach("survivor", callback_a, &Vec::new()).unwrap();
        runtime.attach("survivor", callback_b, &Vec::new()).unwrap();

        // Swap the artifact twice; the set must come through unchanged.
        for _ in 0..2 {
            runtime.unload_artifact().unwrap();
            assert!(runtime.callbacks_of("survivor").unwrap().is_empty());
            runtime.load_artifact(StubArtifact::new()).unwrap();

            let callbacks = runtime.callbacks_of("survivor").unwrap();
            assert_eq!(callbacks.len(), 2);
            assert_eq!(callbacks[0] as usize, callback_a as usize);
            assert_eq!(callbacks[1] as usize, callback_b as usize);
        }

        // And each reload re-enqueued the trampoline patch.
        let hook_groups = {
            let inner = runtime.inner.lock().unwrap();
            inner.hooks[0].group_id
        };
        assert!(hook_groups.is_some());
        assert!(patcher.state_of(hook_groups.unwrap()).is_some());
    }

    #[test]
    fn test_unregister_undoes_the_trampoline_group() {
        let (runtime, patcher) = runtime_with_hook("short-lived");
        let group_id = {
            let inner = runtime.inner.lock().unwrap();
            inner.hooks[0].group_id.unwrap()
        };
        assert!(patcher.state_of(group_id).is_some());
        runtime.unregister_hook("short-lived").unwrap();
        assert!(patcher.state_of(group_id).is_none());
        assert!(!runtime.is_hook_registered("short-lived"));
    }

    #[test]
    fn test_extern_dispatch_entry() {
        let (runtime, _patcher) = runtime_with_hook("外部");
        runtime.install();
        runtime.attach("外部", callback_a, &Vec::new()).unwrap();

        let before = CALLS_A.load(Ordering::SeqCst);
        let name = CString::new("外部").unwrap();
        let mut registers = Registers::default();
        let mut return_address = 0u32;
        // SAFETY: all pointers are to live locals.
        unsafe {
            mempatch_run_hook_callbacks(name.as_ptr(), &mut registers, &mut return_address);
        }
        assert_eq!(CALLS_A.load(Ordering::SeqCst), before + 1);
    }
}
