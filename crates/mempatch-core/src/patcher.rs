//! Patcher worker: a background queue that retries deferred patch groups
//! until every site in a group resolves, then writes all sites atomically
//! with respect to `undo`, keeping the original bytes for rollback.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use mempatch_common::error::{Error, Result};
use mempatch_common::memory;
use mempatch_common::patch::Patch;

use crate::shutdown::ShutdownSignal;

pub type PatchGroupId = u32;

/// Fired at most once, after the group table lock is released.
pub type GroupCallback = Box<dyn FnOnce(PatchGroupId) + Send>;

/// Map from a replace-bytes RVA to the absolute target address whose 32-bit
/// relative displacement is written there instead of literal bytes.
pub type RelAddrReplaces = BTreeMap<usize, usize>;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Queued,
    Patched,
    TimedOut,
}

struct QueuedPatch {
    patch: Patch,
    rel_addr_replaces: RelAddrReplaces,
    /// Site address to the exact bytes it held before the write.
    results: BTreeMap<usize, Vec<u8>>,
}

struct PatchGroup {
    patches: Vec<QueuedPatch>,
    seconds_to_try: Option<u64>,
    time_added: Instant,
    on_success: Option<GroupCallback>,
    on_failure: Option<GroupCallback>,
    state: GroupState,
}

struct PatcherState {
    groups: HashMap<PatchGroupId, PatchGroup>,
    queue: VecDeque<PatchGroupId>,
    next_id: PatchGroupId,
}

pub struct Patcher {
    state: Arc<Mutex<PatcherState>>,
    shutdown: Arc<ShutdownSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Patcher {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PatcherState {
                groups: HashMap::new(),
                queue: VecDeque::new(),
                next_id: 0,
            })),
            shutdown: Arc::new(ShutdownSignal::new()),
            worker: Mutex::new(None),
        }
    }

    /// Start the background worker. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        *worker = Some(std::thread::spawn(move || {
            while !shutdown.is_triggered() {
                fire(sweep(&state));
                if shutdown.wait(SWEEP_INTERVAL) {
                    break;
                }
            }
        }));
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&self) {
        self.shutdown.trigger();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Admit a group of replace patches to the retry queue.
    ///
    /// Every patch must be a `ReplaceName` or `ReplaceSearch` patch and its
    /// relative-address replaces must fit the replace bytes with at least 4
    /// bytes between keys. `seconds_to_try == None` retries forever.
    pub fn add_to_queue(
        &self,
        patches: Vec<(Patch, RelAddrReplaces)>,
        seconds_to_try: Option<u64>,
        on_success: Option<GroupCallback>,
        on_failure: Option<GroupCallback>,
    ) -> Result<PatchGroupId> {
        if patches.is_empty() {
            return Err(Error::validation("a patch group cannot be empty"));
        }
        for (patch, rel_addr_replaces) in &patches {
            let replace_len = match patch {
                Patch::ReplaceName(p) => {
                    p.check_valid()?;
                    p.replace_bytes.len()
                }
                Patch::ReplaceSearch(p) => {
                    p.check_valid()?;
                    p.replace_bytes.len()
                }
                _ => {
                    return Err(Error::validation(
                        "queued patches must be replace-name or replace-search patches",
                    ))
                }
            };
            let mut previous: Option<usize> = None;
            for rva in rel_addr_replaces.keys() {
                if rva + 4 > replace_len {
                    return Err(Error::validation(
                        "relative address replace RVAs + 4 must fit the replace bytes",
                    ));
                }
                if let Some(previous) = previous {
                    if *rva < previous + 4 {
                        return Err(Error::validation(
                            "relative address replace RVAs must be at least 4 bytes apart",
                        ));
                    }
                }
                previous = Some(*rva);
            }
        }

        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id = state
            .next_id
            .checked_add(1)
            .ok_or(Error::PatchGroupIdsExhausted)?;

        let group = PatchGroup {
            patches: patches
                .into_iter()
                .map(|(patch, rel_addr_replaces)| QueuedPatch {
                    patch,
                    rel_addr_replaces,
                    results: BTreeMap::new(),
                })
                .collect(),
            seconds_to_try,
            time_added: Instant::now(),
            on_success,
            on_failure,
            state: GroupState::Queued,
        };
        state.groups.insert(id, group);
        state.queue.push_back(id);
        debug!(group = id, "patch group queued");
        Ok(id)
    }

    /// Reverse a group: restore original bytes if it patched, drop it from
    /// the queue if it is still waiting, forget it if it timed out. Unknown
    /// ids are a logic error.
    pub fn undo(&self, id: PatchGroupId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let group = state.groups.get(&id).ok_or(Error::UnknownPatchGroup(id))?;

        match group.state {
            GroupState::Patched => {
                for patch in &group.patches {
                    for (site, original) in &patch.results {
                        // SAFETY: `original` was captured from exactly this
                        // span when the group applied.
                        unsafe { memory::safe_copy(original, *site)? };
                    }
                }
            }
            GroupState::Queued => {
                if let Some(index) = state.queue.iter().position(|queued| *queued == id) {
                    state.queue.remove(index);
                }
            }
            GroupState::TimedOut => {}
        }
        state.groups.remove(&id);
        debug!(group = id, "patch group undone");
        Ok(())
    }

    pub fn state_of(&self, id: PatchGroupId) -> Option<GroupState> {
        self.state.lock().unwrap().groups.get(&id).map(|g| g.state)
    }

    /// One queue pass, for tests that do not want to start the worker.
    #[cfg(test)]
    pub(crate) fn sweep_once(&self) {
        fire(sweep(&self.state));
    }
}

impl Default for Patcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Patcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the callbacks a sweep collected. A panicking callback must not take
/// the worker thread down with it.
fn fire(fired: Vec<(GroupCallback, PatchGroupId)>) {
    for (callback, id) in fired {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(id))).is_err() {
            tracing::error!(group = id, "patch group callback panicked");
        }
    }
}

/// Walk the queue once. Holds the state lock for the whole pass so a group's
/// application is atomic with respect to `undo`; the callbacks it returns
/// must be fired after the lock is gone.
fn sweep(state: &Mutex<PatcherState>) -> Vec<(GroupCallback, PatchGroupId)> {
    let mut fired = Vec::new();
    let mut guard = state.lock().unwrap();
    let state = &mut *guard;

    for _ in 0..state.queue.len() {
        let id = match state.queue.pop_front() {
            Some(id) => id,
            None => break,
        };
        let group = match state.groups.get_mut(&id) {
            Some(group) => group,
            None => continue,
        };

        if let Some(seconds) = group.seconds_to_try {
            if group.time_added.elapsed() > Duration::from_secs(seconds) {
                group.state = GroupState::TimedOut;
                debug!(group = id, "patch group timed out");
                if let Some(callback) = group.on_failure.take() {
                    fired.push((callback, id));
                }
                continue;
            }
        }

        if try_group(group) {
            group.state = GroupState::Patched;
            debug!(group = id, "patch group applied");
            if let Some(callback) = group.on_success.take() {
                fired.push((callback, id));
            }
        } else {
            // Not yet: clear any partial results and retry on a later sweep.
            // Search misses are expected while target modules are still
            // loading, so they are not logged per attempt.
            for patch in &mut group.patches {
                patch.results.clear();
            }
            state.queue.push_back(id);
        }
    }
    fired
}

/// Resolve every patch of the group and, only if all resolve, write every
/// site. Returns false on any miss or error; the caller clears partials.
fn try_group(group: &mut PatchGroup) -> bool {
    for patch in &mut group.patches {
        let sites = match &patch.patch {
            Patch::ReplaceName(p) => p.search.do_search(),
            Patch::ReplaceSearch(p) => p.search.do_search(),
            _ => unreachable!("non-replace patches are rejected at admission"),
        };
        match sites {
            Ok(sites) if !sites.is_empty() => {
                for site in sites {
                    patch.results.insert(site, Vec::new());
                }
            }
            Ok(_) => return false,
            Err(error) => {
                trace!("group attempt failed during search: {}", error);
                return false;
            }
        }
    }

    for patch in &mut group.patches {
        let (replace_bytes, ignored) = match &patch.patch {
            Patch::ReplaceName(p) => (p.replace_bytes.clone(), p.ignored_replace_rvas.clone()),
            Patch::ReplaceSearch(p) => (p.replace_bytes.clone(), p.ignored_replace_rvas.clone()),
            _ => unreachable!(),
        };
        for (site, original) in &mut patch.results {
            let applied = apply_site(
                *site,
                &replace_bytes,
                &ignored,
                &patch.rel_addr_replaces,
                original,
            );
            if let Err(error) = applied {
                trace!("apply at {:#x} failed: {}", site, error);
                return false;
            }
        }
    }
    true
}

/// Write one site: open its protection, capture the original bytes, walk the
/// replace bytes (relative-address slots first, then ignores, then
/// literals), restore the prior protections.
fn apply_site(
    site: usize,
    replace_bytes: &[u8],
    ignored: &BTreeSet<usize>,
    rel_addr_replaces: &RelAddrReplaces,
    original: &mut Vec<u8>,
) -> Result<()> {
    let covering = memory::query(site, replace_bytes.len())?;
    let mut changed = Vec::new();
    for region in &covering {
        if !region.readable || !region.writable {
            let mut open = region.clone();
            open.readable = true;
            open.writable = true;
            memory::change_protection(&open)?;
            changed.push(region.clone());
        }
    }

    // SAFETY: the span is mapped (query succeeded) and now readable.
    *original =
        unsafe { std::slice::from_raw_parts(site as *const u8, replace_bytes.len()) }.to_vec();

    // SAFETY: same span, now writable.
    unsafe { write_replace(site, replace_bytes, ignored, rel_addr_replaces) };

    for region in &changed {
        memory::change_protection(region)?;
    }
    Ok(())
}

/// The raw write walk, shared by the worker and its tests.
///
/// # Safety
///
/// `[site, site + replace_bytes.len())` must be mapped and writable.
unsafe fn write_replace(
    site: usize,
    replace_bytes: &[u8],
    ignored: &BTreeSet<usize>,
    rel_addr_replaces: &RelAddrReplaces,
) {
    let mut rva = 0;
    while rva < replace_bytes.len() {
        if let Some(target) = rel_addr_replaces.get(&rva) {
            // 32-bit displacement from the byte after the slot.
            let displacement = target.wrapping_sub(site + rva + 4) as u32;
            std::ptr::copy_nonoverlapping(
                displacement.to_le_bytes().as_ptr(),
                (site + rva) as *mut u8,
                4,
            );
            rva += 4;
            continue;
        }
        if !ignored.contains(&rva) {
            ((site + rva) as *mut u8).write(replace_bytes[rva]);
        }
        rva += 1;
    }
}
