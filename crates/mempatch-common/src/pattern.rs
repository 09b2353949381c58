//! Pattern engine: byte searches with wildcard positions and cursor-anchored
//! special predicates that interpret x86 call encodings and chase pointers.
//!
//! Call displacements and data pointers are read as 4-byte little-endian
//! values (the patch targets are 32-bit x86 images). On a 64-bit host this
//! limits pointer chasing to the low 4 GiB and relative reach to ±2 GiB;
//! in-target use is unaffected.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};
use crate::memory;
use crate::module::Module;
use crate::wire::{self, Wire, WireReader};

/// A byte pattern searched over a module's current regions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Search {
    pub module_name: String,
    pub search_bytes: Vec<u8>,
    /// Positions matching any byte. Specials take priority over these.
    #[serde(default)]
    pub ignored_rvas: BTreeSet<usize>,
    #[serde(default)]
    pub specials: Vec<SpecialSearch>,
}

/// A search anchored to an exported symbol: the window is exactly
/// `search_bytes.len()` bytes at `symbol(function_name) + function_rva`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameSearch {
    #[serde(flatten)]
    pub search: Search,
    pub function_name: String,
    pub function_rva: usize,
}

/// A predicate installed at one RVA inside a pattern window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialSearch {
    pub at_rva: usize,
    pub kind: SpecialSearchKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SpecialSearchKind {
    /// Valid only while under construction; rejected by validation.
    #[default]
    Blank,
    /// `E8 <disp32>` whose target is the named exported function.
    NamedRelCall {
        module_name: String,
        function_name: String,
    },
    /// `E8 <disp32>`; the inner search must match at the call target.
    UnnamedRelCall(Box<Search>),
    /// `FF 15 <ptr32>` where `*ptr` is the named exported function.
    NamedAbsIndirectCall {
        module_name: String,
        function_name: String,
    },
    /// `FF 15 <ptr32>`; the inner search must match at `*ptr`.
    UnnamedAbsIndirectCall(Box<Search>),
    /// 4-byte pointer at the cursor; the inner search must match where it
    /// points.
    DataPointer(Box<Search>),
}

const WIRE_SPECIAL_BLANK: u32 = 0;
const WIRE_SPECIAL_NAMED_REL_CALL: u32 = 1;
const WIRE_SPECIAL_UNNAMED_REL_CALL: u32 = 2;
const WIRE_SPECIAL_NAMED_ABS_INDIRECT: u32 = 3;
const WIRE_SPECIAL_UNNAMED_ABS_INDIRECT: u32 = 4;
const WIRE_SPECIAL_DATA_POINTER: u32 = 5;

#[inline]
unsafe fn read_u8(address: usize) -> u8 {
    (address as *const u8).read_unaligned()
}

#[inline]
unsafe fn read_u32(address: usize) -> u32 {
    (address as *const u32).read_unaligned()
}

/// Target of an `E8` relative call at `cursor` with displacement `disp`.
#[inline]
pub fn rel_call_target(cursor: usize, disp: i32) -> usize {
    cursor.wrapping_add(5).wrapping_add(disp as isize as usize)
}

/// Whether `[start, start + size)` is mapped and readable end to end.
fn span_is_readable(start: usize, size: usize) -> bool {
    match memory::query(start, size) {
        Ok(regions) => regions.iter().all(|r| r.readable),
        Err(_) => false,
    }
}

enum Position<'a> {
    Literal(u8),
    Ignored,
    Special(&'a SpecialSearch),
}

impl Search {
    pub fn check_valid(&self, min_search_bytes: usize) -> Result<()> {
        if self.module_name.is_empty() {
            return Err(Error::validation("the module name cannot be empty"));
        }
        self.check_valid_inner(min_search_bytes)
    }

    /// Validation without the module-name requirement; inner searches of
    /// special predicates run at a known cursor and ignore their module.
    fn check_valid_inner(&self, min_search_bytes: usize) -> Result<()> {
        if self.search_bytes.len() < min_search_bytes {
            return Err(Error::validation(format!(
                "there must be at least {} search byte(s)",
                min_search_bytes
            )));
        }
        for rva in &self.ignored_rvas {
            if *rva >= self.search_bytes.len() {
                return Err(Error::validation(
                    "all ignored search byte RVAs must be inside the search bytes",
                ));
            }
        }
        let mut used_rvas = BTreeSet::new();
        for special in &self.specials {
            if !used_rvas.insert(special.at_rva) {
                return Err(Error::validation(
                    "every special search needs a unique search byte RVA",
                ));
            }
            special.check_valid(self)?;
        }
        Ok(())
    }

    /// Search the whole target module, region by region. Unreadable regions
    /// are made readable for the duration of their scan.
    pub fn do_search(&self) -> Result<BTreeSet<usize>> {
        self.check_valid(self.search_bytes.len())?;
        let module = Module::open(&self.module_name)?;
        let mut results = BTreeSet::new();
        for region in module.current_regions() {
            results.extend(self.scan_guarded(region.start, region.size)?);
        }
        Ok(results)
    }

    /// Scan one span, upgrading protection on any unreadable region covering
    /// it and restoring the exact prior protections afterwards.
    pub fn scan_guarded(&self, start: usize, size: usize) -> Result<BTreeSet<usize>> {
        let covering = memory::query(start, size)?;
        let mut restores = Vec::new();
        for region in &covering {
            if !region.readable {
                let mut readable = region.clone();
                readable.readable = true;
                restores.push(memory::change_protection(&readable)?);
            }
        }

        let results = self.scan_span(start, size);

        for prior in restores.iter().flatten() {
            memory::change_protection(prior)?;
        }
        results
    }

    /// Scan `[start, start + size)` assuming it is readable. Matches are
    /// ascending; scanning resumes past each match, so matches within the
    /// span never overlap, and a window never extends past the span end.
    pub fn scan_span(&self, start: usize, size: usize) -> Result<BTreeSet<usize>> {
        trace!("scanning {:#x}..{:#x}", start, start + size);
        let positions = self.classify();
        let mut results = BTreeSet::new();
        if positions.is_empty() || size < positions.len() {
            return Ok(results);
        }

        let last_window = start + size - positions.len();
        let mut cursor = start;
        while cursor <= last_window {
            if self.matches_at(cursor, &positions) {
                results.insert(cursor);
                cursor += positions.len();
            } else {
                cursor += 1;
            }
        }
        Ok(results)
    }

    fn classify(&self) -> Vec<Position<'_>> {
        self.search_bytes
            .iter()
            .enumerate()
            .map(|(rva, byte)| {
                if let Some(special) = self.specials.iter().find(|s| s.at_rva == rva) {
                    Position::Special(special)
                } else if self.ignored_rvas.contains(&rva) {
                    Position::Ignored
                } else {
                    Position::Literal(*byte)
                }
            })
            .collect()
    }

    fn matches_at(&self, window: usize, positions: &[Position<'_>]) -> bool {
        for (offset, position) in positions.iter().enumerate() {
            let cursor = window + offset;
            match position {
                Position::Special(special) => {
                    if !special.matches(cursor) {
                        return false;
                    }
                }
                Position::Ignored => {}
                Position::Literal(byte) => {
                    // SAFETY: the caller guarantees the span is readable and
                    // the window lies inside it.
                    if unsafe { read_u8(cursor) } != *byte {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl NameSearch {
    pub fn check_valid(&self, min_search_bytes: usize) -> Result<()> {
        self.search.check_valid(min_search_bytes)?;
        if self.function_name.is_empty() {
            return Err(Error::validation("the function name cannot be empty"));
        }
        Ok(())
    }

    /// Search exactly one window of `search_bytes.len()` bytes at
    /// `symbol(function_name) + function_rva`.
    pub fn do_search(&self) -> Result<BTreeSet<usize>> {
        self.check_valid(self.search.search_bytes.len())?;
        let module = Module::open(&self.search.module_name)?;
        let start = module.symbol(&self.function_name)? + self.function_rva;
        self.search.scan_guarded(start, self.search.search_bytes.len())
    }

    /// Two name searches overlap when they anchor to the same function of
    /// the same module and their windows share any byte. Overlap is a hard
    /// error; the check is symmetric.
    pub fn check_overlap_with(&self, other: &NameSearch) -> Result<()> {
        if self.search.module_name != other.search.module_name
            || self.function_name != other.function_name
        {
            return Ok(());
        }
        let self_end = self.function_rva + self.search.search_bytes.len();
        let other_end = other.function_rva + other.search.search_bytes.len();
        if self.function_rva < other_end && other.function_rva < self_end {
            return Err(Error::validation(format!(
                "the search window overlaps another one on {}:{}",
                self.search.module_name, self.function_name
            )));
        }
        Ok(())
    }
}

impl SpecialSearch {
    /// Bytes the predicate consumes from `at_rva` onwards.
    fn min_width(&self) -> usize {
        match self.kind {
            SpecialSearchKind::Blank => 0,
            SpecialSearchKind::NamedRelCall { .. } | SpecialSearchKind::UnnamedRelCall(_) => 5,
            SpecialSearchKind::NamedAbsIndirectCall { .. }
            | SpecialSearchKind::UnnamedAbsIndirectCall(_) => 6,
            SpecialSearchKind::DataPointer(_) => 4,
        }
    }

    pub fn check_valid(&self, parent: &Search) -> Result<()> {
        if matches!(self.kind, SpecialSearchKind::Blank) {
            return Err(Error::validation("a special search cannot be blank"));
        }
        if self.at_rva >= parent.search_bytes.len()
            || self.at_rva + self.min_width() > parent.search_bytes.len()
        {
            return Err(Error::validation(format!(
                "special searches of this kind need at least {} byte(s) after their RVA",
                self.min_width()
            )));
        }
        match &self.kind {
            SpecialSearchKind::NamedRelCall {
                module_name,
                function_name,
            }
            | SpecialSearchKind::NamedAbsIndirectCall {
                module_name,
                function_name,
            } => {
                if module_name.is_empty() || function_name.is_empty() {
                    return Err(Error::validation(
                        "named call special searches need a module and function name",
                    ));
                }
            }
            SpecialSearchKind::UnnamedRelCall(inner)
            | SpecialSearchKind::UnnamedAbsIndirectCall(inner)
            | SpecialSearchKind::DataPointer(inner) => {
                inner.check_valid_inner(1)?;
            }
            SpecialSearchKind::Blank => unreachable!(),
        }
        Ok(())
    }

    /// Evaluate the predicate at a live byte cursor. Predicates read memory
    /// and resolve symbols but never mutate anything; unreachable targets
    /// simply fail the match.
    pub fn matches(&self, cursor: usize) -> bool {
        match &self.kind {
            SpecialSearchKind::Blank => false,

            SpecialSearchKind::NamedRelCall {
                module_name,
                function_name,
            } => {
                // SAFETY: validation reserved 5 readable bytes at the cursor.
                if unsafe { read_u8(cursor) } != 0xE8 {
                    return false;
                }
                let disp = unsafe { read_u32(cursor + 1) } as i32;
                match Module::open(module_name).and_then(|m| m.symbol(function_name)) {
                    Ok(symbol) => rel_call_target(cursor, disp) == symbol,
                    Err(_) => false,
                }
            }

            SpecialSearchKind::UnnamedRelCall(inner) => {
                // SAFETY: as above.
                if unsafe { read_u8(cursor) } != 0xE8 {
                    return false;
                }
                let disp = unsafe { read_u32(cursor + 1) } as i32;
                inner.matches_somewhere(rel_call_target(cursor, disp))
            }

            SpecialSearchKind::NamedAbsIndirectCall {
                module_name,
                function_name,
            } => {
                // SAFETY: validation reserved 6 readable bytes at the cursor.
                if unsafe { read_u8(cursor) } != 0xFF || unsafe { read_u8(cursor + 1) } != 0x15 {
                    return false;
                }
                let slot = unsafe { read_u32(cursor + 2) } as usize;
                let symbol = match Module::open(module_name).and_then(|m| m.symbol(function_name))
                {
                    Ok(symbol) => symbol,
                    Err(_) => return false,
                };
                // Verify `*slot == symbol` with a pointer search over the
                // slot itself.
                let pointer_search = Search {
                    module_name: String::new(),
                    search_bytes: (symbol as u32).to_le_bytes().to_vec(),
                    ignored_rvas: BTreeSet::new(),
                    specials: Vec::new(),
                };
                pointer_search.matches_somewhere(slot)
            }

            SpecialSearchKind::UnnamedAbsIndirectCall(inner) => {
                // SAFETY: as above.
                if unsafe { read_u8(cursor) } != 0xFF || unsafe { read_u8(cursor + 1) } != 0x15 {
                    return false;
                }
                let slot = unsafe { read_u32(cursor + 2) } as usize;
                if !span_is_readable(slot, 4) {
                    return false;
                }
                // SAFETY: just checked.
                let target = unsafe { read_u32(slot) } as usize;
                inner.matches_somewhere(target)
            }

            SpecialSearchKind::DataPointer(inner) => {
                // SAFETY: validation reserved 4 readable bytes at the cursor.
                let target = unsafe { read_u32(cursor) } as usize;
                inner.matches_somewhere(target)
            }
        }
    }
}

impl Search {
    /// Inner-search helper: does this pattern match at `start`?
    fn matches_somewhere(&self, start: usize) -> bool {
        if !span_is_readable(start, self.search_bytes.len().max(1)) {
            return false;
        }
        self.matches_somewhere_direct(start)
    }

    fn matches_somewhere_direct(&self, start: usize) -> bool {
        self.scan_span(start, self.search_bytes.len())
            .map(|results| !results.is_empty())
            .unwrap_or(false)
    }
}

impl Wire for Search {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_string(out, &self.module_name);
        wire::put_bytes(out, &self.search_bytes);
        wire::put_size_set(out, &self.ignored_rvas);
        wire::put_entities(out, &self.specials);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Search {
            module_name: r.string()?,
            search_bytes: r.bytes()?,
            ignored_rvas: r.size_set()?,
            specials: r.entities()?,
        })
    }
}

impl Wire for NameSearch {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_entity(out, &self.search);
        wire::put_string(out, &self.function_name);
        wire::put_size(out, self.function_rva);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(NameSearch {
            search: r.entity()?,
            function_name: r.string()?,
            function_rva: r.size()?,
        })
    }
}

impl Wire for SpecialSearch {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_size(out, self.at_rva);
        match &self.kind {
            SpecialSearchKind::Blank => wire::put_u32(out, WIRE_SPECIAL_BLANK),
            SpecialSearchKind::NamedRelCall {
                module_name,
                function_name,
            } => {
                wire::put_u32(out, WIRE_SPECIAL_NAMED_REL_CALL);
                let mut payload = Vec::new();
                wire::put_string(&mut payload, module_name);
                wire::put_string(&mut payload, function_name);
                wire::put_bytes(out, &payload);
            }
            SpecialSearchKind::UnnamedRelCall(inner) => {
                wire::put_u32(out, WIRE_SPECIAL_UNNAMED_REL_CALL);
                wire::put_entity(out, inner.as_ref());
            }
            SpecialSearchKind::NamedAbsIndirectCall {
                module_name,
                function_name,
            } => {
                wire::put_u32(out, WIRE_SPECIAL_NAMED_ABS_INDIRECT);
                let mut payload = Vec::new();
                wire::put_string(&mut payload, module_name);
                wire::put_string(&mut payload, function_name);
                wire::put_bytes(out, &payload);
            }
            SpecialSearchKind::UnnamedAbsIndirectCall(inner) => {
                wire::put_u32(out, WIRE_SPECIAL_UNNAMED_ABS_INDIRECT);
                wire::put_entity(out, inner.as_ref());
            }
            SpecialSearchKind::DataPointer(inner) => {
                wire::put_u32(out, WIRE_SPECIAL_DATA_POINTER);
                wire::put_entity(out, inner.as_ref());
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let at_rva = r.size()?;
        let tag = r.u32()?;
        let kind = match tag {
            WIRE_SPECIAL_BLANK => SpecialSearchKind::Blank,
            WIRE_SPECIAL_NAMED_REL_CALL | WIRE_SPECIAL_NAMED_ABS_INDIRECT => {
                let block = r.block()?;
                let mut payload = WireReader::new(block);
                let module_name = payload.string()?;
                let function_name = payload.string()?;
                if tag == WIRE_SPECIAL_NAMED_REL_CALL {
                    SpecialSearchKind::NamedRelCall {
                        module_name,
                        function_name,
                    }
                } else {
                    SpecialSearchKind::NamedAbsIndirectCall {
                        module_name,
                        function_name,
                    }
                }
            }
            WIRE_SPECIAL_UNNAMED_REL_CALL => {
                SpecialSearchKind::UnnamedRelCall(Box::new(r.entity()?))
            }
            WIRE_SPECIAL_UNNAMED_ABS_INDIRECT => {
                SpecialSearchKind::UnnamedAbsIndirectCall(Box::new(r.entity()?))
            }
            WIRE_SPECIAL_DATA_POINTER => SpecialSearchKind::DataPointer(Box::new(r.entity()?)),
            other => {
                return Err(Error::protocol(format!(
                    "unknown special search discriminant {}",
                    other
                )))
            }
        };
        Ok(SpecialSearch { at_rva, kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_over(bytes: &[u8]) -> Search {
        Search {
            module_name: "test".to_string(),
            search_bytes: bytes.to_vec(),
            ignored_rvas: BTreeSet::new(),
            specials: Vec::new(),
        }
    }

    fn scan(search: &Search, haystack: &[u8]) -> Vec<usize> {
        let base = haystack.as_ptr() as usize;
        search
            .scan_span(base, haystack.len())
            .unwrap()
            .into_iter()
            .map(|addr| addr - base)
            .collect()
    }

    #[test]
    fn test_literal_match() {
        let haystack = [0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x00];
        let search = search_over(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(scan(&search, &haystack), vec![1]);
    }

    #[test]
    fn test_wildcard_matches_twice() {
        let haystack = [0x48, 0xAA, 0x89, 0x48, 0xBB, 0x89];
        let mut search = search_over(&[0x48, 0x00, 0x89]);
        search.ignored_rvas.insert(1);
        assert_eq!(scan(&search, &haystack), vec![0, 3]);
    }

    #[test]
    fn test_matches_do_not_overlap() {
        let haystack = [0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        let search = search_over(&[0xAA, 0xAA]);
        // Scanning resumes past each match: offsets 0 and 2 only.
        assert_eq!(scan(&search, &haystack), vec![0, 2]);
    }

    #[test]
    fn test_window_never_leaves_span() {
        let haystack = [0x01, 0x02];
        let search = search_over(&[0x02, 0x03]);
        assert!(scan(&search, &haystack).is_empty());
    }

    #[test]
    fn test_check_valid_rejections() {
        let mut search = search_over(&[0x90; 8]);
        search.module_name.clear();
        assert!(search.check_valid(1).is_err());

        let search = search_over(&[0x90; 2]);
        assert!(search.check_valid(4).is_err());

        let mut search = search_over(&[0x90; 4]);
        search.ignored_rvas.insert(4);
        assert!(search.check_valid(1).is_err());

        let mut search = search_over(&[0x90; 8]);
        search.specials.push(SpecialSearch {
            at_rva: 0,
            kind: SpecialSearchKind::Blank,
        });
        assert!(search.check_valid(1).is_err());
    }

    #[test]
    fn test_check_valid_duplicate_special_rvas() {
        let inner = Box::new(search_over(&[0x90]));
        let mut search = search_over(&[0x90; 16]);
        for _ in 0..2 {
            search.specials.push(SpecialSearch {
                at_rva: 2,
                kind: SpecialSearchKind::DataPointer(inner.clone()),
            });
        }
        assert!(search.check_valid(1).is_err());
    }

    #[test]
    fn test_check_valid_special_widths() {
        let inner = Box::new(search_over(&[0x90]));
        // A DataPointer needs 4 bytes from its RVA: rva 4 of an 8-byte
        // window fits, rva 5 does not.
        for (rva, ok) in [(4usize, true), (5, false)] {
            let mut search = search_over(&[0x90; 8]);
            search.specials.push(SpecialSearch {
                at_rva: rva,
                kind: SpecialSearchKind::DataPointer(inner.clone()),
            });
            assert_eq!(search.check_valid(1).is_ok(), ok, "rva {}", rva);
        }
    }

    #[test]
    fn test_rel_call_target_arithmetic() {
        // Displacement 11 five bytes after the opcode.
        assert_eq!(rel_call_target(0x00FF_FFF0, 11), 0x1000_0000);
        // Negative displacements reach backwards.
        assert_eq!(rel_call_target(0x1000, -0x100), 0x1000 + 5 - 0x100);
    }

    #[test]
    fn test_unnamed_rel_call_special() {
        // One buffer holding both the call site and its target so the
        // 32-bit displacement can reach. Layout:
        //   [0]  E8 <disp32>   call site
        //   [16] 13 37 CA FE   inner pattern
        let mut haystack = vec![0x90u8; 24];
        haystack[16..20].copy_from_slice(&[0x13, 0x37, 0xCA, 0xFE]);
        let base = haystack.as_ptr() as usize;
        haystack[0] = 0xE8;
        let disp = (base + 16) as i64 - (base + 5) as i64;
        haystack[1..5].copy_from_slice(&(disp as i32).to_le_bytes());

        let inner = Box::new(search_over(&[0x13, 0x37, 0xCA, 0xFE]));
        let mut search = search_over(&[0xE8, 0x00, 0x00, 0x00, 0x00]);
        search.ignored_rvas.extend([1usize, 2, 3, 4]);
        search.specials.push(SpecialSearch {
            at_rva: 0,
            kind: SpecialSearchKind::UnnamedRelCall(inner.clone()),
        });

        assert_eq!(scan(&search, &haystack), vec![0]);

        // Same bytes, but the target no longer holds the inner pattern.
        haystack[16] = 0x00;
        assert!(scan(&search, &haystack).is_empty());
    }

    #[test]
    fn test_rel_call_special_requires_opcode() {
        let haystack = [0x00u8; 8];
        let inner = Box::new(search_over(&[0x90]));
        let mut search = search_over(&[0x00; 5]);
        search.ignored_rvas.extend([0usize, 1, 2, 3, 4]);
        search.specials.push(SpecialSearch {
            at_rva: 0,
            kind: SpecialSearchKind::UnnamedRelCall(inner),
        });
        // No E8 opcode anywhere, so the special rejects every candidate.
        assert!(scan(&search, &haystack).is_empty());
    }

    #[test]
    fn test_named_rel_call_against_missing_module() {
        let haystack = [0xE8, 0x00, 0x00, 0x00, 0x00, 0x90];
        let mut search = search_over(&[0xE8, 0x00, 0x00, 0x00, 0x00]);
        search.ignored_rvas.extend([1usize, 2, 3, 4]);
        search.specials.push(SpecialSearch {
            at_rva: 0,
            kind: SpecialSearchKind::NamedRelCall {
                module_name: "libnot-here.so.1".to_string(),
                function_name: "nothing".to_string(),
            },
        });
        assert!(scan(&search, &haystack).is_empty());
    }

    /// Map a page in the low 4 GiB so its address round-trips through the
    /// 4-byte pointers the engine reads.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn map_low_page() -> usize {
        #[cfg(target_arch = "x86_64")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_32BIT;
        #[cfg(target_arch = "x86")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        // SAFETY: fresh anonymous mapping, asserted below.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                memory::page_size(),
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        let addr = addr as usize;
        assert!(addr <= u32::MAX as usize - memory::page_size());
        addr
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[test]
    fn test_data_pointer_special() {
        let page = map_low_page();
        // Target data at the start of the page, the candidate window after.
        // SAFETY: the page was just mapped read/write.
        unsafe {
            std::ptr::copy_nonoverlapping([0xFE, 0xED, 0xF0, 0x0D].as_ptr(), page as *mut u8, 4);
            let window = (page + 64) as *mut u8;
            std::ptr::copy_nonoverlapping((page as u32).to_le_bytes().as_ptr(), window, 4);
        }

        let inner = Box::new(search_over(&[0xFE, 0xED, 0xF0, 0x0D]));
        let mut search = search_over(&[0x00; 4]);
        search.ignored_rvas.extend([0usize, 1, 2, 3]);
        search.specials.push(SpecialSearch {
            at_rva: 0,
            kind: SpecialSearchKind::DataPointer(inner),
        });

        let results = search.scan_span(page + 64, 4).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[test]
    fn test_unnamed_abs_indirect_call_special() {
        let page = map_low_page();
        // Layout inside the low page:
        //   [0]   A1 B2 C3 D4      inner pattern (call target)
        //   [64]  <u32: page>      indirection slot
        //   [128] FF 15 <u32: page + 64>  candidate window
        // SAFETY: the page was just mapped read/write.
        unsafe {
            std::ptr::copy_nonoverlapping([0xA1, 0xB2, 0xC3, 0xD4].as_ptr(), page as *mut u8, 4);
            std::ptr::copy_nonoverlapping(
                (page as u32).to_le_bytes().as_ptr(),
                (page + 64) as *mut u8,
                4,
            );
            let window = (page + 128) as *mut u8;
            window.write(0xFF);
            window.add(1).write(0x15);
            std::ptr::copy_nonoverlapping(
                ((page + 64) as u32).to_le_bytes().as_ptr(),
                window.add(2),
                4,
            );
        }

        let inner = Box::new(search_over(&[0xA1, 0xB2, 0xC3, 0xD4]));
        let mut search = search_over(&[0xFF, 0x15, 0x00, 0x00, 0x00, 0x00]);
        search.ignored_rvas.extend([2usize, 3, 4, 5]);
        search.specials.push(SpecialSearch {
            at_rva: 0,
            kind: SpecialSearchKind::UnnamedAbsIndirectCall(inner),
        });

        let results = search.scan_span(page + 128, 6).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_name_search_overlap_is_symmetric() {
        let make = |rva: usize, len: usize| NameSearch {
            search: search_over(&vec![0x90; len]),
            function_name: "frobnicate".to_string(),
            function_rva: rva,
        };

        let a = make(0, 8);
        let b = make(4, 8);
        let c = make(8, 8);
        let mut other_function = make(0, 8);
        other_function.function_name = "unrelated".to_string();

        assert!(a.check_overlap_with(&b).is_err());
        assert!(b.check_overlap_with(&a).is_err());
        // Half-open windows: [0, 8) and [8, 16) merely touch.
        assert!(a.check_overlap_with(&c).is_ok());
        assert!(c.check_overlap_with(&a).is_ok());
        assert!(a.check_overlap_with(&other_function).is_ok());
    }

    #[test]
    fn test_search_wire_round_trip() {
        let mut search = search_over(&[0xE8, 0x00, 0x00, 0x00, 0x00, 0x13, 0x37]);
        search.ignored_rvas.extend([1usize, 2, 3, 4]);
        search.specials.push(SpecialSearch {
            at_rva: 0,
            kind: SpecialSearchKind::NamedRelCall {
                module_name: "libm.so.6".to_string(),
                function_name: "cos".to_string(),
            },
        });
        search.specials.push(SpecialSearch {
            at_rva: 5,
            kind: SpecialSearchKind::UnnamedRelCall(Box::new(search_over(&[0x01, 0x02]))),
        });

        let decoded = Search::from_bytes(&search.to_bytes()).unwrap();
        assert_eq!(decoded, search);
    }

    #[test]
    fn test_name_search_wire_round_trip() {
        let name_search = NameSearch {
            search: search_over(&[0x55, 0x89, 0xE5]),
            function_name: "process_input".to_string(),
            function_rva: 0x2A,
        };
        let decoded = NameSearch::from_bytes(&name_search.to_bytes()).unwrap();
        assert_eq!(decoded, name_search);
    }

    #[test]
    fn test_special_search_rejects_unknown_discriminant() {
        let mut data = Vec::new();
        wire::put_size(&mut data, 0);
        wire::put_u32(&mut data, 99);
        assert!(SpecialSearch::from_bytes(&data).is_err());
    }
}
