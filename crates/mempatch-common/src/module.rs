//! Module service: resolve loaded objects by name, enumerate their original
//! (loader's view) and current segments, resolve exported symbols.
//!
//! Built on `dlopen`/`dlsym`/`dlinfo`. Original segments come from the ELF
//! program headers at first observation and stay fixed for the module's
//! lifetime; current segments are re-read from the memory service and track
//! live protections.

use std::ffi::{c_char, c_void, CStr, CString};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::memory::{self, Region};

/// Public prefix of the glibc `link_map`; only these members are ABI-stable.
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: *mut c_void,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

pub struct Module {
    handle: *mut c_void,
    /// True when acquired via [`Module::load`]; only loaded modules may be
    /// unloaded without force.
    loaded: bool,
    file: String,
    path: PathBuf,
    base: usize,
    regions: Vec<Region>,
    original_regions: Vec<Region>,
}

// A dlopen handle is a process-global cookie, not thread-affine state.
unsafe impl Send for Module {}
unsafe impl Sync for Module {}

fn dlerror_string() -> String {
    // SAFETY: dlerror returns a thread-local string or null.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dl error".to_string()
    } else {
        // SAFETY: non-null dlerror results are valid C strings.
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

fn main_executable_path() -> Result<PathBuf> {
    Ok(std::fs::read_link("/proc/self/exe")?)
}

impl Module {
    /// Force-load a library and open it.
    pub fn load(pathfile: &str) -> Result<Self> {
        let name = CString::new(pathfile).map_err(|_| Error::module("embedded NUL in path"))?;
        // SAFETY: plain dlopen with a valid C string.
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(Error::module(dlerror_string()));
        }
        Self::from_handle(handle, true)
    }

    /// Open a handle to an already-loaded module. The empty string resolves
    /// to the main executable.
    pub fn open(pathfile: &str) -> Result<Self> {
        if pathfile.is_empty() {
            return Self::open_main();
        }
        let name = CString::new(pathfile).map_err(|_| Error::module("embedded NUL in path"))?;
        // SAFETY: RTLD_NOLOAD never loads, it only looks the module up.
        let handle =
            unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
        if !handle.is_null() {
            return Self::from_handle(handle, false);
        }

        // dlopen cannot find the main executable by name; check whether that
        // is what was asked for.
        let main = main_executable_path()?;
        if pathfile_match(Path::new(pathfile), &main) {
            return Self::open_main();
        }
        Err(Error::module(format!("`{}' is not loaded", pathfile)))
    }

    /// Open the module whose image contains `address`.
    pub fn open_containing(address: usize) -> Result<Self> {
        let main = main_executable_path()?;
        let region = memory::enumerate_regions()?
            .into_iter()
            .find(|region| region.contains(address) && region.mapped_file.is_some())
            .ok_or_else(|| {
                Error::module(format!("no module maps address {:#x}", address))
            })?;
        let file = region.mapped_file.unwrap();
        if pathfile_match(&file, &main) {
            return Self::open_main();
        }
        Self::open(&file.to_string_lossy())
    }

    /// Open the main executable.
    pub fn open_main() -> Result<Self> {
        // SAFETY: dlopen(NULL) yields the main program's handle without
        // loading anything.
        let handle = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(Error::module(dlerror_string()));
        }
        Self::from_handle(handle, false)
    }

    fn from_handle(handle: *mut c_void, loaded: bool) -> Result<Self> {
        let mut module = Module {
            handle,
            loaded,
            file: String::new(),
            path: PathBuf::new(),
            base: 0,
            regions: Vec::new(),
            original_regions: Vec::new(),
        };
        module.refresh()?;
        Ok(module)
    }

    /// Unload the underlying library. Opened (not loaded) modules refuse to
    /// unload unless forced.
    pub fn unload(&mut self, force: bool) -> Result<()> {
        if self.handle.is_null() {
            return Err(Error::module("no module loaded or opened"));
        }
        if !self.loaded && !force {
            return Err(Error::module(
                "refusing to unload a module that was only opened",
            ));
        }
        // SAFETY: the handle came from dlopen and is closed exactly once.
        if unsafe { libc::dlclose(self.handle) } != 0 {
            return Err(Error::module(dlerror_string()));
        }
        self.handle = std::ptr::null_mut();
        self.loaded = false;
        Ok(())
    }

    /// Forget the handle without dropping the OS reference.
    pub fn detach(&mut self) {
        self.handle = std::ptr::null_mut();
        self.loaded = false;
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_null()
    }

    /// Resolve an exported symbol to its address.
    pub fn symbol(&self, name: &str) -> Result<usize> {
        let symbol =
            CString::new(name).map_err(|_| Error::module("embedded NUL in symbol name"))?;
        // SAFETY: dlsym on a live handle with a valid C string.
        let address = unsafe { libc::dlsym(self.handle, symbol.as_ptr()) };
        if address.is_null() {
            return Err(Error::SymbolNotFound {
                symbol: name.to_string(),
                message: dlerror_string(),
            });
        }
        Ok(address as usize)
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Segments as the loader mapped them, before any patch ran.
    pub fn original_regions(&self) -> &[Region] {
        &self.original_regions
    }

    /// Live segments with current protections.
    pub fn current_regions(&self) -> &[Region] {
        &self.regions
    }

    /// Full path (directory + file) identifying this module.
    pub fn pathfile(&self) -> PathBuf {
        self.path.join(&self.file)
    }

    fn refresh(&mut self) -> Result<()> {
        // Identify the object behind the handle.
        let mut map: *mut LinkMap = std::ptr::null_mut();
        // SAFETY: RTLD_DI_LINKMAP writes a link_map pointer into `map`.
        let rc = unsafe {
            libc::dlinfo(
                self.handle,
                libc::RTLD_DI_LINKMAP,
                &mut map as *mut _ as *mut c_void,
            )
        };
        if rc != 0 || map.is_null() {
            return Err(Error::module(dlerror_string()));
        }
        // SAFETY: the link map stays valid while the handle is open.
        let (bias, name) = unsafe {
            let name = if (*map).l_name.is_null() {
                String::new()
            } else {
                CStr::from_ptr((*map).l_name).to_string_lossy().into_owned()
            };
            ((*map).l_addr, name)
        };

        // An empty link-map name means the main executable.
        let pathfile = if name.is_empty() {
            main_executable_path()?
        } else {
            PathBuf::from(name)
        };
        self.file = pathfile
            .file_name()
            .ok_or_else(|| Error::module("module path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let directory = pathfile.parent().unwrap_or_else(|| Path::new("."));
        self.path = directory.canonicalize().unwrap_or_else(|_| directory.to_path_buf());

        self.original_regions = original_segments(bias)?;
        self.base = self
            .original_regions
            .first()
            .map(|r| r.start)
            .unwrap_or(bias);

        // Current segments: every mapped region backed by this module's file.
        let own = self.pathfile();
        self.regions = memory::enumerate_regions()?
            .into_iter()
            .filter(|region| {
                region
                    .mapped_file
                    .as_ref()
                    .map(|file| pathfile_match(file, &own))
                    .unwrap_or(false)
            })
            .collect();
        Ok(())
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if self.loaded && !self.handle.is_null() {
            // SAFETY: closing the handle we loaded; errors are unreportable
            // here and deliberately ignored.
            unsafe { libc::dlclose(self.handle) };
        }
    }
}

struct PhdrScan {
    bias: usize,
    segments: Vec<Region>,
    found: bool,
}

unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    let scan = &mut *(data as *mut PhdrScan);
    let info = &*info;
    if info.dlpi_addr as usize != scan.bias {
        return 0;
    }
    scan.found = true;
    for index in 0..info.dlpi_phnum as usize {
        let phdr = &*info.dlpi_phdr.add(index);
        if phdr.p_type != libc::PT_LOAD {
            continue;
        }
        let start = phdr.p_vaddr as usize + scan.bias;
        let (start, end) = memory::page_align(start, start + phdr.p_memsz as usize);
        scan.segments.push(Region {
            start,
            size: end - start,
            readable: phdr.p_flags & libc::PF_R != 0,
            writable: phdr.p_flags & libc::PF_W != 0,
            executable: phdr.p_flags & libc::PF_X != 0,
            mapped_file: None,
        });
    }
    1
}

/// Collect the PT_LOAD segments of the object loaded at `bias`.
fn original_segments(bias: usize) -> Result<Vec<Region>> {
    let mut scan = PhdrScan {
        bias,
        segments: Vec::new(),
        found: false,
    };
    // SAFETY: the callback only touches the PhdrScan we pass in.
    unsafe { libc::dl_iterate_phdr(Some(phdr_callback), &mut scan as *mut _ as *mut c_void) };
    if !scan.found {
        return Err(Error::module(format!(
            "no program headers found for load bias {:#x}",
            bias
        )));
    }
    Ok(scan.segments)
}

/// Whether two path-or-file strings name the same module: matching base
/// names when either side carries no directory, otherwise the same
/// `(device, inode)` identity on disk.
pub fn pathfile_match(a: &Path, b: &Path) -> bool {
    let bare = |p: &Path| p.parent().map(|d| d.as_os_str().is_empty()).unwrap_or(true);
    if bare(a) || bare(b) {
        return match (a.file_name(), b.file_name()) {
            (Some(fa), Some(fb)) => fa == fb,
            _ => false,
        };
    }
    let (meta_a, meta_b) = match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => (ma, mb),
        _ => return false,
    };
    meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino()
}
