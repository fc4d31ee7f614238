//! # divination
//!
//! the practice of seeking knowledge of the future or the unknown by
//! supernatural means.
//!
//! we ask supernatural means (the dynamic linker) for knowledge of the future
//! (where we will find the dwarves)
//!
//! we ask the dynamic linker to give us the `.eh_frame_hdr` for the object
//! containing an address using the GNU extension
//! (`_dl_find_object`)[https://www.gnu.org/software/libc/manual/html_node/Dynamic-Linker-Introspection.html].
//! it only exists since glibc 2.35, so we look it up with `dlsym` instead of
//! linking against it, and fall back to walking the program headers if it's
//! not there.

#![allow(non_camel_case_types)]

use core::{
    ffi, mem, ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use super::{eh_frame_hdr, Lookup};
use crate::{memory::AddressSpace, stdext::with_dlerror_str, UnwindInfoSections};

#[repr(C)]
#[allow(dead_code)]
struct dl_find_object {
    dlfo_flags: ffi::c_ulonglong,
    dlfo_map_start: *mut ffi::c_void,
    dlfo_map_end: *mut ffi::c_void,
    dlf_link_map: *mut ffi::c_void,
    /// A pointer to the `PT_GNU_EH_FRAME` segment (the `.eh_frame_hdr`
    /// section).
    dlfo_eh_frame: *mut ffi::c_void,
    #[cfg(target_arch = "x86")]
    dlfo_eh_dbase: *mut ffi::c_void,
    #[cfg(target_arch = "x86")]
    __dlfo_eh_dbase_pad: ffi::c_uint,
    #[cfg(target_arch = "arm")]
    dlfo_eh_count: ffi::c_int,
    #[cfg(target_arch = "arm")]
    __dlfo_eh_count_pad: ffi::c_uint,
    // glibc may grow the struct into this, so it has to be there
    __dlfo_reserved: [ffi::c_ulonglong; 7],
}

type DlFindObjectFn =
    unsafe extern "C" fn(address: *mut ffi::c_void, result: *mut dl_find_object) -> ffi::c_int;

/// A symbol resolved with `dlsym` on first use and cached after that.
///
/// Must never block, lookups run in signal handlers and under the loader lock.
/// Racing threads all store the same dlsym result.
pub(super) struct LazySymbol {
    name: &'static ffi::CStr,
    sym: AtomicPtr<ffi::c_void>,
    resolved: AtomicBool,
}

impl LazySymbol {
    pub(super) const fn new(name: &'static ffi::CStr) -> Self {
        Self {
            name,
            sym: AtomicPtr::new(ptr::null_mut()),
            resolved: AtomicBool::new(false),
        }
    }

    /// The symbol's address, or null if the process doesn't have it.
    pub(super) fn get(&self) -> *mut ffi::c_void {
        if !self.resolved.load(Ordering::Acquire) {
            // SAFETY: the name is nul-terminated and RTLD_DEFAULT is always a valid handle.
            let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, self.name.as_ptr()) };
            if sym.is_null() {
                with_dlerror_str(|err| trace!("{:?} is not available: {err}", self.name));
            }
            self.sym.store(sym, Ordering::Relaxed);
            self.resolved.store(true, Ordering::Release);
        }
        self.sym.load(Ordering::Relaxed)
    }
}

static DL_FIND_OBJECT: LazySymbol = LazySymbol::new(c"_dl_find_object");

fn dl_find_object_fn() -> Option<DlFindObjectFn> {
    let sym = DL_FIND_OBJECT.get();
    if sym.is_null() {
        return None;
    }
    // SAFETY: glibc exports `_dl_find_object` with exactly this signature.
    Some(unsafe { mem::transmute::<*mut ffi::c_void, DlFindObjectFn>(sym) })
}

/// What the loader knows about the object at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FoundObject {
    pub(crate) map_start: usize,
    pub(crate) map_end: usize,
    /// `0` if the object has no `PT_GNU_EH_FRAME`.
    pub(crate) eh_frame_hdr: usize,
}

/// A loader that can map an address to its object directly.
pub(crate) trait ObjectLookup {
    /// `None` if the loader doesn't know any object containing `addr`.
    fn find_object(&self, addr: usize) -> Option<FoundObject>;
}

/// glibc's `_dl_find_object`.
pub(crate) struct DlFindObject(DlFindObjectFn);

impl ObjectLookup for DlFindObject {
    fn find_object(&self, addr: usize) -> Option<FoundObject> {
        // SAFETY: all zeroes is a valid dl_find_object
        let mut out: dl_find_object = unsafe { mem::zeroed() };
        // SAFETY: `out` is big enough for whatever glibc writes, see the reserved field.
        let ret = unsafe { (self.0)(ptr::with_exposed_provenance_mut(addr), &mut out) };
        trace!("_dl_find_object returned {ret}");
        if ret != 0 {
            return None;
        }
        Some(FoundObject {
            map_start: out.dlfo_map_start.addr(),
            map_end: out.dlfo_map_end.addr(),
            eh_frame_hdr: out.dlfo_eh_frame.expose_provenance(),
        })
    }
}

/// The loader's lookup service, if this process has one.
pub(crate) fn lookup_service() -> Option<DlFindObject> {
    if !cfg!(feature = "dl-find-object") {
        return None;
    }
    dl_find_object_fn().map(DlFindObject)
}

#[instrument(skip(service, memory))]
pub(crate) fn find<L: ObjectLookup, M: AddressSpace>(
    service: Option<&L>,
    memory: &M,
    addr: usize,
) -> Lookup<UnwindInfoSections> {
    let Some(service) = service else {
        trace!("no object lookup service");
        return Lookup::Unavailable;
    };
    let Some(object) = service.find_object(addr) else {
        trace!("object lookup doesn't know the address");
        return Lookup::Unavailable;
    };

    if !(object.map_start..object.map_end).contains(&addr) {
        trace!(
            "object lookup returned object out of range: ({:#x}, {:#x})",
            object.map_start,
            object.map_end
        );
        return Lookup::Unavailable;
    }
    if object.eh_frame_hdr == 0 {
        trace!("dlfo_eh_frame is null");
        return Lookup::NotFound;
    }

    let text_len = object.map_end - object.map_start;
    trace!(
        "dwarf info; map: ({:#x}, {:#x}), eh_frame_hdr: {:#x}",
        object.map_start,
        text_len,
        object.eh_frame_hdr
    );

    // the loader doesn't know how long the section is, so the header has to
    // tell us everything
    match eh_frame_hdr::decode(memory, object.eh_frame_hdr, None) {
        Ok(hdr) => Lookup::Found(UnwindInfoSections {
            dso_base: object.map_start,
            text_segment_length: text_len,
            dwarf_index_section: object.eh_frame_hdr,
            dwarf_index_section_length: None,
            dwarf_section: hdr.eh_frame_ptr,
            dwarf_section_length: None,
        }),
        Err(err) => {
            debug!("invalid eh_frame_hdr at {:#x}: {err}", object.eh_frame_hdr);
            Lookup::NotFound
        }
    }
}
