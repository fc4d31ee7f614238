//! Finding the module for an address the slow way: walking every loaded
//! module's program headers with `dl_iterate_phdr` until one of its `PT_LOAD`
//! segments contains the address.
//!
//! This works everywhere, including objects `_dl_find_object` doesn't know
//! about, and the program headers give us exact section lengths.

use core::{ffi, ops::ControlFlow, ops::Range, slice};

use super::eh_frame_hdr;
use crate::{memory::AddressSpace, UnwindInfoSections};

#[cfg(target_pointer_width = "64")]
pub(crate) type Phdr = libc::Elf64_Phdr;
#[cfg(target_pointer_width = "32")]
pub(crate) type Phdr = libc::Elf32_Phdr;

/// One loaded module, only valid during the enumeration that produced it.
#[derive(Debug)]
pub(crate) struct ModuleSegmentView<'a> {
    /// The load bias, added to every `p_vaddr`.
    pub(crate) base: usize,
    pub(crate) phdrs: &'a [Phdr],
}

impl ModuleSegmentView<'_> {
    fn segment(&self, phdr: &Phdr) -> Range<usize> {
        let start = self.base.wrapping_add(phdr.p_vaddr as usize);
        start..start.saturating_add(phdr.p_memsz as usize)
    }

    fn segments_of_type(&self, p_type: u32) -> impl Iterator<Item = Range<usize>> + '_ {
        self.phdrs
            .iter()
            .filter(move |phdr| phdr.p_type == p_type)
            .map(|phdr| self.segment(phdr))
    }

    fn loads(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.segments_of_type(libc::PT_LOAD)
    }

    fn contains(&self, addr: usize) -> bool {
        self.loads().any(|segment| segment.contains(&addr))
    }

    /// From the lowest `PT_LOAD` start to the highest `PT_LOAD` end.
    fn bounds(&self) -> Option<Range<usize>> {
        let start = self.loads().map(|segment| segment.start).min()?;
        let end = self.loads().map(|segment| segment.end).max()?;
        Some(start..end)
    }

    fn eh_frame_hdr(&self) -> Option<Range<usize>> {
        self.segments_of_type(libc::PT_GNU_EH_FRAME).next()
    }
}

pub(crate) type Visitor<'v> = dyn FnMut(&ModuleSegmentView<'_>) -> ControlFlow<()> + 'v;

/// Something that can enumerate the loaded modules.
pub(crate) trait PhdrSource {
    /// Calls `visit` for every loaded module in load order until it breaks.
    fn each_module(&self, visit: &mut Visitor<'_>);
}

/// The loader's own module list.
pub(crate) struct DlIteratePhdr;

impl PhdrSource for DlIteratePhdr {
    fn each_module(&self, mut visit: &mut Visitor<'_>) {
        unsafe extern "C" fn callback(
            info: *mut libc::dl_phdr_info,
            _size: libc::size_t,
            data: *mut ffi::c_void,
        ) -> ffi::c_int {
            // SAFETY: `data` is the visitor passed to dl_iterate_phdr below,
            // `info` is valid until we return.
            let (visit, info) = unsafe { (&mut *data.cast::<&mut Visitor<'_>>(), &*info) };
            let phdrs = if info.dlpi_phdr.is_null() {
                &[][..]
            } else {
                // SAFETY: the loader says there are `dlpi_phnum` headers
                unsafe { slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum.into()) }
            };
            let module = ModuleSegmentView {
                base: info.dlpi_addr as usize,
                phdrs,
            };
            match (*visit)(&module) {
                ControlFlow::Continue(()) => 0,
                ControlFlow::Break(()) => 1,
            }
        }

        // SAFETY: the callback only uses `data` as what it is
        unsafe { libc::dl_iterate_phdr(Some(callback), (&raw mut visit).cast()) };
    }
}

#[instrument(skip(source, memory))]
pub(crate) fn find<P: PhdrSource, M: AddressSpace>(
    source: &P,
    memory: &M,
    addr: usize,
) -> Option<UnwindInfoSections> {
    let mut visited = 0_usize;
    let mut found = None;
    // everything we need from the module has to be pulled out in here, the
    // headers are gone once the enumeration is over
    source.each_module(&mut |module: &ModuleSegmentView<'_>| {
        visited += 1;
        if !module.contains(addr) {
            return ControlFlow::Continue(());
        }
        found = Some(sections_for(module, memory));
        ControlFlow::Break(())
    });

    match found {
        Some(sections) => sections,
        None => {
            trace!("none of the {visited} loaded modules contains the address");
            None
        }
    }
}

fn sections_for<M: AddressSpace>(
    module: &ModuleSegmentView<'_>,
    memory: &M,
) -> Option<UnwindInfoSections> {
    let bounds = module.bounds()?;
    trace!("found module: ({:#x}, {:#x})", bounds.start, bounds.len());

    let Some(hdr_segment) = module.eh_frame_hdr() else {
        trace!("module has no PT_GNU_EH_FRAME");
        return None;
    };
    let hdr_len = hdr_segment.len();

    let hdr = match eh_frame_hdr::decode(memory, hdr_segment.start, Some(hdr_len)) {
        Ok(hdr) => hdr,
        Err(err) => {
            debug!("invalid eh_frame_hdr at {:#x}: {err}", hdr_segment.start);
            return None;
        }
    };

    // .eh_frame_hdr doesn't say how long .eh_frame is, but it can't go past
    // the segment it's in
    let Some(frame_segment) = module
        .loads()
        .find(|segment| segment.contains(&hdr.eh_frame_ptr))
    else {
        debug!("eh_frame at {:#x} is outside of the module", hdr.eh_frame_ptr);
        return None;
    };

    Some(UnwindInfoSections {
        dso_base: bounds.start,
        text_segment_length: bounds.len(),
        dwarf_index_section: hdr_segment.start,
        dwarf_index_section_length: Some(hdr_len),
        dwarf_section: hdr.eh_frame_ptr,
        dwarf_section_length: Some(frame_segment.end - hdr.eh_frame_ptr),
    })
}
