#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate tracing;

use core::ffi;

mod stdext;

pub mod dwarf;
mod memory;

/// Where the unwind tables for a module live.
///
/// Field names follow libunwind's `UnwindInfoSections`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnwindInfoSections {
    /// Start of the module's mapping.
    pub dso_base: usize,
    /// Size of the module's mapping in bytes.
    pub text_segment_length: usize,
    /// `PT_GNU_EH_FRAME`, the `.eh_frame_hdr` section.
    pub dwarf_index_section: usize,
    /// `None` if the loader didn't tell us. Don't treat it as zero, walk the
    /// header instead.
    pub dwarf_index_section_length: Option<usize>,
    /// The `.eh_frame` section.
    pub dwarf_section: usize,
    /// `None` if unknown, in which case `.eh_frame` has to be walked until its
    /// zero terminator.
    pub dwarf_section_length: Option<usize>,
}

/// Finds the unwind tables of the module containing `pc`.
///
/// Asks `_dl_find_object` first and walks the loaded program headers if the
/// dynamic linker can't answer. `None` means there is nothing to unwind with,
/// either because `pc` isn't in any module or because its module has no
/// (valid) `.eh_frame_hdr`. Unwinders should treat that as the end of the stack.
pub fn find_unwind_sections(pc: *const ffi::c_void) -> Option<UnwindInfoSections> {
    dwarf::find_unwind_sections(
        dwarf::divination::lookup_service().as_ref(),
        &dwarf::phdr::DlIteratePhdr,
        &memory::LocalMemory,
        pc.addr(),
    )
}
