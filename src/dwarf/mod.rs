//! this implements the stuff necessary to find the uwutables for actual unwinding
//!
//! # how it works
//! an unwinder hands us a return address and wants the `.eh_frame` of whatever
//! binary that address is in, plus the `.eh_frame_hdr` to binary search it with.
//!
//! first, we ask the dynamic linker directly using the GNU extension
//! (`_dl_find_object`)[https://www.gnu.org/software/libc/manual/html_node/Dynamic-Linker-Introspection.html],
//! see [`divination`]. if that doesn't exist or doesn't know the address, we go
//! through all loaded objects ourselves with `dl_iterate_phdr` and look at
//! their program headers, see [`phdr`].
//!
//! either way we end up with a pointer to the `.eh_frame_hdr`, which we check
//! and read the start of `.eh_frame` from, see [`eh_frame_hdr`]. actually
//! parsing the DWARF call frame information in there is someone else's problem.

pub(crate) mod divination;
pub(crate) mod eh_frame_hdr;
mod parse;
pub(crate) mod phdr;

#[cfg(test)]
mod tests;

use core::ffi;

use crate::{memory::LocalMemory, UnwindInfoSections};

pub use eh_frame_hdr::EhFrameHdr;
pub use parse::{Encoding, Error};

/// The result of asking one way of finding unwind info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<T> {
    /// This way can't answer, try the next one.
    Unavailable,
    /// There is definitely nothing, don't bother asking anyone else.
    NotFound,
    Found(T),
}

impl<T> Lookup<T> {
    /// Asks `fallback` if and only if this lookup couldn't answer.
    pub fn or_else(self, fallback: impl FnOnce() -> Option<T>) -> Option<T> {
        match self {
            Self::Unavailable => fallback(),
            Self::NotFound => None,
            Self::Found(found) => Some(found),
        }
    }
}

pub(crate) fn find_unwind_sections<L, P, M>(
    fast: Option<&L>,
    phdrs: &P,
    memory: &M,
    addr: usize,
) -> Option<UnwindInfoSections>
where
    L: divination::ObjectLookup,
    P: phdr::PhdrSource,
    M: crate::memory::AddressSpace,
{
    divination::find(fast, memory, addr).or_else(|| phdr::find(phdrs, memory, addr))
}

/// Only asks `_dl_find_object`. [`Lookup::Unavailable`] if it doesn't exist
/// or doesn't know `pc`.
pub fn dl_find_object(pc: *const ffi::c_void) -> Lookup<UnwindInfoSections> {
    divination::find(
        divination::lookup_service().as_ref(),
        &LocalMemory,
        pc.addr(),
    )
}

/// Only walks the program headers of all loaded objects.
pub fn dl_iterate_phdr(pc: *const ffi::c_void) -> Option<UnwindInfoSections> {
    phdr::find(&phdr::DlIteratePhdr, &LocalMemory, pc.addr())
}

/// Decodes the `.eh_frame_hdr` at `hdr`, reading at most `len` bytes if given.
///
/// # Safety
/// `hdr` must point to readable memory, at least `len` bytes of it if `len`
/// is given. Without a `len`, the header itself decides how much is read.
pub unsafe fn decode_eh_frame_hdr(hdr: *const u8, len: Option<usize>) -> Option<EhFrameHdr> {
    eh_frame_hdr::decode(&LocalMemory, hdr.expose_provenance(), len)
        .inspect_err(|err| debug!("invalid eh_frame_hdr at {hdr:p}: {err}"))
        .ok()
}
