//! The `.eh_frame_hdr` section.
//! See <https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html>
//! and <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>.
//!
//! ```text
//! u8       version
//! u8       eh_frame_ptr_enc
//! u8       fde_count_enc
//! u8       table_enc
//! encoded  eh_frame_ptr
//! encoded  fde_count
//! encoded  table[fde_count] = (initial_location, fde_address)
//! ```
//!
//! We only check that the header makes sense and pull out where `.eh_frame`
//! starts. Searching the table is the job of whoever walks the CFI.


use super::parse::{read_encoded, Encoding, Error, Reader, Result};
use crate::memory::AddressSpace;

const VERSION: u8 = 1;

/// A decoded `.eh_frame_hdr` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhFrameHdr {
    /// Start of `.eh_frame`.
    pub eh_frame_ptr: usize,
    /// Number of entries in the search table.
    pub fde_count: usize,
    /// Address of the first search table entry.
    pub table: usize,
    /// Encoding of both halves of every search table entry.
    pub table_enc: Encoding,
}

/// Decodes the header at `hdr`.
///
/// With a `len`, nothing past `hdr + len` is read and a search table that
/// wouldn't fit is an error. Without one, the header is trusted.
pub(crate) fn decode<M: AddressSpace>(
    memory: &M,
    hdr: usize,
    len: Option<usize>,
) -> Result<EhFrameHdr> {
    let mut reader = Reader::new(memory, hdr, len);

    let [version, eh_frame_ptr_enc, fde_count_enc, table_enc] = reader.bytes()?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let eh_frame_ptr_enc = Encoding(eh_frame_ptr_enc);
    let fde_count_enc = Encoding(fde_count_enc);
    let table_enc = Encoding(table_enc);
    trace!(?eh_frame_ptr_enc, ?fde_count_enc, ?table_enc, "eh_frame_hdr");

    let eh_frame_ptr = read_encoded(&mut reader, eh_frame_ptr_enc, hdr)?;
    if eh_frame_ptr == 0 {
        return Err(Error::NullPointer);
    }

    let fde_count = if fde_count_enc.is_omit() {
        0
    } else {
        read_encoded(&mut reader, fde_count_enc, hdr)?
    };

    let table = reader.addr();
    if fde_count > 0 {
        table_enc.check()?;
        let entry_half = table_enc.size()?.ok_or(Error::VariableSizeTable(table_enc))?;
        let table_len = fde_count
            .checked_mul(entry_half * 2)
            .ok_or(Error::Overflow)?;
        reader.ensure(table_len)?;
    } else if !table_enc.is_omit() {
        table_enc.check()?;
    }

    trace!("eh_frame: {eh_frame_ptr:#x}, fde_count: {fde_count}, table: {table:#x}");

    Ok(EhFrameHdr {
        eh_frame_ptr,
        fde_count,
        table,
        table_enc,
    })
}
