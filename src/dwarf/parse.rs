//! Reading the encoded pointers used all over `.eh_frame_hdr`.
//!
//! Source: https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/dwarfext.html
//!
//! Every pointer-ish value in the header is preceded (somewhere) by a
//! `DW_EH_PE_*` byte describing it. The low nibble says how the value is
//! stored, the next three bits say what it is relative to, and the top bit
//! says whether the result has to be dereferenced once more. `0xff` means the
//! value isn't there at all.
//!
//! Reads go through an [`AddressSpace`] and are bounds checked against the
//! section length when we know it. When we don't, we read exactly as far as
//! the data tells us to and no further.


use core::fmt;

use crate::memory::AddressSpace;

/// The header is invalid. This means no unwinding for the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Tried to read `len` bytes at `addr`, past the end of the section or
    /// into memory we can't read.
    OutOfBounds { addr: usize, len: usize },
    UnsupportedVersion(u8),
    /// The low nibble of the encoding is not a value format we know.
    UnknownFormat(Encoding),
    /// `textrel`, `funcrel`, `aligned` or garbage. None of these show up in
    /// `.eh_frame_hdr` in practice.
    UnsupportedApplication(Encoding),
    Indirect(Encoding),
    /// A value that must be present was encoded as `DW_EH_PE_omit`.
    Omitted,
    NullPointer,
    /// The search table needs fixed size entries, LEB128 doesn't do that.
    VariableSizeTable(Encoding),
    /// A LEB128 or a size computation didn't fit into its type.
    Overflow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds { addr, len } => {
                write!(f, "index out of bounds, tried to read {len} bytes at {addr:#x}")
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported eh_frame_hdr version {v}"),
            Self::UnknownFormat(enc) => write!(f, "unknown value format in encoding {:#04x}", enc.0),
            Self::UnsupportedApplication(enc) => {
                write!(f, "unsupported value application in encoding {:#04x}", enc.0)
            }
            Self::Indirect(enc) => write!(f, "indirect encoding {:#04x} is not supported", enc.0),
            Self::Omitted => f.write_str("required value is omitted"),
            Self::NullPointer => f.write_str("pointer is null"),
            Self::VariableSizeTable(enc) => {
                write!(f, "search table encoding {:#04x} has no fixed size", enc.0)
            }
            Self::Overflow => f.write_str("value overflowed"),
        }
    }
}

pub(crate) type Result<T, E = Error> = core::result::Result<T, E>;

/// A cursor over (maybe) bounded memory.
pub(crate) struct Reader<'m, M> {
    memory: &'m M,
    pos: usize,
    /// One past the last readable byte, `None` if the length is unknown.
    end: Option<usize>,
}

impl<'m, M: AddressSpace> Reader<'m, M> {
    pub(crate) fn new(memory: &'m M, start: usize, len: Option<usize>) -> Self {
        Self {
            memory,
            pos: start,
            // a length running off the address space is as good as unknown
            end: len.and_then(|len| start.checked_add(len)),
        }
    }

    /// The address the next read starts at.
    pub(crate) fn addr(&self) -> usize {
        self.pos
    }

    /// Checks that `len` more bytes are inside the section, without reading them.
    pub(crate) fn ensure(&self, len: usize) -> Result<()> {
        let end = self.pos.checked_add(len).ok_or(Error::Overflow)?;
        match self.end {
            Some(limit) if end > limit => Err(Error::OutOfBounds {
                addr: self.pos,
                len,
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let out_of_bounds = Error::OutOfBounds {
            addr: self.pos,
            len: N,
        };
        let bytes = self.memory.read(self.pos, N).ok_or(out_of_bounds)?;
        let bytes: [u8; N] = bytes.try_into().map_err(|_| out_of_bounds)?;
        self.pos += N;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        let [b] = self.bytes()?;
        Ok(b)
    }

    fn usize(&mut self) -> Result<usize> {
        Ok(usize::from_ne_bytes(
            self.bytes::<{ core::mem::size_of::<usize>() }>()?,
        ))
    }

    fn uleb128(&mut self) -> Result<u64> {
        let mut result = 0_u64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            // only the lowest bit of the tenth byte still fits
            if shift >= 64 || (shift == 63 && byte & 0b0111_1110 != 0) {
                return Err(Error::Overflow);
            }
            result |= u64::from(byte & 0b0111_1111) << shift;
            shift += 7;
            if (byte >> 7) == 0 {
                return Ok(result);
            }
        }
    }

    fn sleb128(&mut self) -> Result<i64> {
        let mut result = 0_i64;
        let mut shift = 0;
        let byte = loop {
            let byte = self.u8()?;
            // the tenth byte can only carry the sign
            if shift >= 64 || (shift == 63 && !matches!(byte & 0b0111_1111, 0 | 0b0111_1111)) {
                return Err(Error::Overflow);
            }
            result |= i64::from(byte & 0b0111_1111) << shift;
            shift += 7;
            if (byte >> 7) == 0 {
                break byte;
            }
        };
        let sign_bit_set = ((byte >> 6) & 1) == 1;
        if shift < 64 && sign_bit_set {
            result |= -1 << shift;
        }
        Ok(result)
    }
}

/// Reads a value encoded with `encoding` and applies its relocation.
///
/// `datarel_base` is the start of `.eh_frame_hdr`, which is what `datarel` is
/// relative to in there.
pub(crate) fn read_encoded<M: AddressSpace>(
    reader: &mut Reader<'_, M>,
    encoding: Encoding,
    datarel_base: usize,
) -> Result<usize> {
    encoding.check()?;
    let application = encoding.application()?;

    let field_addr = reader.addr();
    let value = match encoding.format()? {
        ValueFormat::DW_EH_PE_absptr => reader.usize()?,
        ValueFormat::DW_EH_PE_uleb128 => {
            usize::try_from(reader.uleb128()?).map_err(|_| Error::Overflow)?
        }
        ValueFormat::DW_EH_PE_udata2 => u16::from_ne_bytes(reader.bytes()?) as usize,
        ValueFormat::DW_EH_PE_udata4 => u32::from_ne_bytes(reader.bytes()?) as usize,
        ValueFormat::DW_EH_PE_udata8 => {
            usize::try_from(u64::from_ne_bytes(reader.bytes()?)).map_err(|_| Error::Overflow)?
        }
        ValueFormat::DW_EH_PE_sleb128 => reader.sleb128()? as isize as usize,
        ValueFormat::DW_EH_PE_sdata2 => i16::from_ne_bytes(reader.bytes()?) as isize as usize,
        ValueFormat::DW_EH_PE_sdata4 => i32::from_ne_bytes(reader.bytes()?) as isize as usize,
        ValueFormat::DW_EH_PE_sdata8 => i64::from_ne_bytes(reader.bytes()?) as isize as usize,
    };

    Ok(match application {
        ValueApplication::DW_EH_PE_absptr => value,
        ValueApplication::DW_EH_PE_pcrel => field_addr.wrapping_add(value),
        ValueApplication::DW_EH_PE_datarel => datarel_base.wrapping_add(value),
        ValueApplication::DW_EH_PE_textrel
        | ValueApplication::DW_EH_PE_funcrel
        | ValueApplication::DW_EH_PE_aligned => {
            return Err(Error::UnsupportedApplication(encoding))
        }
    })
}

#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub(crate) u8);

impl Encoding {
    pub const OMIT: Self = Self(0xff);
    const INDIRECT: u8 = 0x80;

    pub fn is_omit(self) -> bool {
        self == Self::OMIT
    }

    fn is_indirect(self) -> bool {
        self.0 & Self::INDIRECT != 0
    }

    /// Fails for everything [`read_encoded`] refuses to read.
    pub(crate) fn check(self) -> Result<()> {
        if self.is_omit() {
            return Err(Error::Omitted);
        }
        if self.is_indirect() {
            return Err(Error::Indirect(self));
        }
        match self.application()? {
            ValueApplication::DW_EH_PE_absptr
            | ValueApplication::DW_EH_PE_pcrel
            | ValueApplication::DW_EH_PE_datarel => {}
            _ => return Err(Error::UnsupportedApplication(self)),
        }
        self.format().map(drop)
    }

    fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0b1111 {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return Err(Error::UnknownFormat(self)),
        })
    }

    fn application(self) -> Result<ValueApplication> {
        Ok(match (self.0 & !Self::INDIRECT) >> 4 {
            0x0 => ValueApplication::DW_EH_PE_absptr,
            0x1 => ValueApplication::DW_EH_PE_pcrel,
            0x2 => ValueApplication::DW_EH_PE_textrel,
            0x3 => ValueApplication::DW_EH_PE_datarel,
            0x4 => ValueApplication::DW_EH_PE_funcrel,
            0x5 => ValueApplication::DW_EH_PE_aligned,
            _ => return Err(Error::UnsupportedApplication(self)),
        })
    }

    /// The encoded size in bytes, `None` for LEB128.
    pub(crate) fn size(self) -> Result<Option<usize>> {
        Ok(match self.format()? {
            ValueFormat::DW_EH_PE_absptr => Some(core::mem::size_of::<usize>()),
            ValueFormat::DW_EH_PE_uleb128 | ValueFormat::DW_EH_PE_sleb128 => None,
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => Some(2),
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => Some(4),
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => Some(8),
        })
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Ok(application), Ok(format)) => {
                if self.is_indirect() {
                    f.write_str("DW_EH_PE_indirect | ")?;
                }
                write!(f, "{application:?} | {format:?}")
            }
            _ => write!(f, "Encoding({:#04x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
#[allow(non_camel_case_types)]
enum ValueFormat {
    /// A pointer sized value.
    DW_EH_PE_absptr = 0x00,
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug)]
#[repr(u8)]
#[allow(non_camel_case_types)]
enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the current program counter.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}
