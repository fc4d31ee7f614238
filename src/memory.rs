//! Access to the memory the unwind tables live in.

/// Something we can read module memory from.
///
/// Lookups only ever go through this, which lets the tests hand the resolver
/// made up modules at made up addresses.
pub(crate) trait AddressSpace {
    /// `len` bytes at `addr`, or `None` if they can't be read.
    fn read(&self, addr: usize, len: usize) -> Option<&[u8]>;
}

/// The memory of the current process.
///
/// Only ever pointed at addresses the dynamic linker handed us (or that we
/// computed from its program headers), which are mapped for as long as the
/// module stays loaded.
pub(crate) struct LocalMemory;

impl AddressSpace for LocalMemory {
    fn read(&self, addr: usize, len: usize) -> Option<&[u8]> {
        if addr == 0 || addr.checked_add(len).is_none() {
            return None;
        }
        let ptr = core::ptr::with_exposed_provenance::<u8>(addr);
        // SAFETY: see above, the loader says this is mapped.
        Some(unsafe { core::slice::from_raw_parts(ptr, len) })
    }
}

/// Memory at made up addresses, for pretending to be a loaded module.
#[cfg(test)]
pub(crate) struct FakeMemory {
    base: usize,
    bytes: Vec<u8>,
}

#[cfg(test)]
impl FakeMemory {
    /// `len` zero bytes starting at `base`.
    pub(crate) fn new(base: usize, len: usize) -> Self {
        Self {
            base,
            bytes: vec![0; len],
        }
    }

    pub(crate) fn write(&mut self, addr: usize, data: &[u8]) {
        let offset = addr - self.base;
        self.bytes[offset..][..data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
impl AddressSpace for FakeMemory {
    fn read(&self, addr: usize, len: usize) -> Option<&[u8]> {
        let offset = addr.checked_sub(self.base)?;
        self.bytes.get(offset..offset.checked_add(len)?)
    }
}
