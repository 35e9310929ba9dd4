use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalAddress;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("physical access at {address} of {len:#x} bytes is outside guest DRAM")]
pub struct PhysicalAccessError {
    pub address: PhysicalAddress,
    pub len: usize,
}

/// Host memory backing the guest's DRAM.
pub struct PhysicalMemory {
    bytes: Vec<u8>,
}

impl PhysicalMemory {
    /// Allocates `size` zeroed bytes of guest DRAM.
    ///
    /// # Panics
    /// If `size` does not fit the host address space.
    #[must_use]
    pub fn new(size: u64) -> Self {
        let Ok(size) = usize::try_from(size) else {
            panic!("guest DRAM of {size:#x} bytes does not fit the host");
        };
        Self {
            bytes: vec![0; size],
        }
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn bounds(&self, address: PhysicalAddress, len: usize) -> Result<core::ops::Range<usize>, PhysicalAccessError> {
        let err = PhysicalAccessError { address, len };
        let start = usize::try_from(address.as_u64()).map_err(|_| err)?;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.bytes.len() {
            return Err(err);
        }
        Ok(start..end)
    }

    /// # Errors
    /// If the range leaves guest DRAM.
    pub fn slice(&self, address: PhysicalAddress, len: usize) -> Result<&[u8], PhysicalAccessError> {
        let range = self.bounds(address, len)?;
        Ok(&self.bytes[range])
    }

    /// # Errors
    /// If the range leaves guest DRAM.
    pub fn slice_mut(
        &mut self,
        address: PhysicalAddress,
        len: usize,
    ) -> Result<&mut [u8], PhysicalAccessError> {
        let range = self.bounds(address, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Zero-fills `len` bytes; used when handing fresh frames to a process.
    ///
    /// # Errors
    /// If the range leaves guest DRAM.
    pub fn zero(&mut self, address: PhysicalAddress, len: usize) -> Result<(), PhysicalAccessError> {
        self.slice_mut(address, len)?.fill(0);
        Ok(())
    }
}

impl core::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("size", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_access() {
        let mut dram = PhysicalMemory::new(0x2000);
        dram.slice_mut(PhysicalAddress::new(0x1FFC), 4)
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(dram.slice(PhysicalAddress::new(0x1FFE), 2).unwrap(), &[3, 4]);
        assert!(dram.slice(PhysicalAddress::new(0x1FFE), 3).is_err());
        dram.zero(PhysicalAddress::new(0x1000), 0x1000).unwrap();
        assert_eq!(dram.slice(PhysicalAddress::new(0x1FFC), 4).unwrap(), &[0; 4]);
    }
}
