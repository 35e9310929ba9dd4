use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Translation of one guest page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageEntry {
    pub frame: PhysicalAddress,
    /// The frame was allocated for this mapping and is freed with it.
    pub owned: bool,
}

/// Guest page number to frame translations of one process.
#[derive(Debug, Default)]
pub struct GuestPageTable {
    entries: BTreeMap<u64, PageEntry>,
    owned_pages: u64,
}

impl GuestPageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            owned_pages: 0,
        }
    }

    #[must_use]
    pub fn translate(&self, page: VirtualAddress) -> Option<PageEntry> {
        self.entries.get(&page.page_number()).copied()
    }

    /// # Panics
    /// If the page is already mapped; the ledger rules that out.
    pub fn map(&mut self, page: VirtualAddress, entry: PageEntry) {
        let previous = self.entries.insert(page.page_number(), entry);
        assert!(previous.is_none(), "page {page} mapped twice");
        if entry.owned {
            self.owned_pages += 1;
        }
    }

    pub fn unmap(&mut self, page: VirtualAddress) -> Option<PageEntry> {
        let entry = self.entries.remove(&page.page_number())?;
        if entry.owned {
            self.owned_pages -= 1;
        }
        Some(entry)
    }

    /// Number of pages whose frames this table owns.
    #[must_use]
    pub const fn owned_pages(&self) -> u64 {
        self.owned_pages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, yielding the owned frames.
    pub fn drain_owned(&mut self) -> impl Iterator<Item = PhysicalAddress> + '_ {
        self.owned_pages = 0;
        core::mem::take(&mut self.entries)
            .into_values()
            .filter(|e| e.owned)
            .map(|e| e.frame)
    }
}
