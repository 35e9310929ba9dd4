//! Per-process handle tables.
//!
//! A handle is `(serial << 15) | index`. The serial changes every time a slot
//! is reused, so a stale handle to a recycled slot is rejected instead of
//! silently naming a different object.

use crate::ids::ObjectId;
use kernel_info::KernelResult;

const INDEX_BITS: u32 = 15;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const SERIAL_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Largest table a handle can index.
pub const MAX_HANDLE_TABLE_SIZE: usize = 1 << INDEX_BITS;

/// The kernel object behind a handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KernelObject {
    Thread(ObjectId),
    Process(ObjectId),
    /// The waitable side of an event.
    ReadableEvent(ObjectId),
    /// The signaling side of an event.
    WritableEvent(ObjectId),
    /// A counting semaphore released by an HLE service.
    Semaphore(ObjectId),
}

impl KernelObject {
    /// The synchronization object every kind is backed by.
    #[must_use]
    pub const fn object(self) -> ObjectId {
        match self {
            Self::Thread(o)
            | Self::Process(o)
            | Self::ReadableEvent(o)
            | Self::WritableEvent(o)
            | Self::Semaphore(o) => o,
        }
    }

    /// Whether `WaitSynchronization` accepts the handle.
    #[must_use]
    pub const fn is_waitable(self) -> bool {
        !matches!(self, Self::WritableEvent(_))
    }
}

#[derive(Debug, Copy, Clone)]
struct Entry {
    serial: u16,
    object: KernelObject,
}

#[derive(Debug)]
pub(crate) struct HandleTable {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    next_serial: u16,
}

impl HandleTable {
    /// # Panics
    /// If `capacity` exceeds [`MAX_HANDLE_TABLE_SIZE`].
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity <= MAX_HANDLE_TABLE_SIZE,
            "handle table of {capacity} entries cannot be indexed"
        );
        Self {
            entries: vec![None; capacity],
            free: (0..capacity).rev().collect(),
            next_serial: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn allocate_serial(&mut self) -> u16 {
        let serial = self.next_serial;
        self.next_serial = if u32::from(serial) >= SERIAL_MASK { 1 } else { serial + 1 };
        serial
    }

    /// # Errors
    /// [`KernelResult::HandleTableFull`] when every slot is taken.
    pub fn insert(&mut self, object: KernelObject) -> Result<u32, KernelResult> {
        let index = self.free.pop().ok_or(KernelResult::HandleTableFull)?;
        let serial = self.allocate_serial();
        self.entries[index] = Some(Entry { serial, object });
        let index = u32::try_from(index).map_err(|_| KernelResult::HandleTableFull)?;
        Ok((u32::from(serial) << INDEX_BITS) | index)
    }

    fn decode(&self, handle: u32) -> Option<usize> {
        let serial = (handle >> INDEX_BITS) & SERIAL_MASK;
        let reserved = handle >> (2 * INDEX_BITS);
        if serial == 0 || reserved != 0 {
            return None;
        }
        let index = (handle & INDEX_MASK) as usize;
        let entry = self.entries.get(index)?.as_ref()?;
        (u32::from(entry.serial) == serial).then_some(index)
    }

    pub fn get(&self, handle: u32) -> Option<KernelObject> {
        let index = self.decode(handle)?;
        self.entries[index].map(|e| e.object)
    }

    pub fn remove(&mut self, handle: u32) -> Option<KernelObject> {
        let index = self.decode(handle)?;
        let entry = self.entries[index].take()?;
        self.free.push(index);
        Some(entry.object)
    }

    /// Empties the table, returning every object it referenced.
    pub fn drain(&mut self) -> Vec<KernelObject> {
        let objects: Vec<_> = self
            .entries
            .iter_mut()
            .filter_map(|e| e.take().map(|e| e.object))
            .collect();
        self.free = (0..self.entries.len()).rev().collect();
        objects
    }

    pub fn objects(&self) -> impl Iterator<Item = KernelObject> + '_ {
        self.entries.iter().flatten().map(|e| e.object)
    }
}
