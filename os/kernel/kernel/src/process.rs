//! Guest processes.

use crate::handle_table::HandleTable;
use crate::ids::{ObjectId, ProcessId, ThreadId};
use crate::resource_limit::ResourceLimit;
use kernel_alloc::SlabPool;
use kernel_info::memory::ADDRESS_SPACE_START;
use kernel_info::scheduling::{ALL_CORES_MASK, ALL_PRIORITIES_MASK};
use kernel_vmem::MemoryManager;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Decides which ledger node pool a process draws from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProcessCategory {
    Application,
    System,
}

impl ProcessCategory {
    #[must_use]
    pub const fn slab_pool(self) -> SlabPool {
        match self {
            Self::Application => SlabPool::Small,
            Self::System => SlabPool::Large,
        }
    }
}

/// Everything needed to create a process.
#[derive(Debug, Clone)]
pub struct ProcessCreationInfo {
    pub name: String,
    pub title_id: u64,
    pub category: ProcessCategory,
    /// Page-aligned base of the code mapping inside the code region.
    pub code_address: u64,
    pub code_pages: u64,
    /// Bytes copied to the start of the code mapping before it becomes visible.
    pub image: Vec<u8>,
    pub core_mask: u64,
    pub priority_mask: u64,
    pub default_core: usize,
    /// Shared limit; a fresh unlimited one when `None`.
    pub resource_limit: Option<Arc<ResourceLimit>>,
}

impl ProcessCreationInfo {
    /// An application with one code page at the bottom of the address space,
    /// allowed on every core and priority.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title_id: 0,
            category: ProcessCategory::Application,
            code_address: ADDRESS_SPACE_START,
            code_pages: 1,
            image: Vec::new(),
            core_mask: ALL_CORES_MASK,
            priority_mask: ALL_PRIORITIES_MASK,
            default_core: 0,
            resource_limit: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Created,
    Started,
}

#[derive(Debug)]
pub(crate) struct ProcessRecord {
    pub id: ProcessId,
    pub name: String,
    pub title_id: u64,
    pub state: ProcessState,
    /// Base of the code mapping, where the main thread starts.
    pub entry_point: u64,
    pub memory: MemoryManager,
    pub handles: HandleTable,
    pub threads: BTreeSet<ThreadId>,
    /// Signaled when the process exits.
    pub object: ObjectId,
    pub core_mask: u64,
    pub priority_mask: u64,
    pub default_core: usize,
    pub limit: Arc<ResourceLimit>,
    /// Physical memory charged against `limit`.
    pub reserved_memory: u64,
    pub main_thread: Option<ThreadId>,
}

impl ProcessRecord {
    pub const fn allows_priority(&self, priority: u8) -> bool {
        priority < 64 && self.priority_mask & (1 << priority) != 0
    }

    pub const fn allows_core(&self, core: usize) -> bool {
        core < 64 && self.core_mask & (1 << core) != 0
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.id,
            name: self.name.clone(),
            title_id: self.title_id,
            state: self.state,
            threads: self.threads.len(),
            handles: self.handles.len(),
            used_memory: self.memory.used_memory(),
            heap_size: self.memory.heap_size(),
        }
    }
}

/// Snapshot of a live process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub name: String,
    pub title_id: u64,
    pub state: ProcessState,
    pub threads: usize,
    pub handles: usize,
    pub used_memory: u64,
    pub heap_size: u64,
}
