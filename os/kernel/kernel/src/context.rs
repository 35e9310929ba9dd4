//! Boot and shutdown of the kernel, and the context every operation runs against.

use crate::config::KernelConfig;
use crate::execution::ContextFactory;
use crate::handle_table::MAX_HANDLE_TABLE_SIZE;
use crate::scheduler::{Reschedule, run_dispatcher, run_preemption};
use crate::state::KernelState;
use crate::time_manager::run_time_manager;
use kernel_info::memory::PAGE_SIZE;
use kernel_info::scheduling::CPU_CORES_COUNT;
use kernel_sync::{CriticalSection, HostEvent};
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shared kernel state plus the host events its worker threads sleep on.
///
/// Every public operation of the kernel is a method on this type. It is
/// handed out as an `Arc` by [`Kernel::context`] and may be used from any
/// host thread.
pub struct KernelContext {
    config: KernelConfig,
    state: CriticalSection<KernelState>,
    core_events: Arc<[HostEvent; CPU_CORES_COUNT]>,
    timer_event: HostEvent,
    shutdown: AtomicBool,
    shutdown_event: HostEvent,
    factory: Arc<dyn ContextFactory>,
}

impl KernelContext {
    fn new(config: KernelConfig, factory: Arc<dyn ContextFactory>) -> Self {
        let core_events: Arc<[HostEvent; CPU_CORES_COUNT]> =
            Arc::new(std::array::from_fn(|_| HostEvent::new(false)));
        let handler = Reschedule::new(Arc::clone(&core_events));
        Self {
            config,
            state: CriticalSection::with_release_handler(
                KernelState::new(&config),
                Box::new(handler),
            ),
            core_events,
            timer_event: HostEvent::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_event: HostEvent::new(false),
            factory,
        }
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) const fn critical_section(&self) -> &CriticalSection<KernelState> {
        &self.state
    }

    pub(crate) fn core_event(&self, core: usize) -> &HostEvent {
        &self.core_events[core]
    }

    pub(crate) const fn timer_event(&self) -> &HostEvent {
        &self.timer_event
    }

    pub(crate) const fn shutdown_event(&self) -> &HostEvent {
        &self.shutdown_event
    }

    pub(crate) fn factory(&self) -> &dyn ContextFactory {
        self.factory.as_ref()
    }

    /// Whether [`Kernel::shutdown`] has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn wake_workers(&self) {
        for event in self.core_events.iter() {
            event.set();
        }
        self.timer_event.set();
        self.shutdown_event.set();
    }
}

impl fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelContext")
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Why [`Kernel::boot`] refused to start.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("handle tables hold at most {MAX_HANDLE_TABLE_SIZE} entries, {0} requested")]
    HandleTableTooLarge(usize),
    #[error("the preemption quantum must not be zero")]
    ZeroQuantum,
    #[error("DRAM size {0:#x} is not a non-zero multiple of the page size")]
    InvalidDramSize(u64),
    #[error("failed to spawn a kernel worker thread")]
    Spawn(#[from] io::Error),
}

/// A booted kernel: the shared context and the host threads serving it.
///
/// Dropping the kernel shuts it down.
pub struct Kernel {
    context: Arc<KernelContext>,
    workers: Vec<JoinHandle<()>>,
}

impl Kernel {
    /// Validates `config` and starts one dispatcher per core, the time
    /// manager and, unless disabled, the preemption thread.
    ///
    /// # Errors
    /// A [`BootError`] if the configuration is unusable or a host thread
    /// could not be spawned. Threads spawned before the failure are stopped.
    pub fn boot(config: KernelConfig, factory: Arc<dyn ContextFactory>) -> Result<Self, BootError> {
        if config.handle_table_size() > MAX_HANDLE_TABLE_SIZE {
            return Err(BootError::HandleTableTooLarge(config.handle_table_size()));
        }
        if config.preemption_quantum() == Duration::ZERO {
            return Err(BootError::ZeroQuantum);
        }
        if config.dram_size() == 0 || config.dram_size() % PAGE_SIZE != 0 {
            return Err(BootError::InvalidDramSize(config.dram_size()));
        }

        let mut kernel = Self {
            context: Arc::new(KernelContext::new(config, factory)),
            workers: Vec::new(),
        };
        for core in 0..CPU_CORES_COUNT {
            kernel.spawn(format!("core-{core}"), move |ctx| run_dispatcher(ctx, core))?;
        }
        kernel.spawn("time-manager".into(), run_time_manager)?;
        if config.run_preemption_thread() {
            kernel.spawn("preemption".into(), run_preemption)?;
        }

        info!(
            "kernel booted: {CPU_CORES_COUNT} cores, {} MiB DRAM, quantum {:?}",
            config.dram_size() >> 20,
            config.preemption_quantum()
        );
        Ok(kernel)
    }

    fn spawn(
        &mut self,
        name: String,
        body: impl FnOnce(&KernelContext) + Send + 'static,
    ) -> io::Result<()> {
        let ctx = Arc::clone(&self.context);
        debug!("spawning {name}");
        let handle = thread::Builder::new().name(name).spawn(move || body(&ctx))?;
        self.workers.push(handle);
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn context(&self) -> &Arc<KernelContext> {
        &self.context
    }

    /// Terminates every process and stops the worker threads.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop(&mut self) {
        if self.context.is_shutting_down() {
            return;
        }

        let processes: Vec<_> = self
            .context
            .critical_section()
            .with_lock(|state| state.processes.keys().copied().collect());
        for process in processes {
            if let Err(e) = self.context.terminate_process(process) {
                debug!("{process} vanished during shutdown: {e}");
            }
        }

        if cfg!(debug_assertions) {
            let report = self.context.audit();
            if !report.is_clean() {
                warn!("kernel state inconsistent at shutdown: {:?}", report.violations);
            }
        }

        self.context.shutdown.store(true, Ordering::Release);
        self.context.wake_workers();
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_owned();
            if worker.join().is_err() {
                error!("{name} panicked");
            }
        }
        info!("kernel stopped");
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("context", &self.context)
            .field("workers", &self.workers.len())
            .finish()
    }
}
