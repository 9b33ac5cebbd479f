// Licensed under the Apache-2.0 license

//! Device instance: probed hardware configuration plus all soft state,
//! guarded by one lock.
//!
//! Submission paths write the hardware while holding the lock so that the
//! register sequence of one job is never interleaved with another's.
//! Callbacks always run with the lock released, so a callback may submit
//! new work.

use crate::config::{DeviceConfig, HwConfig};
use crate::ctx_pool::ContextPool;
use crate::error::{Error, Result};
use crate::hal::{Clock, DmaAllocator, IrqRegistrar, NoClock, RegisterIo};
use crate::job::JobTable;
use crate::mpm::MpmState;
use crate::poll;
use crate::queue::{Submission, SwidTable, DEFERRED_JOB_SLOTS};
use crate::reg_cache::WriteCache;
use crate::regs::{IrqFlags, CTX_CIPH_KEY, CTX_HASH_KEY, IRQ_CTRL, IRQ_EN, IRQ_STAT, STAT_WD_CTRL};
use alloc::boxed::Box;
use alloc::sync::Arc;
use heapless::Deque;
use spin::Mutex;

/// Notified after every drain pass that completed at least one job.
pub trait CompletionObserver: Send + Sync {
    fn on_completions(&self, count: usize);
}

pub(crate) struct State<B> {
    pub(crate) cache: WriteCache,
    pub(crate) pool: ContextPool,
    pub(crate) jobs: JobTable,
    pub(crate) swids: SwidTable,
    pub(crate) deferred: Deque<Submission, DEFERRED_JOB_SLOTS>,
    pub(crate) mpm: Option<MpmState<B>>,
}

pub struct Device<R, A, C = NoClock>
where
    R: RegisterIo,
    A: DmaAllocator,
    C: Clock,
{
    pub(crate) regs: R,
    pub(crate) dma: A,
    pub(crate) clock: C,
    pub(crate) hw: HwConfig,
    pub(crate) cfg: DeviceConfig,
    pub(crate) state: Mutex<State<A::Buffer>>,
    observer: Mutex<Option<Arc<dyn CompletionObserver>>>,
}

impl<R, A, C> Device<R, A, C>
where
    R: RegisterIo,
    A: DmaAllocator,
    C: Clock,
{
    /// Probe the engine and bring it to an idle, interrupt-ready state.
    ///
    /// # Errors
    /// - `ModuleDisabled` if the probe finds no usable engine
    /// - `InvalidSize` if `cfg` asks for no jobs or an empty MPM pool
    /// - `NoMemory` if the MPM pools cannot be allocated
    pub fn new(regs: R, dma: A, clock: C, cfg: DeviceConfig) -> Result<Self> {
        let hw = HwConfig::probe(&regs)?;
        if cfg.max_jobs == 0 {
            return Err(Error::InvalidSize);
        }

        let mpm = match cfg.mpm {
            Some(mpm_cfg) => Some(MpmState::new(&dma, mpm_cfg)?),
            None => None,
        };

        let state = State {
            cache: WriteCache::new(cfg.write_cache),
            pool: ContextPool::new(hw.num_ctx, cfg.shared_mode),
            jobs: JobTable::new(cfg.max_jobs),
            swids: SwidTable::new(),
            deferred: Deque::new(),
            mpm,
        };

        let dev = Self {
            regs,
            dma,
            clock,
            hw,
            cfg,
            state: Mutex::new(state),
            observer: Mutex::new(None),
        };
        dev.init_irq();
        dev.arm_watchdog();
        Ok(dev)
    }

    fn irq_mask(&self) -> IrqFlags {
        let mut mask = IrqFlags::GLBL | IrqFlags::STAT;
        if self.cfg.watchdog_cycles.is_some() {
            mask |= IrqFlags::STAT_WD;
        }
        if self.cfg.mpm.is_some() {
            mask |= IrqFlags::MPM_EOL;
        }
        mask
    }

    fn init_irq(&self) {
        // Discard anything latched before we owned the engine.
        self.regs.write32(IRQ_STAT, IrqFlags::all().bits());
        if self.cfg.irq_enabled {
            self.regs.write32(IRQ_CTRL, self.cfg.stat_irq_threshold);
            self.regs.write32(IRQ_EN, self.irq_mask().bits());
        } else {
            self.regs.write32(IRQ_EN, 0);
        }
    }

    /// Reload the completion watchdog, if one is configured.
    pub(crate) fn arm_watchdog(&self) {
        if let Some(cycles) = self.cfg.watchdog_cycles {
            self.regs.write32(STAT_WD_CTRL, cycles);
        }
    }

    #[must_use]
    pub fn hw_config(&self) -> &HwConfig {
        &self.hw
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    #[must_use]
    pub fn registers(&self) -> &R {
        &self.regs
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.dma
    }

    /// Install (or clear) the observer notified after completions drain.
    pub fn set_completion_observer(&self, observer: Option<Arc<dyn CompletionObserver>>) {
        *self.observer.lock() = observer;
    }

    pub(crate) fn notify_observer(&self, count: usize) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_completions(count);
        }
    }

    /// Reserve `contiguous` context slots, or add a reference to the run
    /// already recorded at `ctx_id`.
    ///
    /// # Errors
    /// See [`ContextPool::request`]; in shared mode also `Timeout`/`Failed`
    /// from the allocator handshake.
    pub fn request_context(&self, ctx_id: Option<usize>, contiguous: usize) -> Result<usize> {
        let mut state = self.state.lock();
        state.pool.request(ctx_id, contiguous, || {
            poll::request_shared_context(&self.regs, &self.clock, &self.cfg.poll)
        })
    }

    /// Drop one reference from the run recorded at `slot`.
    ///
    /// # Errors
    /// See [`ContextPool::release`].
    pub fn release_context(&self, slot: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.pool.release(slot, |s| {
            poll::release_shared_context(&self.regs, &self.clock, &self.cfg.poll, s)
        })
    }

    #[must_use]
    pub fn context_ref_count(&self, slot: usize) -> Option<u32> {
        self.state.lock().pool.ref_count(slot)
    }

    /// Acknowledge and service pending interrupts.
    ///
    /// Returns the number of command-queue completions handled.
    ///
    /// # Errors
    /// Propagates an internal-consistency fault from the drain.
    pub fn handle_irq(&self) -> Result<usize> {
        let pending = IrqFlags::from_bits_truncate(self.regs.read32(IRQ_STAT));
        if !pending.is_empty() {
            self.regs.write32(IRQ_STAT, pending.bits());
        }

        let mut handled = 0;
        if pending.intersects(IrqFlags::STAT | IrqFlags::STAT_WD) {
            handled = self.dequeue_all()?;
        }
        if self.cfg.mpm.is_some() {
            if pending.contains(IrqFlags::MPM_EOL) {
                self.mpm_handle_eol()?;
            }
            self.mpm_poll_on_demand()?;
            self.mpm_poll()?;
        }
        Ok(handled)
    }

    /// Route the engine interrupt to [`Device::handle_irq`].
    ///
    /// The registered handler holds only a weak reference; once the device
    /// is dropped the handler does nothing.
    ///
    /// # Errors
    /// Whatever the registrar reports.
    pub fn attach_irq<I>(self: &Arc<Self>, registrar: &I) -> Result<()>
    where
        I: IrqRegistrar + ?Sized,
        Self: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        registrar.register_irq(Box::new(move || {
            if let Some(dev) = weak.upgrade() {
                if let Err(e) = dev.handle_irq() {
                    log::error!("interrupt service failed: {e}");
                }
            }
        }))
    }

    /// Quiesce the engine: mask interrupts, scrub every context slot and
    /// drop all soft state including the MPM pools.
    ///
    /// Jobs still in flight are abandoned; their completions are never
    /// reported.
    pub fn shutdown(&self) {
        self.regs.write32(IRQ_EN, 0);
        self.regs.write32(IRQ_STAT, IrqFlags::all().bits());

        let mut state = self.state.lock();
        for ctx in 0..self.hw.num_ctx {
            // num_ctx comes from an 8-bit field.
            #[allow(clippy::cast_possible_truncation)]
            let ctx = ctx as u32;
            zero_window(&self.regs, CTX_CIPH_KEY + ctx * self.hw.ciph_page, self.hw.ciph_page);
            zero_window(&self.regs, CTX_HASH_KEY + ctx * self.hw.hash_page, self.hw.hash_page);
        }
        state.pool.reset();
        state.jobs.clear();
        state.swids.clear();
        state.deferred.clear();
        state.cache.invalidate();
        state.mpm = None;
        log::info!("engine shut down");
    }
}

fn zero_window<R: RegisterIo + ?Sized>(regs: &R, base: u32, len: u32) {
    for offset in (0..len).step_by(4) {
        regs.write32(base + offset, 0);
    }
}
