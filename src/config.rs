// Licensed under the Apache-2.0 license

//! Software configuration of a device instance and the hardware
//! configuration probed from it.

use crate::error::{Error, Result};
use crate::hal::RegisterIo;
use crate::poll::PollLimits;
use crate::regs::{
    Config2Word, ConfigWord, DmaMode, IdWord, Priority, CONFIG, CONFIG2, ID, PRIORITY_CLASSES,
    PROC_LEN,
};
use fugit::MicrosDurationU64;

/// Default number of simultaneously open jobs.
pub const DEFAULT_MAX_JOBS: usize = 64;

/// Pool geometry of the chain (MPM) engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpmConfig {
    /// Hardware job descriptors.
    pub pdus: usize,
    /// Key slots shared by the descriptors.
    pub keys: usize,
    pub chains: usize,
    /// Maximum number of descriptors linked into one chain.
    pub link_capacity: usize,
}

impl Default for MpmConfig {
    fn default() -> Self {
        Self {
            pdus: 64,
            keys: 16,
            chains: 4,
            link_capacity: 16,
        }
    }
}

pub struct DeviceConfig {
    /// Contexts are owned by a device-side allocator shared with other ports.
    pub shared_mode: bool,
    pub max_jobs: usize,
    pub write_cache: bool,
    /// Completion watchdog period in engine clock cycles.
    pub watchdog_cycles: Option<u32>,
    /// Status FIFO fill level that raises the completion interrupt.
    pub stat_irq_threshold: u32,
    pub irq_enabled: bool,
    pub poll: PollLimits,
    /// Park jobs in the deferred buffer instead of failing when a FIFO is full.
    pub buffer_on_full: bool,
    pub mpm: Option<MpmConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfigBuilder::new().build()
    }
}

pub struct DeviceConfigBuilder {
    shared_mode: bool,
    max_jobs: usize,
    write_cache: bool,
    watchdog_cycles: Option<u32>,
    stat_irq_threshold: u32,
    irq_enabled: bool,
    poll: PollLimits,
    buffer_on_full: bool,
    mpm: Option<MpmConfig>,
}

impl Default for DeviceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared_mode: false,
            max_jobs: DEFAULT_MAX_JOBS,
            write_cache: true,
            watchdog_cycles: None,
            stat_irq_threshold: 1,
            irq_enabled: true,
            poll: PollLimits::default(),
            buffer_on_full: true,
            mpm: None,
        }
    }
    #[must_use]
    pub fn shared_mode(mut self, enabled: bool) -> Self {
        self.shared_mode = enabled;
        self
    }
    #[must_use]
    pub fn max_jobs(mut self, jobs: usize) -> Self {
        self.max_jobs = jobs;
        self
    }
    #[must_use]
    pub fn write_cache(mut self, enabled: bool) -> Self {
        self.write_cache = enabled;
        self
    }
    #[must_use]
    pub fn watchdog_cycles(mut self, cycles: u32) -> Self {
        self.watchdog_cycles = Some(cycles);
        self
    }
    #[must_use]
    pub fn stat_irq_threshold(mut self, threshold: u32) -> Self {
        self.stat_irq_threshold = threshold;
        self
    }
    #[must_use]
    pub fn irq_enabled(mut self, enabled: bool) -> Self {
        self.irq_enabled = enabled;
        self
    }
    #[must_use]
    pub fn poll_timeout(mut self, timeout: MicrosDurationU64) -> Self {
        self.poll.timeout = timeout;
        self
    }
    #[must_use]
    pub fn poll_iterations(mut self, iterations: u32) -> Self {
        self.poll.iterations = iterations;
        self
    }
    #[must_use]
    pub fn buffer_on_full(mut self, enabled: bool) -> Self {
        self.buffer_on_full = enabled;
        self
    }
    #[must_use]
    pub fn mpm(mut self, mpm: MpmConfig) -> Self {
        self.mpm = Some(mpm);
        self
    }
    #[must_use]
    pub fn build(self) -> DeviceConfig {
        DeviceConfig {
            shared_mode: self.shared_mode,
            max_jobs: self.max_jobs,
            write_cache: self.write_cache,
            watchdog_cycles: self.watchdog_cycles,
            stat_irq_threshold: self.stat_irq_threshold,
            irq_enabled: self.irq_enabled,
            poll: self.poll,
            buffer_on_full: self.buffer_on_full,
            mpm: self.mpm,
        }
    }
}

/// Hardware parameters read back from the identification registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    pub major: u32,
    pub minor: u32,
    pub project: u32,
    pub qos: bool,
    pub num_ctx: usize,
    /// Bytes of cipher context memory per slot.
    pub ciph_page: u32,
    /// Bytes of hash context memory per slot.
    pub hash_page: u32,
    pub dma_mode: DmaMode,
    /// Command FIFO depth per priority class; zero marks an absent FIFO.
    pub fifo_depth: [u32; PRIORITY_CLASSES],
    pub stat_depth: u32,
    /// Largest value the processing-length register can hold.
    pub max_msg_len: u32,
}

impl HwConfig {
    /// Read the identification registers and probe the length register width.
    ///
    /// # Errors
    /// `ModuleDisabled` if the engine reports no contexts or no command FIFO.
    pub fn probe<R: RegisterIo + ?Sized>(regs: &R) -> Result<Self> {
        let id = IdWord(regs.read32(ID));
        let cfg = ConfigWord(regs.read32(CONFIG));
        let cfg2 = Config2Word(regs.read32(CONFIG2));

        regs.write32(PROC_LEN, u32::MAX);
        let max_msg_len = regs.read32(PROC_LEN);
        regs.write32(PROC_LEN, 0);

        let qos = id.qos() != 0;
        let fifo_depth = if qos {
            [cfg2.cmd0_depth(), cfg2.cmd1_depth(), cfg2.cmd2_depth()]
        } else {
            [cfg2.cmd0_depth(), 0, 0]
        };

        let hw = Self {
            major: id.major(),
            minor: id.minor(),
            project: id.project(),
            qos,
            num_ctx: usize::try_from(cfg.ctx_cnt()).map_err(|_| Error::InvalidContext)?,
            ciph_page: 1 << cfg.ciph_page_log2(),
            hash_page: 1 << cfg.hash_page_log2(),
            dma_mode: DmaMode::from_bits(cfg.dma_type()),
            fifo_depth,
            stat_depth: cfg2.stat_depth(),
            max_msg_len,
        };

        if hw.num_ctx == 0 || fifo_depth.iter().all(|d| *d == 0) || max_msg_len == 0 {
            log::error!("engine reports no usable contexts or FIFOs: {hw:?}");
            return Err(Error::ModuleDisabled);
        }

        log::info!(
            "engine {:#06x} v{}.{}: {} contexts, fifos {:?}, max message {:#x}",
            hw.project,
            hw.major,
            hw.minor,
            hw.num_ctx,
            hw.fifo_depth,
            hw.max_msg_len
        );
        Ok(hw)
    }

    /// Depth of the FIFO serving `priority`.
    #[must_use]
    pub fn fifo_depth(&self, priority: Priority) -> u32 {
        self.fifo_depth.get(priority.index()).copied().unwrap_or(0)
    }
}
