// Licensed under the Apache-2.0 license

//! Register-level model of the engine.
//!
//! The model keeps the command FIFOs, the status FIFO, the shared-hardware
//! allocator and semaphore, and walks MPM chains on request. Jobs are
//! "executed" by moving bytes from the source table to the destination
//! table; no cryptography is performed. Nothing runs on its own: tests
//! decide when the hardware makes progress with [`SimEngine::process_all`]
//! and [`SimEngine::step_mpm`], unless `auto_complete` is set.

use super::memory::SimMemory;
use crate::hal::{Clock, Instant, RegisterIo};
use crate::mpm::pdu::{done_status, Pdu, PDU_SIZE, STATUS_OFFSET};
use crate::regs::{
    Config2Word, ConfigWord, CtrlWord, FifoStat, HsmCmd, HsmStat, IdWord, IrqFlags, MpmStatus,
    OffsetWord, Priority, ResultCode, StatusWord, SwCtrl, AUX_INFO, CONFIG, CONFIG2, CTRL, DST_PTR,
    FIFO_STAT, HSM_CTX_CMD, HSM_CTX_STAT, HSM_SEM_CMD, HSM_SEM_STAT, ICV_LEN, ICV_OFFSET, ID,
    IRQ_STAT, IV_OFFSET, MPM_START, MPM_STATUS, OFFSET, POST_AAD_LEN, PRE_AAD_LEN,
    PRIORITY_CLASSES, PROC_LEN, SRC_PTR, STATUS, STAT_POP, SW_CTRL,
};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use zerocopy::FromBytes;

/// Geometry reported by the simulated identification registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimParams {
    pub project: u32,
    pub major: u32,
    pub minor: u32,
    pub num_ctx: u32,
    /// Per-priority command FIFO depth; zero disables the class.
    pub fifo_depth: [u32; PRIORITY_CLASSES],
    pub stat_depth: u32,
    /// Width mask of the `PROC_LEN` register.
    pub max_msg_len: u32,
    /// Complete every command the moment `CTRL` is written.
    pub auto_complete: bool,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            project: 0x0605,
            major: 5,
            minor: 1,
            num_ctx: 32,
            fifo_depth: [4, 4, 0],
            stat_depth: 16,
            max_msg_len: 0x00ff_ffff,
            auto_complete: false,
        }
    }
}

/// How the shared-hardware allocator and semaphore answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HsmBehaviour {
    #[default]
    Grant,
    /// Answer ready without the success flag.
    Refuse,
    /// Never raise the ready flag.
    NeverReady,
}

/// A command as latched when `CTRL` was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimCommand {
    pub swid: u8,
    pub priority: Priority,
    pub ctrl: CtrlWord,
    pub src: u32,
    pub dst: u32,
    pub offset: OffsetWord,
    pub pre_aad_len: u32,
    pub post_aad_len: u32,
    pub proc_len: u32,
    pub icv_len: u32,
    pub icv_offset: u32,
    pub iv_offset: u32,
    pub aux_info: u32,
}

struct EngineState {
    params: SimParams,
    regs: BTreeMap<u32, u32>,
    cmd: [VecDeque<SimCommand>; PRIORITY_CLASSES],
    stat: VecDeque<u32>,
    status_latch: u32,
    irq_stat: u32,
    history: Vec<SimCommand>,
    write_log: Vec<(u32, u32)>,
    fail: VecDeque<ResultCode>,
    hsm: HsmBehaviour,
    ctx_owned: Vec<bool>,
    ctx_stat: u32,
    sem_stat: u32,
    sem_held: bool,
    sem_grants: u64,
    mpm_cursor: Option<u32>,
    mpm_starts: u64,
}

impl EngineState {
    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn fifo_stat(&self) -> FifoStat {
        let mut word = FifoStat::default();
        for (i, q) in self.cmd.iter().enumerate() {
            let depth = self.params.fifo_depth.get(i).copied().unwrap_or(0);
            let count = u32::try_from(q.len()).unwrap_or(u32::MAX);
            let full = u32::from(count >= depth);
            word = match i {
                0 => word.with_cmd0_cnt(count).with_cmd0_full(full),
                1 => word.with_cmd1_cnt(count).with_cmd1_full(full),
                _ => word.with_cmd2_cnt(count).with_cmd2_full(full),
            };
        }
        let stat = u32::try_from(self.stat.len()).unwrap_or(u32::MAX);
        word.with_stat_cnt(stat).with_stat_empty(u32::from(stat == 0))
    }

    fn latch_command(&mut self, ctrl: u32) {
        let sw = SwCtrl(self.reg(SW_CTRL));
        let priority = Priority::from_index(sw.priority()).unwrap_or_default();
        let cmd = SimCommand {
            swid: u8::try_from(sw.swid()).unwrap_or(u8::MAX),
            priority,
            ctrl: CtrlWord(ctrl),
            src: self.reg(SRC_PTR),
            dst: self.reg(DST_PTR),
            offset: OffsetWord(self.reg(OFFSET)),
            pre_aad_len: self.reg(PRE_AAD_LEN),
            post_aad_len: self.reg(POST_AAD_LEN),
            proc_len: self.reg(PROC_LEN),
            icv_len: self.reg(ICV_LEN),
            icv_offset: self.reg(ICV_OFFSET),
            iv_offset: self.reg(IV_OFFSET),
            aux_info: self.reg(AUX_INFO),
        };
        self.history.push(cmd);
        if let Some(q) = self.cmd.get_mut(priority.index()) {
            q.push_back(cmd);
        }
    }

    /// Status word for a handshake that is not granted.
    fn refusal(&self) -> u32 {
        match self.hsm {
            HsmBehaviour::NeverReady => 0,
            _ => HsmStat::default().with_ready(1).bits(),
        }
    }

    fn context_command(&mut self, cmd: HsmCmd) {
        let ready = HsmStat::default().with_ready(1);
        if self.hsm != HsmBehaviour::Grant {
            self.ctx_stat = self.refusal();
            return;
        }
        self.ctx_stat = if cmd.release() != 0 {
            let idx = usize::try_from(cmd.ctx_idx()).unwrap_or(usize::MAX);
            match self.ctx_owned.get_mut(idx) {
                Some(owned) if *owned => {
                    *owned = false;
                    ready.with_success(1).with_ctx_idx(cmd.ctx_idx()).bits()
                }
                _ => ready.bits(),
            }
        } else {
            match self.ctx_owned.iter().position(|o| !o) {
                Some(idx) => {
                    if let Some(owned) = self.ctx_owned.get_mut(idx) {
                        *owned = true;
                    }
                    let idx = u32::try_from(idx).unwrap_or(0);
                    ready.with_success(1).with_ctx_idx(idx).bits()
                }
                None => ready.bits(),
            }
        };
    }

    fn semaphore_command(&mut self, cmd: HsmCmd) {
        let ready = HsmStat::default().with_ready(1);
        if self.hsm != HsmBehaviour::Grant {
            self.sem_stat = self.refusal();
            return;
        }
        self.sem_stat = if cmd.release() != 0 {
            let held = core::mem::replace(&mut self.sem_held, false);
            ready.with_success(u32::from(held)).bits()
        } else if self.sem_held {
            ready.bits()
        } else {
            self.sem_held = true;
            self.sem_grants += 1;
            ready.with_success(1).bits()
        };
    }

    fn next_code(&mut self) -> ResultCode {
        self.fail.pop_front().unwrap_or(ResultCode::Ok)
    }

    /// Move the payload of one job; a bad pointer turns into a memory error.
    fn execute(mem: &SimMemory, src: u32, dst: u32, code: ResultCode) -> ResultCode {
        if code != ResultCode::Ok {
            return code;
        }
        let moved = mem
            .gather(u64::from(src))
            .and_then(|data| mem.scatter(u64::from(dst), &data));
        match moved {
            Ok(_) => ResultCode::Ok,
            Err(_) => ResultCode::MemoryError,
        }
    }

    fn process_all(&mut self, mem: &SimMemory) -> usize {
        let mut done = 0;
        for class in 0..PRIORITY_CLASSES {
            loop {
                if self.stat.len() >= self.params.stat_depth as usize {
                    return done;
                }
                let Some(cmd) = self.cmd.get_mut(class).and_then(VecDeque::pop_front) else {
                    break;
                };
                let code = self.next_code();
                let code = Self::execute(mem, cmd.src, cmd.dst, code);
                let status = StatusWord::default()
                    .with_swid(u32::from(cmd.swid))
                    .with_ret_code(code.bits());
                self.stat.push_back(status.bits());
                self.irq_stat |= IrqFlags::STAT.bits();
                done += 1;
            }
        }
        done
    }

    fn step_mpm(&mut self, mem: &SimMemory, budget: usize) -> usize {
        let mut done = 0;
        while done < budget {
            let Some(at) = self.mpm_cursor else {
                break;
            };
            let mut raw = [0u8; PDU_SIZE];
            let Ok(pdu) = mem
                .read(u64::from(at), &mut raw)
                .map_err(|_| ())
                .and_then(|()| Pdu::read_from_bytes(&raw).map_err(|_| ()))
            else {
                log::error!("sim: chain walked into unmapped memory at {at:#x}");
                self.mpm_cursor = None;
                break;
            };
            let code = self.next_code();
            let code = Self::execute(mem, pdu.src.get(), pdu.dst.get(), code);
            if mem
                .write_u32(u64::from(at) + STATUS_OFFSET as u64, done_status(code))
                .is_err()
            {
                log::error!("sim: cannot write back status at {at:#x}");
            }
            done += 1;

            match pdu.next_ptr.get() {
                0 => {
                    self.mpm_cursor = None;
                    self.irq_stat |= IrqFlags::MPM_EOL.bits();
                }
                next => self.mpm_cursor = Some(next),
            }
        }
        done
    }
}

/// Simulated engine. Clones share one register file, so a test can keep a
/// handle while the device owns another.
#[derive(Clone)]
pub struct SimEngine {
    state: Arc<Mutex<EngineState>>,
    mem: SimMemory,
}

impl SimEngine {
    #[must_use]
    pub fn new(params: SimParams) -> Self {
        Self::with_memory(params, SimMemory::new())
    }

    #[must_use]
    pub fn with_memory(params: SimParams, mem: SimMemory) -> Self {
        let state = EngineState {
            params,
            regs: BTreeMap::new(),
            cmd: core::array::from_fn(|_| VecDeque::new()),
            stat: VecDeque::new(),
            status_latch: 0,
            irq_stat: 0,
            history: Vec::new(),
            write_log: Vec::new(),
            fail: VecDeque::new(),
            hsm: HsmBehaviour::Grant,
            ctx_owned: alloc::vec![false; params.num_ctx as usize],
            ctx_stat: 0,
            sem_stat: 0,
            sem_held: false,
            sem_grants: 0,
            mpm_cursor: None,
            mpm_starts: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            mem,
        }
    }

    /// The memory the engine performs DMA against.
    #[must_use]
    pub fn memory(&self) -> SimMemory {
        self.mem.clone()
    }

    /// Last value stored at `offset`, without read side effects.
    #[must_use]
    pub fn reg(&self, offset: u32) -> u32 {
        self.state.lock().reg(offset)
    }

    /// Store a register value behind the driver's back.
    pub fn write_raw(&self, offset: u32, value: u32) {
        self.state.lock().regs.insert(offset, value);
    }

    #[must_use]
    pub fn write_log(&self) -> Vec<(u32, u32)> {
        self.state.lock().write_log.clone()
    }

    pub fn clear_write_log(&self) {
        self.state.lock().write_log.clear();
    }

    /// Writes to `offset` since the log was last cleared.
    #[must_use]
    pub fn write_count(&self, offset: u32) -> usize {
        self.state
            .lock()
            .write_log
            .iter()
            .filter(|(o, _)| *o == offset)
            .count()
    }

    /// Every command latched so far, in submission order.
    #[must_use]
    pub fn history(&self) -> Vec<SimCommand> {
        self.state.lock().history.clone()
    }

    /// Queued commands per priority class.
    #[must_use]
    pub fn pending(&self, priority: Priority) -> usize {
        self.state
            .lock()
            .cmd
            .get(priority.index())
            .map_or(0, VecDeque::len)
    }

    /// Complete queued commands until the FIFOs drain or the status FIFO
    /// fills. Returns the number completed.
    pub fn process_all(&self) -> usize {
        self.state.lock().process_all(&self.mem)
    }

    /// Report `code` for the next command or chain descriptor executed.
    pub fn fail_next(&self, code: ResultCode) {
        self.state.lock().fail.push_back(code);
    }

    /// Push a raw word into the status FIFO.
    pub fn inject_status(&self, word: u32) {
        let mut s = self.state.lock();
        s.stat.push_back(word);
        s.irq_stat |= IrqFlags::STAT.bits();
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().params.auto_complete = enabled;
    }

    pub fn set_hsm(&self, behaviour: HsmBehaviour) {
        self.state.lock().hsm = behaviour;
    }

    #[must_use]
    pub fn semaphore_grants(&self) -> u64 {
        self.state.lock().sem_grants
    }

    #[must_use]
    pub fn semaphore_held(&self) -> bool {
        self.state.lock().sem_held
    }

    /// Contexts currently handed out by the shared allocator.
    #[must_use]
    pub fn shared_contexts(&self) -> usize {
        self.state.lock().ctx_owned.iter().filter(|o| **o).count()
    }

    #[must_use]
    pub fn mpm_start_count(&self) -> u64 {
        self.state.lock().mpm_starts
    }

    /// Execute up to `count` descriptors of the running chain.
    pub fn step_mpm(&self, count: usize) -> usize {
        self.state.lock().step_mpm(&self.mem, count)
    }

    /// Execute the running chain to its end.
    pub fn run_mpm(&self) -> usize {
        self.step_mpm(usize::MAX)
    }
}

impl RegisterIo for SimEngine {
    fn read32(&self, offset: u32) -> u32 {
        let s = self.state.lock();
        let p = &s.params;
        let [cmd0, cmd1, cmd2] = p.fifo_depth;
        match offset {
            ID => IdWord::default()
                .with_minor(p.minor)
                .with_major(p.major)
                .with_qos(u32::from(cmd1 > 0 || cmd2 > 0))
                .with_project(p.project)
                .bits(),
            CONFIG => ConfigWord::default()
                .with_ctx_cnt(p.num_ctx)
                .with_ciph_page_log2(6)
                .with_hash_page_log2(7)
                .with_dma_type(1)
                .bits(),
            CONFIG2 => Config2Word::default()
                .with_cmd0_depth(cmd0)
                .with_cmd1_depth(cmd1)
                .with_cmd2_depth(cmd2)
                .with_stat_depth(p.stat_depth)
                .bits(),
            FIFO_STAT => s.fifo_stat().bits(),
            STATUS => s.status_latch,
            IRQ_STAT => s.irq_stat,
            HSM_CTX_STAT => s.ctx_stat,
            HSM_SEM_STAT => s.sem_stat,
            MPM_STATUS => MpmStatus::default()
                .with_busy(u32::from(s.mpm_cursor.is_some()))
                .bits(),
            _ => s.reg(offset),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut s = self.state.lock();
        s.write_log.push((offset, value));
        match offset {
            PROC_LEN => {
                let masked = value & s.params.max_msg_len;
                s.regs.insert(offset, masked);
            }
            IRQ_STAT => s.irq_stat &= !value,
            STAT_POP => {
                s.status_latch = s.stat.pop_front().unwrap_or(0);
                if s.stat.is_empty() {
                    s.irq_stat &= !IrqFlags::STAT.bits();
                }
            }
            CTRL => {
                s.latch_command(value);
                if s.params.auto_complete {
                    s.process_all(&self.mem);
                }
            }
            HSM_CTX_CMD => s.context_command(HsmCmd(value)),
            HSM_SEM_CMD => s.semaphore_command(HsmCmd(value)),
            MPM_START => {
                s.mpm_cursor = Some(value);
                s.mpm_starts += 1;
            }
            _ => {
                s.regs.insert(offset, value);
            }
        }
    }
}

/// Manually advanced clock; each reading also moves time forward by `step`.
#[derive(Clone, Default)]
pub struct SimClock {
    now: Arc<AtomicU64>,
    step: u64,
}

impl SimClock {
    /// Clock advancing `step_us` microseconds per reading.
    #[must_use]
    pub fn ticking(step_us: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
            step: step_us,
        }
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Option<Instant> {
        Some(Instant::from_ticks(self.now.fetch_add(self.step, Ordering::SeqCst)))
    }
}
