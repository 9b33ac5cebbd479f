// Licensed under the Apache-2.0 license

//! Command queue: job submission into the priority FIFOs and completion
//! draining from the status FIFO.
//!
//! A submission is fully validated and resolved into register values (a
//! [`Submission`]) before the first register write, so it either lands in
//! hardware completely or not at all. When the target FIFO is full the
//! resolved submission can be parked in a bounded deferred buffer, which is
//! replayed in arrival order after the next drain.

use crate::ddt::Ddt;
use crate::device::{Device, State};
use crate::error::{Error, Result};
use crate::hal::{Clock, DmaAllocator, DmaBuffer, RegisterIo};
use crate::job::{JobHandle, JobState};
use crate::poll;
use crate::regs::{
    CtrlWord, FifoStat, IvOffset, KeySize, OffsetWord, Priority, ResultCode, StatusWord, SwCtrl,
    AUX_INFO, CTRL, DST_PTR, FIFO_STAT, ICV_LEN, ICV_OFFSET, IV_OFFSET, KEY_SZ, OFFSET,
    POST_AAD_LEN, PRE_AAD_LEN, PROC_LEN, SRC_PTR, STATUS, STAT_POP, SW_CTRL,
};
use embedded_hal::delay::DelayNs;
use fugit::MicrosDurationU64;

/// Capacity of the deferred job buffer, shared by all priority classes.
pub const DEFERRED_JOB_SLOTS: usize = 16;

const SWID_SLOTS: usize = 256;

/// Poll interval of [`Device::wait`].
const WAIT_STEP_US: u32 = 10;

/// Maps in-flight software IDs back to job slots.
pub(crate) struct SwidTable {
    owners: [Option<usize>; SWID_SLOTS],
    next: u8,
}

impl SwidTable {
    pub(crate) const fn new() -> Self {
        Self {
            owners: [None; SWID_SLOTS],
            next: 0,
        }
    }

    /// Hand out the next unused ID at or after the wrapping counter.
    pub(crate) fn allocate(&mut self, job: usize) -> Option<u8> {
        let mut swid = self.next;
        for _ in 0..SWID_SLOTS {
            if let Some(owner @ None) = self.owners.get_mut(usize::from(swid)) {
                *owner = Some(job);
                self.next = swid.wrapping_add(1);
                return Some(swid);
            }
            swid = swid.wrapping_add(1);
        }
        None
    }

    /// Release `swid`, returning the job that owned it.
    pub(crate) fn resolve(&mut self, swid: u8) -> Option<usize> {
        self.owners.get_mut(usize::from(swid)).and_then(Option::take)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }

    pub(crate) fn has_free(&self) -> bool {
        self.owners.iter().any(Option::is_none)
    }

    pub(crate) fn clear(&mut self) {
        self.owners = [None; SWID_SLOTS];
    }
}

/// Processing length of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcLen {
    /// Source table length, minus the ICV when decrypting with a plain ICV.
    #[default]
    Auto,
    Explicit(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// Written to the command FIFO.
    Submitted,
    /// Parked in the deferred buffer until the FIFO drains.
    Buffered,
}

/// Per-submission parameters.
pub struct EnqueueParams<'a, B: DmaBuffer> {
    pub src: &'a Ddt<B>,
    pub dst: &'a Ddt<B>,
    pub proc_len: ProcLen,
    pub pre_aad_len: u32,
    pub post_aad_len: u32,
    pub src_offset: u32,
    pub dst_offset: u32,
    /// Take the IV from the source buffer at this offset.
    pub iv_offset: Option<u32>,
    pub aux_info: u32,
    pub priority: Priority,
    /// Overrides the device's buffering policy when set.
    pub buffer_on_full: Option<bool>,
}

impl<'a, B: DmaBuffer> EnqueueParams<'a, B> {
    #[must_use]
    pub fn new(src: &'a Ddt<B>, dst: &'a Ddt<B>) -> Self {
        Self {
            src,
            dst,
            proc_len: ProcLen::Auto,
            pre_aad_len: 0,
            post_aad_len: 0,
            src_offset: 0,
            dst_offset: 0,
            iv_offset: None,
            aux_info: 0,
            priority: Priority::P0,
            buffer_on_full: None,
        }
    }

    #[must_use]
    pub fn proc_len(mut self, len: ProcLen) -> Self {
        self.proc_len = len;
        self
    }

    #[must_use]
    pub fn aad(mut self, pre: u32, post: u32) -> Self {
        self.pre_aad_len = pre;
        self.post_aad_len = post;
        self
    }

    #[must_use]
    pub fn offsets(mut self, src: u32, dst: u32) -> Self {
        self.src_offset = src;
        self.dst_offset = dst;
        self
    }

    #[must_use]
    pub fn iv_offset(mut self, offset: u32) -> Self {
        self.iv_offset = Some(offset);
        self
    }

    #[must_use]
    pub fn aux_info(mut self, aux: u32) -> Self {
        self.aux_info = aux;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn buffer_on_full(mut self, enabled: bool) -> Self {
        self.buffer_on_full = Some(enabled);
        self
    }
}

/// A submission resolved down to register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Submission {
    pub(crate) job: usize,
    pub(crate) priority: Priority,
    src_ptr: u32,
    dst_ptr: u32,
    offset: u32,
    pre_aad_len: u32,
    post_aad_len: u32,
    proc_len: u32,
    icv_len: u32,
    icv_offset: u32,
    iv_offset: u32,
    aux_info: u32,
    ctrl: CtrlWord,
}

fn dma_addr(phys: u64) -> Result<u32> {
    u32::try_from(phys).map_err(|_| Error::InvalidArgument)
}

fn narrow(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidKeySize)
}

impl<R, A, C> Device<R, A, C>
where
    R: RegisterIo,
    A: DmaAllocator,
    C: Clock,
{
    /// Submit `job` with the given buffers.
    ///
    /// # Errors
    /// - `FifoInactive` if the priority class has no FIFO
    /// - `InvalidHandle` for an unknown job, `Failed` if it is still submitted
    /// - `InvalidSize`/`InvalidArgument` for lengths or addresses the engine
    ///   cannot express
    /// - `FifoFull` when the FIFO is full, deferred jobs are still waiting or
    ///   every software ID is in flight, and buffering is off
    /// - `DeferredBufferFull` when buffering is on and the buffer is exhausted
    /// - `Timeout`/`Failed` from the shared-mode semaphore
    pub fn enqueue(&self, job: JobHandle, params: &EnqueueParams<'_, A::Buffer>) -> Result<EnqueueStatus> {
        if self.hw.fifo_depth(params.priority) == 0 {
            return Err(Error::FifoInactive);
        }
        let src_ptr = dma_addr(params.src.phys())?;
        let dst_ptr = dma_addr(params.dst.phys())?;
        if params.src_offset > 0xffff || params.dst_offset > 0xffff {
            return Err(Error::InvalidArgument);
        }
        let offset = OffsetWord::default()
            .with_src(params.src_offset)
            .with_dst(params.dst_offset);
        let iv_offset = match params.iv_offset {
            Some(o) if o > 0x7fff_ffff => return Err(Error::InvalidArgument),
            Some(o) => IvOffset::default().with_offset(o).with_enable(1),
            None => IvOffset::default(),
        };
        let buffer = params.buffer_on_full.unwrap_or(self.cfg.buffer_on_full);

        let mut state = self.state.lock();
        let j = state.jobs.get(job)?;
        if j.state == JobState::Submitted {
            return Err(Error::Failed);
        }
        let total = params.src.total_len();
        let proc_len = match params.proc_len {
            ProcLen::Explicit(len) => u64::from(len),
            ProcLen::Auto if j.strips_icv() => total
                .checked_sub(u64::from(j.icv_len))
                .ok_or(Error::InvalidSize)?,
            ProcLen::Auto => total,
        };
        let proc_len = u32::try_from(proc_len).map_err(|_| Error::InvalidSize)?;
        if proc_len > self.hw.max_msg_len {
            return Err(Error::InvalidSize);
        }

        let sub = Submission {
            job: job.index(),
            priority: params.priority,
            src_ptr,
            dst_ptr,
            offset: offset.bits(),
            pre_aad_len: params.pre_aad_len,
            post_aad_len: params.post_aad_len,
            proc_len,
            icv_len: j.icv_len,
            icv_offset: j.icv_offset,
            iv_offset: iv_offset.bits(),
            aux_info: params.aux_info,
            ctrl: j.ctrl,
        };

        if self.cfg.shared_mode {
            poll::acquire_semaphore(&self.regs, &self.clock, &self.cfg.poll)?;
        }
        let status = self.submit_locked(&mut state, sub, buffer);
        if self.cfg.shared_mode {
            let released = poll::release_semaphore(&self.regs, &self.clock, &self.cfg.poll);
            if let Err(e) = released {
                log::error!("semaphore release failed: {e}");
                status?;
                return Err(e);
            }
        }
        status
    }

    fn submit_locked(
        &self,
        state: &mut State<A::Buffer>,
        sub: Submission,
        buffer: bool,
    ) -> Result<EnqueueStatus> {
        // Deferred jobs go first; a new job may not overtake them.
        let fifo = FifoStat(self.regs.read32(FIFO_STAT));
        let blocked =
            fifo.cmd_full(sub.priority) || !state.deferred.is_empty() || !state.swids.has_free();
        if !blocked {
            self.write_submission(state, &sub)?;
            return Ok(EnqueueStatus::Submitted);
        }
        if !buffer {
            return Err(Error::FifoFull);
        }
        state
            .deferred
            .push_back(sub)
            .map_err(|_| Error::DeferredBufferFull)?;
        if let Some(j) = state.jobs.by_index_mut(sub.job) {
            j.state = JobState::Submitted;
            j.result = None;
        }
        log::warn!(
            "command fifo {:?} blocked, job {} deferred ({} waiting)",
            sub.priority,
            sub.job,
            state.deferred.len()
        );
        Ok(EnqueueStatus::Buffered)
    }

    /// Program one submission; CTRL goes last and starts the job.
    fn write_submission(&self, state: &mut State<A::Buffer>, sub: &Submission) -> Result<()> {
        let State {
            cache, jobs, swids, ..
        } = state;
        let j = jobs.by_index_mut(sub.job).ok_or(Error::InvalidHandle)?;
        let ctx = u32::try_from(j.ctx).map_err(|_| Error::InvalidContext)?;
        let ciph_key = narrow(j.ciph_key_len)?;
        let hash_key = narrow(j.hash_key_len)?;
        let swid = swids.allocate(sub.job).ok_or(Error::FifoFull)?;

        let regs = &self.regs;
        cache.write(regs, SRC_PTR, sub.src_ptr);
        cache.write(regs, DST_PTR, sub.dst_ptr);
        cache.write(regs, OFFSET, sub.offset);
        cache.write(regs, PRE_AAD_LEN, sub.pre_aad_len);
        cache.write(regs, POST_AAD_LEN, sub.post_aad_len);
        cache.write(regs, PROC_LEN, sub.proc_len);
        cache.write(regs, ICV_LEN, sub.icv_len);
        cache.write(regs, ICV_OFFSET, sub.icv_offset);
        cache.write(regs, IV_OFFSET, sub.iv_offset);
        cache.write(regs, AUX_INFO, sub.aux_info);
        let sw_ctrl = SwCtrl::default()
            .with_swid(u32::from(swid))
            .with_priority(sub.priority.bits());
        cache.write(regs, SW_CTRL, sw_ctrl.bits());

        if j.first_use {
            if ciph_key > 0 {
                let ks = KeySize::default()
                    .with_size(ciph_key)
                    .with_ctx_idx(ctx)
                    .with_ciph_sel(1);
                regs.write32(KEY_SZ, ks.bits());
            }
            if hash_key > 0 {
                let ks = KeySize::default()
                    .with_size(hash_key)
                    .with_ctx_idx(ctx)
                    .with_hash_sel(1);
                regs.write32(KEY_SZ, ks.bits());
            }
            j.first_use = false;
        }

        regs.write32(CTRL, sub.ctrl.bits());

        j.swid = Some(swid);
        j.state = JobState::Submitted;
        j.result = None;
        j.pre_aad_len = sub.pre_aad_len;
        j.post_aad_len = sub.post_aad_len;
        log::debug!(
            "job {} submitted: swid {swid} fifo {:?} len {}",
            sub.job,
            sub.priority,
            sub.proc_len
        );
        Ok(())
    }

    /// Move deferred submissions into hardware, oldest first, until the
    /// buffer is empty or the head's FIFO is full again.
    fn replay_deferred(&self, state: &mut State<A::Buffer>) {
        if state.deferred.is_empty() {
            return;
        }
        if self.cfg.shared_mode {
            if let Err(e) = poll::acquire_semaphore(&self.regs, &self.clock, &self.cfg.poll) {
                log::warn!("deferred replay postponed: {e}");
                return;
            }
        }

        while let Some(sub) = state.deferred.front().copied() {
            let fifo = FifoStat(self.regs.read32(FIFO_STAT));
            if fifo.cmd_full(sub.priority) || !state.swids.has_free() {
                break;
            }
            match self.write_submission(state, &sub) {
                Ok(()) => {
                    state.deferred.pop_front();
                }
                Err(Error::FifoFull) => break,
                Err(e) => {
                    log::error!("dropping deferred job {}: {e}", sub.job);
                    state.deferred.pop_front();
                    if let Some(j) = state.jobs.by_index_mut(sub.job) {
                        j.state = JobState::Failed;
                        j.result = Some(Err(e));
                    }
                }
            }
        }

        if self.cfg.shared_mode {
            if let Err(e) = poll::release_semaphore(&self.regs, &self.clock, &self.cfg.poll) {
                log::error!("semaphore release after replay failed: {e}");
            }
        }
    }

    /// Drain the status FIFO, completing every job it reports.
    ///
    /// Callbacks run with the device lock released. Once the status FIFO is
    /// empty the deferred buffer is replayed, the watchdog re-armed and the
    /// completion observer notified.
    ///
    /// Returns the number of completions handled.
    ///
    /// # Errors
    /// `UnknownSoftwareId` if a completion names no in-flight job; the rest
    /// of that batch stays in the status FIFO.
    pub fn dequeue_all(&self) -> Result<usize> {
        let mut count = 0;
        let mut state = self.state.lock();
        loop {
            if FifoStat(self.regs.read32(FIFO_STAT)).stat_cnt() == 0 {
                break;
            }
            self.regs.write32(STAT_POP, 1);
            let status = StatusWord(self.regs.read32(STATUS));
            let swid = u8::try_from(status.swid()).unwrap_or(u8::MAX);

            let Some(index) = state.swids.resolve(swid) else {
                log::error!("completion for unknown swid {swid} (status {:#010x})", status.bits());
                return Err(Error::UnknownSoftwareId);
            };
            let Some(job) = state.jobs.by_index_mut(index) else {
                log::error!("swid {swid} maps to closed job {index}");
                return Err(Error::UnknownSoftwareId);
            };

            let result = ResultCode::from_bits(status.ret_code()).into_result();
            job.swid = None;
            job.state = if result.is_ok() {
                JobState::Completed
            } else {
                JobState::Failed
            };
            job.result = Some(result);
            let callback = job.callback.clone();
            count += 1;

            if let Some(callback) = callback {
                drop(state);
                callback(JobHandle::from_index(index), result);
                state = self.state.lock();
            }
        }

        self.replay_deferred(&mut state);
        drop(state);
        self.arm_watchdog();

        if count > 0 {
            self.notify_observer(count);
        }
        Ok(count)
    }

    /// Non-blocking completion query.
    ///
    /// `WouldBlock` while the job is in flight; otherwise the stored result,
    /// which is consumed (the job returns to `Open`).
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown job, `InvalidArgument` if nothing was
    /// submitted, or the job's own failure.
    pub fn dequeue(&self, job: JobHandle) -> nb::Result<(), Error> {
        let mut state = self.state.lock();
        let j = state.jobs.get_mut(job).map_err(nb::Error::Other)?;
        match j.state {
            JobState::Submitted => Err(nb::Error::WouldBlock),
            JobState::Completed | JobState::Failed => {
                j.state = JobState::Open;
                j.result.take().unwrap_or(Ok(())).map_err(nb::Error::Other)
            }
            JobState::Open => Err(nb::Error::Other(Error::InvalidArgument)),
        }
    }

    /// Spin on the drain until `job` completes or `timeout` elapses,
    /// sleeping on `delay` between polls.
    ///
    /// # Errors
    /// `Timeout`, the job's own failure, or a drain fault.
    pub fn wait<D: DelayNs>(&self, job: JobHandle, delay: &mut D, timeout: MicrosDurationU64) -> Result<()> {
        let budget = timeout.to_micros();
        let mut waited = 0u64;
        loop {
            self.dequeue_all()?;
            match self.dequeue(job) {
                Ok(()) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {}
            }
            if waited >= budget {
                return Err(Error::Timeout);
            }
            delay.delay_us(WAIT_STEP_US);
            waited += u64::from(WAIT_STEP_US);
        }
    }

    /// Submissions parked in the deferred buffer.
    #[must_use]
    pub fn deferred_jobs(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Software IDs currently owned by submitted jobs.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().swids.in_flight()
    }

    /// Register writes elided by the write cache so far.
    #[must_use]
    pub fn cached_writes(&self) -> u64 {
        self.state.lock().cache.skipped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, DeviceConfigBuilder};
    use crate::hal::NoClock;
    use crate::job::{Direction, IcvConfig, JobCallback, KeyRole, OpFlags};
    use crate::mode::Mode;
    use crate::sim::{HsmBehaviour, SimBuffer, SimEngine, SimMemory, SimParams};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;

    type SimDevice = Device<SimEngine, SimMemory>;

    fn device_with(params: SimParams, cfg: DeviceConfig) -> (SimEngine, SimDevice) {
        let sim = SimEngine::new(params);
        let dev = Device::new(sim.clone(), sim.memory(), NoClock, cfg).unwrap();
        (sim, dev)
    }

    fn device() -> (SimEngine, SimDevice) {
        device_with(SimParams::default(), DeviceConfig::default())
    }

    fn table(sim: &SimEngine, len: u32) -> Ddt<SimBuffer> {
        let mem = sim.memory();
        let phys = mem.reserve(len as usize);
        let mut ddt = Ddt::new(&mem, 2).unwrap();
        ddt.add(phys, len).unwrap();
        ddt
    }

    #[test]
    fn swid_table_wraps_and_skips_owned_ids() {
        let mut t = SwidTable::new();
        assert_eq!(t.allocate(1), Some(0));
        assert_eq!(t.allocate(2), Some(1));
        assert_eq!(t.resolve(0), Some(1));
        assert_eq!(t.resolve(0), None);

        for i in 0..254 {
            assert!(t.allocate(i).is_some());
        }
        // counter wrapped; 0 is free again, 1 is still held
        assert_eq!(t.allocate(99), Some(0));
        assert_eq!(t.allocate(100), None);
        assert_eq!(t.in_flight(), 256);
    }

    #[test]
    fn submission_writes_ctrl_last_and_key_size_once() {
        let (sim, dev) = device();
        let job = dev.open(Mode::AES_CBC, None).unwrap();
        dev.write_context(job, KeyRole::Cipher, &[0x11; 16], &[0x22; 16])
            .unwrap();
        let src = table(&sim, 64);
        let dst = table(&sim, 64);

        sim.clear_write_log();
        let params = EnqueueParams::new(&src, &dst);
        assert_eq!(dev.enqueue(job, &params), Ok(EnqueueStatus::Submitted));
        let log = sim.write_log();
        assert_eq!(log.last().map(|w| w.0), Some(CTRL));
        let key_sz: Vec<_> = log.iter().filter(|w| w.0 == KEY_SZ).collect();
        assert_eq!(key_sz.len(), 1);
        assert_eq!(KeySize(key_sz[0].1).size(), 16);
        assert_eq!(KeySize(key_sz[0].1).ciph_sel(), 1);
        assert_eq!(sim.reg(PROC_LEN), 64);
        assert_eq!(dev.job_state(job), Ok(JobState::Submitted));
        assert_eq!(dev.dequeue(job), Err(nb::Error::WouldBlock));

        sim.process_all();
        assert_eq!(dev.dequeue_all(), Ok(1));
        assert_eq!(dev.dequeue(job), Ok(()));

        sim.clear_write_log();
        dev.enqueue(job, &params).unwrap();
        assert!(sim.write_log().iter().all(|w| w.0 != KEY_SZ));
        // identical lengths and pointers were not rewritten
        assert!(sim.write_log().iter().all(|w| w.0 != PROC_LEN));
        assert!(dev.cached_writes() > 0);
    }

    #[test]
    fn auto_length_strips_plain_icv_on_decrypt() {
        let (sim, dev) = device();
        let job = dev.open(Mode::HMAC_SHA256, None).unwrap();
        dev.set_operation(job, Direction::Decrypt, IcvConfig::appended(32), OpFlags::empty())
            .unwrap();
        let src = table(&sim, 96);
        let dst = table(&sim, 96);
        dev.enqueue(job, &EnqueueParams::new(&src, &dst)).unwrap();
        assert_eq!(sim.reg(PROC_LEN), 64);
        assert_eq!(sim.reg(ICV_LEN), 32);

        sim.process_all();
        dev.dequeue_all().unwrap();
        dev.dequeue(job).unwrap();

        let encrypted_icv = IcvConfig {
            encrypt: true,
            ..IcvConfig::appended(32)
        };
        dev.set_operation(job, Direction::Decrypt, encrypted_icv, OpFlags::empty())
            .unwrap();
        dev.enqueue(job, &EnqueueParams::new(&src, &dst)).unwrap();
        assert_eq!(sim.reg(PROC_LEN), 96);

        let short = table(&sim, 16);
        sim.process_all();
        dev.dequeue_all().unwrap();
        dev.dequeue(job).unwrap();
        dev.set_operation(job, Direction::Decrypt, IcvConfig::appended(32), OpFlags::empty())
            .unwrap();
        assert_eq!(
            dev.enqueue(job, &EnqueueParams::new(&short, &dst)),
            Err(Error::InvalidSize)
        );
    }

    #[test]
    fn rejected_submissions_touch_no_registers() {
        let (sim, dev) = device_with(
            SimParams {
                fifo_depth: [1, 0, 0],
                max_msg_len: 0xff,
                ..SimParams::default()
            },
            DeviceConfigBuilder::new().buffer_on_full(false).build(),
        );
        let job = dev.open(Mode::NULL, None).unwrap();
        let other = dev.open(Mode::NULL, None).unwrap();
        let src = table(&sim, 64);
        let big = table(&sim, 0x100);

        sim.clear_write_log();
        let p1 = EnqueueParams::new(&src, &src).priority(Priority::P1);
        assert_eq!(dev.enqueue(job, &p1), Err(Error::FifoInactive));
        assert_eq!(
            dev.enqueue(job, &EnqueueParams::new(&big, &big)),
            Err(Error::InvalidSize)
        );
        assert!(sim.write_log().is_empty());

        dev.enqueue(job, &EnqueueParams::new(&src, &src)).unwrap();
        assert_eq!(dev.enqueue(job, &EnqueueParams::new(&src, &src)), Err(Error::Failed));
        sim.clear_write_log();
        assert_eq!(
            dev.enqueue(other, &EnqueueParams::new(&src, &src)),
            Err(Error::FifoFull)
        );
        assert!(sim.write_log().is_empty());
        assert_eq!(dev.job_state(other), Ok(JobState::Open));
    }

    #[test]
    fn deferred_jobs_replay_in_order_and_stop_when_full() {
        let (sim, dev) = device_with(
            SimParams {
                fifo_depth: [1, 0, 0],
                ..SimParams::default()
            },
            DeviceConfig::default(),
        );
        let src = table(&sim, 16);
        let jobs: Vec<_> = (0..4).map(|_| dev.open(Mode::NULL, None).unwrap()).collect();

        assert_eq!(
            dev.enqueue(jobs[0], &EnqueueParams::new(&src, &src)),
            Ok(EnqueueStatus::Submitted)
        );
        for &job in &jobs[1..] {
            assert_eq!(
                dev.enqueue(job, &EnqueueParams::new(&src, &src)),
                Ok(EnqueueStatus::Buffered)
            );
            assert_eq!(dev.job_state(job), Ok(JobState::Submitted));
        }
        assert_eq!(dev.deferred_jobs(), 3);

        for round in 1..4 {
            sim.process_all();
            assert_eq!(dev.dequeue_all(), Ok(1));
            // depth-1 FIFO: exactly one deferred job fits per drain
            assert_eq!(dev.deferred_jobs(), 3 - round);
        }
        sim.process_all();
        dev.dequeue_all().unwrap();

        let order: Vec<u32> = sim.history().iter().map(|c| c.ctrl.ctx_idx()).collect();
        let expected: Vec<u32> = jobs
            .iter()
            .map(|&j| u32::try_from(dev.job_context(j).unwrap()).unwrap())
            .collect();
        assert_eq!(order, expected);
        for &job in &jobs {
            assert_eq!(dev.dequeue(job), Ok(()));
        }
    }

    #[test]
    fn new_jobs_do_not_overtake_deferred_ones() {
        let (sim, dev) = device_with(
            SimParams {
                fifo_depth: [1, 0, 0],
                ..SimParams::default()
            },
            DeviceConfig::default(),
        );
        let src = table(&sim, 16);
        let a = dev.open(Mode::NULL, None).unwrap();
        let b = dev.open(Mode::NULL, None).unwrap();
        let c = dev.open(Mode::NULL, None).unwrap();
        let d = dev.open(Mode::NULL, None).unwrap();
        let params = EnqueueParams::new(&src, &src);

        assert_eq!(dev.enqueue(a, &params), Ok(EnqueueStatus::Submitted));
        assert_eq!(dev.enqueue(b, &params), Ok(EnqueueStatus::Buffered));

        // hardware has room again but the drain has not run yet
        sim.process_all();
        assert!(!FifoStat(sim.read32(FIFO_STAT)).cmd_full(Priority::P0));
        assert_eq!(dev.enqueue(c, &params), Ok(EnqueueStatus::Buffered));
        assert_eq!(dev.enqueue(d, &params.buffer_on_full(false)), Err(Error::FifoFull));
        assert_eq!(dev.job_state(d), Ok(JobState::Open));
        assert_eq!(sim.history().len(), 1);

        while dev.deferred_jobs() > 0 || dev.in_flight() > 0 {
            dev.dequeue_all().unwrap();
            sim.process_all();
        }
        dev.dequeue_all().unwrap();
        let order: Vec<u32> = sim.history().iter().map(|cmd| cmd.ctrl.ctx_idx()).collect();
        let expected: Vec<u32> = [a, b, c]
            .iter()
            .map(|&j| u32::try_from(dev.job_context(j).unwrap()).unwrap())
            .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn exhausted_software_ids_defer_the_job() {
        let (sim, dev) = device_with(
            SimParams {
                fifo_depth: [100, 100, 100],
                ..SimParams::default()
            },
            DeviceConfigBuilder::new().max_jobs(SWID_SLOTS + 1).build(),
        );
        let src = table(&sim, 16);
        let ctx = dev.request_context(None, 1).unwrap();
        let jobs: Vec<_> = (0..=SWID_SLOTS)
            .map(|_| dev.open(Mode::NULL, Some(ctx)).unwrap())
            .collect();

        for (i, &job) in jobs.iter().take(SWID_SLOTS).enumerate() {
            let priority = match i / 100 {
                0 => Priority::P0,
                1 => Priority::P1,
                _ => Priority::P2,
            };
            let params = EnqueueParams::new(&src, &src).priority(priority);
            assert_eq!(dev.enqueue(job, &params), Ok(EnqueueStatus::Submitted));
        }
        assert_eq!(dev.in_flight(), SWID_SLOTS);

        let last = jobs[SWID_SLOTS];
        let params = EnqueueParams::new(&src, &src).priority(Priority::P2);
        assert!(!FifoStat(sim.read32(FIFO_STAT)).cmd_full(Priority::P2));
        assert_eq!(dev.enqueue(last, &params), Ok(EnqueueStatus::Buffered));

        sim.process_all();
        assert!(dev.dequeue_all().unwrap() > 0);
        assert_eq!(dev.deferred_jobs(), 0);
        assert_eq!(dev.job_state(last), Ok(JobState::Submitted));
    }

    #[test]
    fn deferred_buffer_exhaustion_is_reported() {
        let (sim, dev) = device_with(
            SimParams {
                fifo_depth: [1, 0, 0],
                ..SimParams::default()
            },
            DeviceConfigBuilder::new().max_jobs(DEFERRED_JOB_SLOTS + 2).build(),
        );
        let src = table(&sim, 16);
        let first = dev.open(Mode::NULL, None).unwrap();
        dev.enqueue(first, &EnqueueParams::new(&src, &src)).unwrap();
        for _ in 0..DEFERRED_JOB_SLOTS {
            let job = dev.open(Mode::NULL, None).unwrap();
            assert_eq!(
                dev.enqueue(job, &EnqueueParams::new(&src, &src)),
                Ok(EnqueueStatus::Buffered)
            );
        }
        let last = dev.open(Mode::NULL, None).unwrap();
        assert_eq!(
            dev.enqueue(last, &EnqueueParams::new(&src, &src)),
            Err(Error::DeferredBufferFull)
        );
        assert_eq!(dev.job_state(last), Ok(JobState::Open));
    }

    #[test]
    fn hardware_result_codes_are_translated() {
        let (sim, dev) = device();
        let job = dev.open(Mode::HMAC_SHA256, None).unwrap();
        let src = table(&sim, 32);
        dev.enqueue(job, &EnqueueParams::new(&src, &src)).unwrap();
        sim.fail_next(ResultCode::IcvFail);
        sim.process_all();
        dev.dequeue_all().unwrap();
        assert_eq!(dev.job_state(job), Ok(JobState::Failed));
        assert_eq!(
            dev.dequeue(job),
            Err(nb::Error::Other(Error::AuthenticationFailed))
        );
        assert_eq!(dev.dequeue(job), Err(nb::Error::Other(Error::InvalidArgument)));
    }

    #[test]
    fn unknown_swid_aborts_the_batch() {
        let (sim, dev) = device();
        sim.inject_status(StatusWord::default().with_swid(0x55).bits());
        assert_eq!(dev.dequeue_all(), Err(Error::UnknownSoftwareId));
    }

    #[test]
    fn callbacks_run_unlocked() {
        let (sim, dev) = device();
        let dev = Arc::new(dev);
        let seen = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&dev);
        let counter = seen.clone();
        let callback: JobCallback = Arc::new(move |job, result| {
            assert!(result.is_ok());
            // re-entering the device would deadlock if the lock were held
            if let Some(dev) = weak.upgrade() {
                assert_eq!(dev.job_state(job), Ok(JobState::Completed));
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let src = table(&sim, 16);
        let a = dev.open(Mode::NULL, None).unwrap();
        let b = dev.open(Mode::NULL, None).unwrap();
        dev.set_callback(a, Some(callback.clone())).unwrap();
        dev.set_callback(b, Some(callback)).unwrap();
        dev.enqueue(a, &EnqueueParams::new(&src, &src)).unwrap();
        dev.enqueue(b, &EnqueueParams::new(&src, &src)).unwrap();
        sim.process_all();
        assert_eq!(dev.dequeue_all(), Ok(2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shared_mode_brackets_submission_with_semaphore() {
        let (sim, dev) = device_with(
            SimParams::default(),
            DeviceConfigBuilder::new().shared_mode(true).build(),
        );
        let job = dev.open(Mode::NULL, None).unwrap();
        let src = table(&sim, 16);
        dev.enqueue(job, &EnqueueParams::new(&src, &src)).unwrap();
        assert_eq!(sim.semaphore_grants(), 1);
        assert!(!sim.semaphore_held());

        sim.set_hsm(HsmBehaviour::NeverReady);
        sim.process_all();
        dev.dequeue_all().unwrap();
        dev.dequeue(job).unwrap();
        sim.clear_write_log();
        assert_eq!(dev.enqueue(job, &EnqueueParams::new(&src, &src)), Err(Error::Timeout));
        assert!(sim.write_log().iter().all(|w| w.0 != CTRL));
    }

    struct CountingDelay(u32);

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, _ns: u32) {
            self.0 += 1;
        }
    }

    #[test]
    fn wait_completes_or_times_out() {
        let (sim, dev) = device_with(
            SimParams {
                auto_complete: true,
                ..SimParams::default()
            },
            DeviceConfig::default(),
        );
        let src = table(&sim, 16);
        let job = dev.open(Mode::NULL, None).unwrap();
        dev.enqueue(job, &EnqueueParams::new(&src, &src)).unwrap();
        let mut delay = CountingDelay(0);
        assert_eq!(dev.wait(job, &mut delay, MicrosDurationU64::millis(1)), Ok(()));

        sim.set_auto_complete(false);
        dev.enqueue(job, &EnqueueParams::new(&src, &src)).unwrap();
        let mut delay = CountingDelay(0);
        assert_eq!(
            dev.wait(job, &mut delay, MicrosDurationU64::micros(100)),
            Err(Error::Timeout)
        );
        assert_eq!(delay.0, 10);
    }
}
