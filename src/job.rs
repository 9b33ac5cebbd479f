// Licensed under the Apache-2.0 license

//! Job handles: an opaque index bound to a context slot plus the per-job
//! soft state the command queue needs at submission time.

use crate::device::Device;
use crate::error::{Error, Result};
use crate::hal::{Clock, DmaAllocator, RegisterIo};
use crate::mode::Mode;
use crate::poll;
use crate::regs::{CtrlWord, CTX_CIPH_KEY, CTX_HASH_KEY};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Cipher key bytes that fit below the default IV position.
const CIPH_KEY_SHORT: usize = 32;

/// Opaque reference to an open job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(usize);

impl JobHandle {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Invoked once per completed submission, with the device lock released.
pub type JobCallback = Arc<dyn Fn(JobHandle, Result<()>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Idle; may be configured and submitted.
    Open,
    /// In a command FIFO or the deferred buffer.
    Submitted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Encrypt,
    Decrypt,
}

/// Which half of the context memory key material goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Cipher,
    Hash,
}

/// Integrity check value handling for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IcvConfig {
    pub len: u32,
    pub offset: u32,
    /// Append the ICV to the output rather than writing it at `offset`.
    pub append: bool,
    /// Copy the input ICV through instead of checking it.
    pub passthrough: bool,
    /// The ICV is itself encrypted.
    pub encrypt: bool,
}

impl IcvConfig {
    pub const NONE: IcvConfig = IcvConfig {
        len: 0,
        offset: 0,
        append: false,
        passthrough: false,
        encrypt: false,
    };

    #[must_use]
    pub const fn appended(len: u32) -> Self {
        Self {
            len,
            offset: 0,
            append: true,
            passthrough: false,
            encrypt: false,
        }
    }
}

bitflags! {
    /// Per-operation control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// Copy the AAD to the output.
        const AAD_COPY = 1 << 0;
        /// Hardware expands the raw key.
        const KEY_EXP = 1 << 1;
        /// Key comes from the secure key port, not context memory.
        const SEC_KEY = 1 << 2;
    }
}

#[derive(Clone)]
pub(crate) struct Job {
    pub(crate) ctx: usize,
    pub(crate) mode: Mode,
    pub(crate) ctrl: CtrlWord,
    pub(crate) icv_len: u32,
    pub(crate) icv_offset: u32,
    pub(crate) pre_aad_len: u32,
    pub(crate) post_aad_len: u32,
    pub(crate) ciph_key_len: usize,
    pub(crate) hash_key_len: usize,
    /// Key sizes still need programming before the next submission.
    pub(crate) first_use: bool,
    pub(crate) swid: Option<u8>,
    pub(crate) state: JobState,
    pub(crate) result: Option<Result<()>>,
    pub(crate) callback: Option<JobCallback>,
}

impl Job {
    fn new(ctx: usize, mode: Mode) -> Result<Self> {
        let idx = u32::try_from(ctx).map_err(|_| Error::InvalidContext)?;
        let ctrl = mode.apply(
            CtrlWord::default()
                .with_ctx_idx(idx)
                .with_msg_begin(1)
                .with_msg_end(1)
                .with_encrypt(1),
        )?;
        Ok(Self {
            ctx,
            mode,
            ctrl,
            icv_len: 0,
            icv_offset: 0,
            pre_aad_len: 0,
            post_aad_len: 0,
            ciph_key_len: 0,
            hash_key_len: 0,
            first_use: true,
            swid: None,
            state: JobState::Open,
            result: None,
            callback: None,
        })
    }

    /// A decrypt whose plaintext excludes a trailing, unencrypted ICV.
    pub(crate) fn strips_icv(&self) -> bool {
        self.ctrl.encrypt() == 0 && self.icv_len > 0 && self.ctrl.icv_enc() == 0
    }
}

/// IV position inside the cipher page; long (XTS) keys push it back.
const fn cipher_iv_offset(key_len: usize) -> usize {
    if key_len > CIPH_KEY_SHORT {
        2 * CIPH_KEY_SHORT
    } else {
        CIPH_KEY_SHORT
    }
}

pub(crate) struct JobTable {
    slots: Vec<Option<Job>>,
}

impl JobTable {
    pub(crate) fn new(max_jobs: usize) -> Self {
        let mut slots = Vec::with_capacity(max_jobs);
        slots.resize_with(max_jobs, || None);
        Self { slots }
    }

    fn insert(&mut self, job: Job) -> Result<JobHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.is_none())
            .ok_or(Error::NoMemory)?;
        *slot = Some(job);
        Ok(JobHandle(index))
    }

    pub(crate) fn get(&self, handle: JobHandle) -> Result<&Job> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn get_mut(&mut self, handle: JobHandle) -> Result<&mut Job> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidHandle)
    }

    /// Look up by raw index, as recorded in the software ID table.
    pub(crate) fn by_index_mut(&mut self, index: usize) -> Option<&mut Job> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    fn remove(&mut self, handle: JobHandle) -> Result<Job> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn write_window<R: RegisterIo + ?Sized>(regs: &R, base: u32, data: &[u8]) {
    let mut offset = base;
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        for (dst, src) in word.iter_mut().zip(chunk) {
            *dst = *src;
        }
        regs.write32(offset, u32::from_le_bytes(word));
        offset += 4;
    }
}

fn read_window<R: RegisterIo + ?Sized>(regs: &R, base: u32, out: &mut [u8]) {
    let mut offset = base;
    for chunk in out.chunks_mut(4) {
        let word = regs.read32(offset).to_le_bytes();
        for (dst, src) in chunk.iter_mut().zip(word) {
            *dst = src;
        }
        offset += 4;
    }
}

fn window_offset(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| Error::InvalidSize)
}

impl<R, A, C> Device<R, A, C>
where
    R: RegisterIo,
    A: DmaAllocator,
    C: Clock,
{
    /// Open a job for `mode`.
    ///
    /// With `ctx == None` a fresh context slot is reserved. With `Some(slot)`
    /// the job shares a reservation the caller already holds (for example
    /// one obtained through [`Device::request_context`]).
    ///
    /// # Errors
    /// - `InvalidAlgorithm`/`InvalidMode` for an unencodable mode
    /// - context pool errors from the reservation
    /// - `NoMemory` when every job slot is in use
    pub fn open(&self, mode: Mode, ctx: Option<usize>) -> Result<JobHandle> {
        mode.apply(CtrlWord::default())?;

        let mut state = self.state.lock();
        let contiguous = match ctx {
            Some(slot) => state.pool.run_length(slot).ok_or(Error::InvalidContext)? + 1,
            None => 1,
        };
        let slot = state.pool.request(ctx, contiguous, || {
            poll::request_shared_context(&self.regs, &self.clock, &self.cfg.poll)
        })?;

        let inserted = Job::new(slot, mode).and_then(|job| state.jobs.insert(job));
        if inserted.is_err() {
            // Undo the reservation; the open error is the one reported.
            if let Err(e) = state.pool.release(slot, |s| {
                poll::release_shared_context(&self.regs, &self.clock, &self.cfg.poll, s)
            }) {
                log::error!("context {slot} leaked rolling back open: {e}");
            }
        }
        let handle = inserted?;
        log::debug!("job {} opened on context {slot}", handle.0);
        Ok(handle)
    }

    /// Close `job` and drop its context reference.
    ///
    /// The context's hardware state is left as is.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown job, `Failed` while the job is still
    /// submitted, or the context release error. On a release error the job
    /// stays open and `close` can be retried.
    pub fn close(&self, job: JobHandle) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.jobs.get(job)?;
        if entry.state == JobState::Submitted {
            log::warn!("refusing to close in-flight job {}", job.0);
            return Err(Error::Failed);
        }
        let ctx = entry.ctx;
        state.pool.release(ctx, |s| {
            poll::release_shared_context(&self.regs, &self.clock, &self.cfg.poll, s)
        })?;
        state.jobs.remove(job)?;
        Ok(())
    }

    /// Open a second handle sharing `job`'s context and soft state.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown job, `NoMemory` when the job table is
    /// full, or a context pool error.
    pub fn clone_job(&self, job: JobHandle) -> Result<JobHandle> {
        let mut state = self.state.lock();
        let mut copy = state.jobs.get(job)?.clone();
        copy.swid = None;
        copy.state = JobState::Open;
        copy.result = None;

        let run = state.pool.run_length(copy.ctx).ok_or(Error::InvalidContext)?;
        state
            .pool
            .request(Some(copy.ctx), run + 1, || Err(Error::InvalidContext))?;
        let ctx = copy.ctx;
        match state.jobs.insert(copy) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Err(undo) = state.pool.release(ctx, |_| Ok(())) {
                    log::error!("context {ctx} leaked rolling back clone: {undo}");
                }
                Err(e)
            }
        }
    }

    pub fn set_callback(&self, job: JobHandle, callback: Option<JobCallback>) -> Result<()> {
        self.state.lock().jobs.get_mut(job)?.callback = callback;
        Ok(())
    }

    /// Load key (and, for the cipher role, IV) material into `job`'s
    /// context memory. An empty `iv` leaves the stored IV untouched.
    ///
    /// # Errors
    /// - `InvalidHandle` for an unknown job
    /// - `InvalidKeySize` if the key does not suit the mode or the page
    /// - `InvalidIvSize` if the IV length does not suit the mode
    pub fn write_context(&self, job: JobHandle, role: KeyRole, key: &[u8], iv: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let j = state.jobs.get_mut(job)?;
        let ctx = window_offset(j.ctx)?;
        match role {
            KeyRole::Cipher => {
                j.mode.check_cipher_key(key.len())?;
                if !iv.is_empty() && iv.len() != j.mode.iv_len() {
                    return Err(Error::InvalidIvSize);
                }
                let page = self.hw.ciph_page as usize;
                let iv_at = cipher_iv_offset(key.len());
                if iv_at + j.mode.iv_len() > page || key.len() > page {
                    return Err(Error::InvalidKeySize);
                }
                let base = CTX_CIPH_KEY + ctx * self.hw.ciph_page;
                write_window(&self.regs, base, key);
                if !iv.is_empty() {
                    write_window(&self.regs, base + window_offset(iv_at)?, iv);
                }
                j.ciph_key_len = key.len();
            }
            KeyRole::Hash => {
                if !iv.is_empty() {
                    return Err(Error::InvalidIvSize);
                }
                if key.len() > self.hw.hash_page as usize {
                    return Err(Error::InvalidKeySize);
                }
                write_window(&self.regs, CTX_HASH_KEY + ctx * self.hw.hash_page, key);
                j.hash_key_len = key.len();
            }
        }
        j.first_use = true;
        Ok(())
    }

    /// Copy the IV currently held in `job`'s context into `out`.
    ///
    /// Returns the number of bytes written (the mode's IV length).
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown job, `InvalidSize` if `out` is shorter
    /// than the IV.
    pub fn read_context_iv(&self, job: JobHandle, out: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let j = state.jobs.get(job)?;
        let len = j.mode.iv_len();
        let out = out.get_mut(..len).ok_or(Error::InvalidSize)?;
        let base = CTX_CIPH_KEY + window_offset(j.ctx)? * self.hw.ciph_page;
        read_window(&self.regs, base + window_offset(cipher_iv_offset(j.ciph_key_len))?, out);
        Ok(len)
    }

    /// Set direction, ICV handling and control bits for the next submission.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown job, `InvalidArgument` for an ICV on a
    /// mode that produces none.
    pub fn set_operation(
        &self,
        job: JobHandle,
        direction: Direction,
        icv: IcvConfig,
        flags: OpFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let j = state.jobs.get_mut(job)?;
        if icv.len > 0 && !(j.mode.has_hash() || j.mode.is_aead()) {
            return Err(Error::InvalidArgument);
        }
        j.ctrl = j
            .ctrl
            .with_encrypt(u32::from(direction == Direction::Encrypt))
            .with_icv_append(u32::from(icv.append))
            .with_icv_pt(u32::from(icv.passthrough))
            .with_icv_enc(u32::from(icv.encrypt))
            .with_aad_copy(u32::from(flags.contains(OpFlags::AAD_COPY)))
            .with_key_exp(u32::from(flags.contains(OpFlags::KEY_EXP)))
            .with_sec_key(u32::from(flags.contains(OpFlags::SEC_KEY)));
        j.icv_len = icv.len;
        j.icv_offset = icv.offset;
        Ok(())
    }

    /// Mark the next submission as the first and/or last part of a message.
    pub fn set_message_flags(&self, job: JobHandle, begin: bool, end: bool) -> Result<()> {
        let mut state = self.state.lock();
        let j = state.jobs.get_mut(job)?;
        j.ctrl = j
            .ctrl
            .with_msg_begin(u32::from(begin))
            .with_msg_end(u32::from(end));
        Ok(())
    }

    pub fn job_state(&self, job: JobHandle) -> Result<JobState> {
        Ok(self.state.lock().jobs.get(job)?.state)
    }

    /// Context slot `job` is bound to.
    pub fn job_context(&self, job: JobHandle) -> Result<usize> {
        Ok(self.state.lock().jobs.get(job)?.ctx)
    }

    #[must_use]
    pub fn open_jobs(&self) -> usize {
        self.state.lock().jobs.open_count()
    }
}
