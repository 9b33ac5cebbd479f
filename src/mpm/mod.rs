// Licensed under the Apache-2.0 license

//! Chain (MPM) engine: batches many jobs into one hardware-walked list of
//! descriptors started by a single register write.
//!
//! Software keeps each chain as a list of pool indices; the hardware
//! next-pointers are computed from the pool base when a descriptor is
//! linked. Completions arrive either per chain (end-of-list interrupt, then
//! [`Device::mpm_poll`]) or, for descriptors flagged on-demand, as soon as
//! their own done bit is seen by [`Device::mpm_poll_on_demand`]. Both paths
//! claim an on-demand slot by taking it out of the table under the device
//! lock, so each callback fires exactly once.

pub mod chain;
pub mod pdu;

pub use chain::{ChainCallback, ChainDoneCallback, ChainState, MpmCompletion};
pub use pdu::{Pdu, PduFields};

use crate::config::MpmConfig;
use crate::ddt::Ddt;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::hal::{Clock, DmaAllocator, DmaBuffer, RegisterIo};
use crate::job::KeyRole;
use crate::regs::{IvOffset, OffsetWord, MPM_START};
use alloc::vec::Vec;
use chain::{Chain, Link, SlotCompletion};
use pdu::{
    status_done, status_result, write_cipher_key, write_hash_key, KEY_SLOT_SIZE, NEXT_PTR_OFFSET, PDU_FLAG_DEMAND,
    PDU_SIZE, STATUS_OFFSET,
};
use zerocopy::little_endian::U32;

/// Capacity of the on-demand completion table.
pub const ON_DEMAND_SLOTS: usize = 8;

/// Counters kept by the chain engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MpmStats {
    pub chains_started: u64,
    /// On-demand descriptors completed through the fast path.
    pub on_demand_hits: u64,
    /// On-demand descriptors the per-chain path reached first.
    pub missed_on_demand: u64,
    /// On-demand requests served as ordinary descriptors (table full).
    pub demand_downgrades: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PduState {
    Free,
    Allocated,
    Linked,
}

struct DemandEntry {
    pdu: usize,
    callback: ChainCallback,
}

enum Pending {
    One(ChainCallback, MpmCompletion),
    All(ChainDoneCallback, Vec<MpmCompletion>),
}

fn fire(pending: Vec<Pending>) {
    for p in pending {
        match p {
            Pending::One(cb, completion) => cb(completion),
            Pending::All(cb, completions) => cb(&completions),
        }
    }
}

/// One descriptor to append to the building chain.
pub struct MpmJob<'a, B: DmaBuffer> {
    pub pdu: usize,
    pub key: Option<usize>,
    pub src: &'a Ddt<B>,
    pub dst: &'a Ddt<B>,
    pub fields: PduFields,
    /// Ask for low-latency completion through the on-demand table.
    pub on_demand: bool,
    pub callback: Option<ChainCallback>,
}

pub(crate) struct MpmState<B> {
    pdu_buf: B,
    key_buf: B,
    pdu_base: u32,
    key_base: u32,
    pdu_free: Vec<usize>,
    pdu_state: Vec<PduState>,
    key_free: Vec<usize>,
    key_refs: Vec<u32>,
    chains: Vec<Chain>,
    building: usize,
    active: usize,
    running: Option<usize>,
    link_capacity: usize,
    demand: [Option<DemandEntry>; ON_DEMAND_SLOTS],
    demand_gen: [u32; ON_DEMAND_SLOTS],
    stats: MpmStats,
}

/// LIFO free list handing out the lowest index first.
fn free_list(count: usize) -> Vec<usize> {
    (0..count).rev().collect()
}

fn pool_base<B: DmaBuffer>(buf: &B) -> Result<u32> {
    let end = buf
        .phys()
        .checked_add(buf.len() as u64)
        .ok_or(Error::InvalidArgument)?;
    u32::try_from(end).map_err(|_| Error::InvalidArgument)?;
    u32::try_from(buf.phys()).map_err(|_| Error::InvalidArgument)
}

impl<B: DmaBuffer> MpmState<B> {
    pub(crate) fn new<A>(alloc: &A, cfg: MpmConfig) -> Result<Self>
    where
        A: DmaAllocator<Buffer = B> + ?Sized,
    {
        if cfg.pdus == 0 || cfg.keys == 0 || cfg.chains == 0 || cfg.link_capacity == 0 {
            return Err(Error::InvalidSize);
        }
        let pdu_bytes = cfg.pdus.checked_mul(PDU_SIZE).ok_or(Error::InvalidSize)?;
        let key_bytes = cfg.keys.checked_mul(KEY_SLOT_SIZE).ok_or(Error::InvalidSize)?;
        let pdu_buf = alloc.alloc_dma(pdu_bytes).map_err(|_| Error::NoMemory)?;
        let key_buf = alloc.alloc_dma(key_bytes).map_err(|_| Error::NoMemory)?;
        let pdu_base = pool_base(&pdu_buf)?;
        let key_base = pool_base(&key_buf)?;

        let mut chains = Vec::with_capacity(cfg.chains);
        chains.resize_with(cfg.chains, || Chain::new(cfg.link_capacity));

        log::info!(
            "chain engine: {} descriptors at {pdu_base:#x}, {} key slots, {} chains of {}",
            cfg.pdus,
            cfg.keys,
            cfg.chains,
            cfg.link_capacity
        );
        Ok(Self {
            pdu_buf,
            key_buf,
            pdu_base,
            key_base,
            pdu_free: free_list(cfg.pdus),
            pdu_state: alloc::vec![PduState::Free; cfg.pdus],
            key_free: free_list(cfg.keys),
            key_refs: alloc::vec![0; cfg.keys],
            chains,
            building: 0,
            active: 0,
            running: None,
            link_capacity: cfg.link_capacity,
            demand: core::array::from_fn(|_| None),
            demand_gen: [0; ON_DEMAND_SLOTS],
            stats: MpmStats::default(),
        })
    }

    fn pdu_phys(&self, index: usize) -> Result<u32> {
        let off = index
            .checked_mul(PDU_SIZE)
            .and_then(|o| u32::try_from(o).ok())
            .ok_or(Error::InvalidArgument)?;
        self.pdu_base.checked_add(off).ok_or(Error::InvalidArgument)
    }

    fn key_phys(&self, index: usize) -> Result<u32> {
        let off = index
            .checked_mul(KEY_SLOT_SIZE)
            .and_then(|o| u32::try_from(o).ok())
            .ok_or(Error::InvalidArgument)?;
        self.key_base.checked_add(off).ok_or(Error::InvalidArgument)
    }

    /// A next-pointer must name a descriptor inside the pool.
    fn check_link(&self, phys: u32) -> Result<()> {
        let start = u64::from(self.pdu_base);
        let end = start + self.pdu_buf.len() as u64;
        let p = u64::from(phys);
        if p < start || p >= end || (p - start) % PDU_SIZE as u64 != 0 {
            log::error!("descriptor link {phys:#x} outside pool {start:#x}..{end:#x}");
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn alloc_pdu(&mut self) -> Result<usize> {
        let index = self.pdu_free.pop().ok_or(Error::NoFreePdu)?;
        if let Some(s) = self.pdu_state.get_mut(index) {
            *s = PduState::Allocated;
        }
        Ok(index)
    }

    fn free_pdu(&mut self, index: usize) -> Result<()> {
        if self.pdu_state.get(index) != Some(&PduState::Allocated) {
            return Err(Error::InvalidArgument);
        }
        if let Some(s) = self.pdu_state.get_mut(index) {
            *s = PduState::Free;
        }
        self.pdu_free.push(index);
        Ok(())
    }

    fn alloc_key(&mut self) -> Result<usize> {
        let index = self.key_free.pop().ok_or(Error::NoFreeKey)?;
        if let Some(refs) = self.key_refs.get_mut(index) {
            *refs = 1;
        }
        Ok(index)
    }

    fn key_held(&self, index: usize) -> bool {
        self.key_refs.get(index).is_some_and(|r| *r > 0)
    }

    fn release_key(&mut self, index: usize) -> Result<()> {
        let refs = self
            .key_refs
            .get_mut(index)
            .filter(|r| **r > 0)
            .ok_or(Error::InvalidKey)?;
        *refs -= 1;
        if *refs == 0 {
            self.key_free.push(index);
        }
        Ok(())
    }

    /// Chain accepting inserts, opening a free one if needed.
    fn building_chain(&mut self) -> Result<usize> {
        if self
            .chains
            .get(self.building)
            .is_some_and(|c| c.state == ChainState::Building)
        {
            return Ok(self.building);
        }
        let (index, chain) = self
            .chains
            .iter_mut()
            .enumerate()
            .find(|(_, c)| c.state == ChainState::Free)
            .ok_or(Error::NoFreeChains)?;
        chain.state = ChainState::Building;
        self.building = index;
        Ok(index)
    }

    /// Close the building chain and start it if the hardware is idle.
    fn flush<R: RegisterIo + ?Sized>(
        &mut self,
        regs: &R,
        aggregate: Option<ChainDoneCallback>,
    ) -> Result<Option<usize>> {
        let index = self.building;
        let closed = match self.chains.get_mut(index) {
            Some(chain) if chain.state == ChainState::Building && chain.len() > 0 => {
                if aggregate.is_some() {
                    chain.aggregate = aggregate.clone();
                }
                chain.state = ChainState::Built;
                Some(index)
            }
            _ => None,
        };
        if closed.is_none() && aggregate.is_some() {
            log::warn!("chain callback given with no chain being built");
            return Err(Error::InvalidArgument);
        }
        self.start_next(regs)?;
        Ok(closed)
    }

    /// Hand the next built chain, scanning from the active index, to the
    /// hardware unless one is already running.
    fn start_next<R: RegisterIo + ?Sized>(&mut self, regs: &R) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let n = self.chains.len();
        for k in 0..n {
            let index = (self.active + k) % n;
            let Some(chain) = self.chains.get_mut(index) else {
                continue;
            };
            if chain.state != ChainState::Built {
                continue;
            }
            let first = chain.first_pdu().ok_or(Error::Failed)?;
            chain.state = ChainState::Running;
            self.running = Some(index);
            self.active = index;
            let phys = self.pdu_phys(first)?;
            regs.write32(MPM_START, phys);
            self.stats.chains_started += 1;
            log::debug!("chain {index} started at {phys:#x}");
            return Ok(());
        }
        Ok(())
    }

    fn handle_eol<R: RegisterIo + ?Sized>(&mut self, regs: &R) -> Result<()> {
        match self.running.take() {
            Some(index) => {
                if let Some(chain) = self.chains.get_mut(index) {
                    chain.state = ChainState::Done;
                }
                self.active = (index + 1) % self.chains.len();
            }
            None => log::warn!("end-of-list with no chain running"),
        }
        self.start_next(regs)
    }

    fn insert<R: RegisterIo + ?Sized>(
        &mut self,
        regs: &R,
        job: MpmJob<'_, B>,
        max_msg_len: u32,
    ) -> Result<usize> {
        if self.pdu_state.get(job.pdu) != Some(&PduState::Allocated) {
            return Err(Error::InvalidArgument);
        }
        let key_ptr = match job.key {
            Some(k) if !self.key_held(k) => return Err(Error::InvalidKey),
            Some(k) => self.key_phys(k)?,
            None => 0,
        };
        let f = &job.fields;
        let src = u32::try_from(job.src.phys()).map_err(|_| Error::InvalidArgument)?;
        let dst = u32::try_from(job.dst.phys()).map_err(|_| Error::InvalidArgument)?;
        let proc_len = match f.proc_len {
            Some(len) => len,
            None => u32::try_from(job.src.total_len()).map_err(|_| Error::InvalidSize)?,
        };
        if proc_len > max_msg_len || f.src_offset > 0xffff || f.dst_offset > 0xffff {
            return Err(Error::InvalidSize);
        }
        let iv_offset = match f.iv_offset {
            Some(o) => IvOffset::default().with_offset(o).with_enable(1),
            None => IvOffset::default(),
        };
        let phys = self.pdu_phys(job.pdu)?;
        self.check_link(phys)?;

        let index = loop {
            let index = self.building_chain()?;
            let full = self
                .chains
                .get(index)
                .is_some_and(|c| c.len() >= self.link_capacity);
            if !full {
                break index;
            }
            self.flush(regs, None)?;
        };

        let mut flags = 0;
        let completion = match (job.on_demand, job.callback) {
            (true, Some(callback)) => match self.demand.iter().position(Option::is_none) {
                Some(slot) => {
                    if let Some(entry) = self.demand.get_mut(slot) {
                        *entry = Some(DemandEntry {
                            pdu: job.pdu,
                            callback,
                        });
                    }
                    flags |= PDU_FLAG_DEMAND;
                    let generation = self.demand_gen.get(slot).copied().unwrap_or(0);
                    SlotCompletion::Demand { slot, generation }
                }
                None => {
                    self.stats.demand_downgrades += 1;
                    log::warn!("on-demand table full, descriptor {} downgraded", job.pdu);
                    SlotCompletion::Normal(Some(callback))
                }
            },
            (_, callback) => SlotCompletion::Normal(callback),
        };

        let pdu = Pdu {
            src: U32::new(src),
            dst: U32::new(dst),
            offset: U32::new(
                OffsetWord::default()
                    .with_src(f.src_offset)
                    .with_dst(f.dst_offset)
                    .bits(),
            ),
            pre_aad_len: U32::new(f.pre_aad_len),
            post_aad_len: U32::new(f.post_aad_len),
            proc_len: U32::new(proc_len),
            icv_len: U32::new(f.icv_len),
            icv_offset: U32::new(f.icv_offset),
            iv_offset: U32::new(iv_offset.bits()),
            aux_info: U32::new(f.aux_info),
            ctrl: U32::new(f.ctrl.bits()),
            key_ptr: U32::new(key_ptr),
            next_ptr: U32::new(0),
            status: U32::new(0),
            flags: U32::new(flags),
            reserved: U32::new(0),
        };
        pdu.store(&mut self.pdu_buf, job.pdu)?;

        if let Some(k) = job.key {
            if let Some(refs) = self.key_refs.get_mut(k) {
                *refs += 1;
            }
        }
        if let Some(state) = self.pdu_state.get_mut(job.pdu) {
            *state = PduState::Linked;
        }

        let chain = self.chains.get_mut(index).ok_or(Error::NoFreeChains)?;
        if let Some(prev) = chain.last_pdu() {
            let at = prev * PDU_SIZE + NEXT_PTR_OFFSET;
            self.pdu_buf.write_u32(at, phys)?;
        }
        chain.links.push(Link {
            pdu: job.pdu,
            key: job.key,
            completion,
        });
        Ok(index)
    }

    fn status_of(&self, pdu: usize) -> Result<u32> {
        self.pdu_buf.read_u32(pdu * PDU_SIZE + STATUS_OFFSET)
    }

    /// Move every `Done` chain to `Processing`, return its descriptors and
    /// key references to the pools and collect the callbacks to fire.
    fn collect_done(&mut self, pending: &mut Vec<Pending>) -> Result<(Vec<usize>, usize)> {
        let mut drained = Vec::new();
        let mut count = 0;
        for index in 0..self.chains.len() {
            let Some(chain) = self.chains.get_mut(index) else {
                continue;
            };
            if chain.state != ChainState::Done {
                continue;
            }
            chain.state = ChainState::Processing;
            let mut links = core::mem::take(&mut chain.links);
            let aggregate = chain.aggregate.take();
            let mut all = Vec::with_capacity(links.len());

            for link in links.drain(..) {
                let status = self.status_of(link.pdu)?;
                let completion = MpmCompletion {
                    pdu: link.pdu,
                    status,
                    result: status_result(status).into_result(),
                };
                match link.completion {
                    SlotCompletion::Demand { slot, generation } => {
                        if self.demand_gen.get(slot) == Some(&generation) {
                            if let Some(entry) = self.demand.get_mut(slot).and_then(Option::take) {
                                self.bump_generation(slot);
                                self.stats.missed_on_demand += 1;
                                pending.push(Pending::One(entry.callback, completion));
                            }
                        }
                    }
                    SlotCompletion::Normal(Some(cb)) if aggregate.is_none() => {
                        pending.push(Pending::One(cb, completion));
                    }
                    SlotCompletion::Normal(_) => {}
                }
                if let Some(k) = link.key {
                    self.release_key(k)?;
                }
                if let Some(state) = self.pdu_state.get_mut(link.pdu) {
                    *state = PduState::Free;
                    self.pdu_free.push(link.pdu);
                }
                all.push(completion);
                count += 1;
            }
            if let Some(cb) = aggregate {
                pending.push(Pending::All(cb, all));
            }
            // hand the emptied buffer back so the slot keeps its capacity
            if let Some(chain) = self.chains.get_mut(index) {
                chain.links = links;
            }
            drained.push(index);
        }
        Ok((drained, count))
    }

    fn bump_generation(&mut self, slot: usize) {
        if let Some(g) = self.demand_gen.get_mut(slot) {
            *g = g.wrapping_add(1);
        }
    }

    fn collect_on_demand(&mut self, pending: &mut Vec<Pending>) -> Result<usize> {
        let mut count = 0;
        for slot in 0..ON_DEMAND_SLOTS {
            let Some(pdu) = self.demand.get(slot).and_then(Option::as_ref).map(|e| e.pdu) else {
                continue;
            };
            let status = self.status_of(pdu)?;
            if !status_done(status) {
                continue;
            }
            if let Some(entry) = self.demand.get_mut(slot).and_then(Option::take) {
                self.bump_generation(slot);
                self.stats.on_demand_hits += 1;
                pending.push(Pending::One(
                    entry.callback,
                    MpmCompletion {
                        pdu,
                        status,
                        result: status_result(status).into_result(),
                    },
                ));
                count += 1;
            }
        }
        Ok(count)
    }
}

impl<R, A, C> Device<R, A, C>
where
    R: RegisterIo,
    A: DmaAllocator,
    C: Clock,
{
    fn with_mpm<T>(&self, f: impl FnOnce(&mut MpmState<A::Buffer>) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let mpm = state.mpm.as_mut().ok_or(Error::ModuleDisabled)?;
        f(mpm)
    }

    /// Take a descriptor from the pool.
    ///
    /// # Errors
    /// `ModuleDisabled` without a chain engine, `NoFreePdu` when exhausted.
    pub fn mpm_alloc_pdu(&self) -> Result<usize> {
        self.with_mpm(MpmState::alloc_pdu)
    }

    /// Return a descriptor that was never inserted. Inserted descriptors go
    /// back to the pool by themselves once their chain is drained.
    pub fn mpm_free_pdu(&self, pdu: usize) -> Result<()> {
        self.with_mpm(|m| m.free_pdu(pdu))
    }

    /// Take a key slot; the caller holds the first reference.
    pub fn mpm_alloc_key(&self) -> Result<usize> {
        self.with_mpm(MpmState::alloc_key)
    }

    /// Fill key slot `key` for `role`. Cipher material may carry an IV.
    ///
    /// # Errors
    /// `InvalidKey` for a slot not held, size errors for oversized material.
    pub fn mpm_write_key(&self, key: usize, role: KeyRole, material: &[u8], iv: &[u8]) -> Result<()> {
        self.with_mpm(|m| {
            if !m.key_held(key) {
                return Err(Error::InvalidKey);
            }
            match role {
                KeyRole::Cipher => write_cipher_key(&mut m.key_buf, key, material, iv),
                KeyRole::Hash if iv.is_empty() => write_hash_key(&mut m.key_buf, key, material),
                KeyRole::Hash => Err(Error::InvalidIvSize),
            }
        })
    }

    /// Drop the caller's reference; the slot is recycled once no inserted
    /// descriptor refers to it either.
    pub fn mpm_release_key(&self, key: usize) -> Result<()> {
        self.with_mpm(|m| m.release_key(key))
    }

    /// Append a descriptor to the building chain, flushing a full chain
    /// first. Returns the index of the chain the descriptor joined.
    ///
    /// # Errors
    /// - `ModuleDisabled` without a chain engine
    /// - `InvalidArgument` if `pdu` is not allocated or an address is unusable
    /// - `InvalidKey` if `key` is not held
    /// - `InvalidSize` for lengths the descriptor cannot express
    /// - `NoFreeChains` when every chain is busy
    pub fn mpm_insert(&self, job: MpmJob<'_, A::Buffer>) -> Result<usize> {
        let max = self.hw.max_msg_len;
        let regs = &self.regs;
        self.with_mpm(|m| m.insert(regs, job, max))
    }

    /// Close the building chain, optionally with one callback for the whole
    /// chain, and start it if the hardware is idle.
    ///
    /// Returns the closed chain, or `None` if nothing was being built.
    ///
    /// # Errors
    /// `ModuleDisabled` without MPM pools, `InvalidArgument` if `aggregate`
    /// is given while no chain is being built.
    pub fn mpm_flush(&self, aggregate: Option<ChainDoneCallback>) -> Result<Option<usize>> {
        let regs = &self.regs;
        self.with_mpm(|m| m.flush(regs, aggregate))
    }

    /// End-of-list: the running chain is done; start the next built one.
    pub fn mpm_handle_eol(&self) -> Result<()> {
        let regs = &self.regs;
        self.with_mpm(|m| m.handle_eol(regs))
    }

    /// Drain every finished chain, firing callbacks with the lock released.
    ///
    /// Returns the number of descriptors drained.
    pub fn mpm_poll(&self) -> Result<usize> {
        let mut pending = Vec::new();
        let (drained, count) = self.with_mpm(|m| m.collect_done(&mut pending))?;
        if drained.is_empty() {
            return Ok(0);
        }
        fire(pending);
        self.with_mpm(|m| {
            for index in drained {
                if let Some(chain) = m.chains.get_mut(index) {
                    chain.state = ChainState::Free;
                }
            }
            Ok(())
        })?;
        Ok(count)
    }

    /// Fast path: complete on-demand descriptors whose done bit is already
    /// set, ahead of their chain's end-of-list.
    pub fn mpm_poll_on_demand(&self) -> Result<usize> {
        let mut pending = Vec::new();
        let count = self.with_mpm(|m| m.collect_on_demand(&mut pending))?;
        fire(pending);
        Ok(count)
    }

    #[must_use]
    pub fn mpm_stats(&self) -> Option<MpmStats> {
        self.state.lock().mpm.as_ref().map(|m| m.stats)
    }

    #[must_use]
    pub fn mpm_chain_state(&self, chain: usize) -> Option<ChainState> {
        let state = self.state.lock();
        state.mpm.as_ref()?.chains.get(chain).map(|c| c.state)
    }

    /// Number of descriptors linked into `chain`.
    #[must_use]
    pub fn mpm_chain_len(&self, chain: usize) -> Option<usize> {
        let state = self.state.lock();
        state.mpm.as_ref()?.chains.get(chain).map(Chain::len)
    }

    #[must_use]
    pub fn mpm_running_chain(&self) -> Option<usize> {
        self.state.lock().mpm.as_ref()?.running
    }
}
