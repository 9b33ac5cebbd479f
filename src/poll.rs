// Licensed under the Apache-2.0 license

//! Bounded polling and the shared-hardware request/ready/success handshake.

use crate::error::{Error, Result};
use crate::hal::{Clock, Instant, RegisterIo};
use crate::regs::{HsmCmd, HsmStat, HSM_CTX_CMD, HSM_CTX_STAT, HSM_SEM_CMD, HSM_SEM_STAT};
use fugit::MicrosDurationU64;

/// Default iteration budget when no clock is available.
pub const DEFAULT_POLL_ITERATIONS: u32 = 100_000;

/// Limits applied to every polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLimits {
    /// Wall-clock limit, used when the platform clock is available.
    pub timeout: MicrosDurationU64,
    /// Iteration limit, used when it is not.
    pub iterations: u32,
}

impl Default for PollLimits {
    fn default() -> Self {
        Self {
            timeout: MicrosDurationU64::millis(10),
            iterations: DEFAULT_POLL_ITERATIONS,
        }
    }
}

/// Deadline for one polling loop.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    At(Instant),
    Iterations(u32),
}

impl Deadline {
    #[must_use]
    pub fn start<C: Clock + ?Sized>(clock: &C, limits: &PollLimits) -> Self {
        match clock.now() {
            Some(now) => Deadline::At(now + limits.timeout),
            None => Deadline::Iterations(limits.iterations),
        }
    }

    /// Account for one more poll. Returns `false` once the deadline passed.
    pub fn tick<C: Clock + ?Sized>(&mut self, clock: &C) -> bool {
        match self {
            Deadline::At(at) => clock.now().is_some_and(|now| now < *at),
            Deadline::Iterations(left) => {
                if *left == 0 {
                    false
                } else {
                    *left -= 1;
                    true
                }
            }
        }
    }
}

/// Issue `cmd` and poll `stat_reg` until the device reports ready.
///
/// # Errors
/// `Timeout` if the ready flag never rises, `Failed` if the device answers
/// without the success flag.
pub fn handshake<R, C>(
    regs: &R,
    clock: &C,
    limits: &PollLimits,
    cmd_reg: u32,
    stat_reg: u32,
    cmd: HsmCmd,
) -> Result<HsmStat>
where
    R: RegisterIo + ?Sized,
    C: Clock + ?Sized,
{
    regs.write32(cmd_reg, cmd.bits());
    let mut deadline = Deadline::start(clock, limits);
    loop {
        let stat = HsmStat(regs.read32(stat_reg));
        if stat.ready() != 0 {
            return if stat.success() != 0 {
                Ok(stat)
            } else {
                log::warn!("handshake on {cmd_reg:#x} refused: {:#010x}", stat.bits());
                Err(Error::Failed)
            };
        }
        if !deadline.tick(clock) {
            log::warn!("handshake on {cmd_reg:#x} timed out");
            return Err(Error::Timeout);
        }
        core::hint::spin_loop();
    }
}

/// Ask the device-side allocator for one context slot.
///
/// # Errors
/// See [`handshake`].
pub fn request_shared_context<R, C>(regs: &R, clock: &C, limits: &PollLimits) -> Result<usize>
where
    R: RegisterIo + ?Sized,
    C: Clock + ?Sized,
{
    let cmd = HsmCmd::default().with_request(1);
    let stat = handshake(regs, clock, limits, HSM_CTX_CMD, HSM_CTX_STAT, cmd)?;
    usize::try_from(stat.ctx_idx()).map_err(|_| Error::InvalidContext)
}

/// Hand a context slot back to the device-side allocator.
///
/// # Errors
/// See [`handshake`].
pub fn release_shared_context<R, C>(
    regs: &R,
    clock: &C,
    limits: &PollLimits,
    ctx: usize,
) -> Result<()>
where
    R: RegisterIo + ?Sized,
    C: Clock + ?Sized,
{
    let idx = u32::try_from(ctx).map_err(|_| Error::InvalidContext)?;
    let cmd = HsmCmd::default()
        .with_request(1)
        .with_release(1)
        .with_ctx_idx(idx);
    handshake(regs, clock, limits, HSM_CTX_CMD, HSM_CTX_STAT, cmd).map(|_| ())
}

/// Take the inter-port submission semaphore.
///
/// # Errors
/// See [`handshake`].
pub fn acquire_semaphore<R, C>(regs: &R, clock: &C, limits: &PollLimits) -> Result<()>
where
    R: RegisterIo + ?Sized,
    C: Clock + ?Sized,
{
    let cmd = HsmCmd::default().with_request(1);
    handshake(regs, clock, limits, HSM_SEM_CMD, HSM_SEM_STAT, cmd).map(|_| ())
}

/// Drop the inter-port submission semaphore.
///
/// # Errors
/// See [`handshake`].
pub fn release_semaphore<R, C>(regs: &R, clock: &C, limits: &PollLimits) -> Result<()>
where
    R: RegisterIo + ?Sized,
    C: Clock + ?Sized,
{
    let cmd = HsmCmd::default().with_request(1).with_release(1);
    handshake(regs, clock, limits, HSM_SEM_CMD, HSM_SEM_STAT, cmd).map(|_| ())
}
