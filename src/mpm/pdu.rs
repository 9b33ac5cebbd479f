// Licensed under the Apache-2.0 license

//! Hardware-visible chain descriptor (PDU) and key slot layouts.

use crate::error::{Error, Result};
use crate::hal::DmaBuffer;
use crate::regs::{CtrlWord, ResultCode};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const PDU_SIZE: usize = core::mem::size_of::<Pdu>();

/// Set by hardware in `status` once the descriptor has executed.
pub const PDU_STATUS_DONE: u32 = 1 << 31;
const PDU_STATUS_CODE_SHIFT: u32 = 24;

/// `flags` bit requesting on-demand completion tracking.
pub const PDU_FLAG_DEMAND: u32 = 1 << 0;

pub const NEXT_PTR_OFFSET: usize = core::mem::offset_of!(Pdu, next_ptr);
pub const STATUS_OFFSET: usize = core::mem::offset_of!(Pdu, status);

pub const KEY_SLOT_SIZE: usize = 128;
pub const KEY_CIPHER_OFFSET: usize = 0;
pub const KEY_CIPHER_MAX: usize = 32;
pub const KEY_IV_OFFSET: usize = 32;
pub const KEY_IV_MAX: usize = 16;
pub const KEY_HASH_OFFSET: usize = 64;
pub const KEY_HASH_MAX: usize = 64;

/// One chain descriptor, sixteen little-endian words.
#[derive(Debug, Default, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Pdu {
    pub src: U32,
    pub dst: U32,
    pub offset: U32,
    pub pre_aad_len: U32,
    pub post_aad_len: U32,
    pub proc_len: U32,
    pub icv_len: U32,
    pub icv_offset: U32,
    pub iv_offset: U32,
    pub aux_info: U32,
    pub ctrl: U32,
    pub key_ptr: U32,
    /// Bus address of the next descriptor, zero on the last one.
    pub next_ptr: U32,
    pub status: U32,
    pub flags: U32,
    pub reserved: U32,
}

impl Pdu {
    #[must_use]
    pub fn is_done(&self) -> bool {
        status_done(self.status.get())
    }

    #[must_use]
    pub fn ctrl(&self) -> CtrlWord {
        CtrlWord(self.ctrl.get())
    }

    /// Read descriptor `index` out of a pool buffer.
    ///
    /// # Errors
    /// `InvalidSize` if the descriptor lies outside the buffer.
    pub fn load<B: DmaBuffer + ?Sized>(buf: &B, index: usize) -> Result<Self> {
        let mut raw = [0u8; PDU_SIZE];
        let at = index.checked_mul(PDU_SIZE).ok_or(Error::InvalidSize)?;
        buf.read_at(at, &mut raw)?;
        Self::read_from_bytes(&raw).map_err(|_| Error::InvalidSize)
    }

    /// Write this descriptor to slot `index` of a pool buffer.
    ///
    /// # Errors
    /// `InvalidSize` if the descriptor lies outside the buffer.
    pub fn store<B: DmaBuffer + ?Sized>(&self, buf: &mut B, index: usize) -> Result<()> {
        let at = index.checked_mul(PDU_SIZE).ok_or(Error::InvalidSize)?;
        buf.write_at(at, self.as_bytes())
    }
}

#[must_use]
pub const fn status_done(status: u32) -> bool {
    status & PDU_STATUS_DONE != 0
}

#[must_use]
pub const fn status_result(status: u32) -> ResultCode {
    ResultCode::from_bits(status >> PDU_STATUS_CODE_SHIFT)
}

/// Status word hardware writes back for a finished descriptor.
#[must_use]
pub const fn done_status(code: ResultCode) -> u32 {
    PDU_STATUS_DONE | (code.bits() << PDU_STATUS_CODE_SHIFT)
}

/// Per-descriptor fields supplied by the caller of a chain insert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PduFields {
    pub ctrl: CtrlWord,
    pub src_offset: u32,
    pub dst_offset: u32,
    pub pre_aad_len: u32,
    pub post_aad_len: u32,
    /// `None` processes the whole source table.
    pub proc_len: Option<u32>,
    pub icv_len: u32,
    pub icv_offset: u32,
    pub iv_offset: Option<u32>,
    pub aux_info: u32,
}

impl PduFields {
    #[must_use]
    pub fn new(ctrl: CtrlWord) -> Self {
        Self {
            ctrl,
            ..Self::default()
        }
    }
}

fn slot_base(index: usize) -> Result<usize> {
    index.checked_mul(KEY_SLOT_SIZE).ok_or(Error::InvalidSize)
}

/// Fill the cipher half of key slot `index`. IV bytes are stored as
/// big-endian words, so `iv` must be a whole number of words. The hash half
/// is left untouched.
///
/// # Errors
/// `InvalidKeySize` or `InvalidIvSize` for oversized material.
pub fn write_cipher_key<B: DmaBuffer + ?Sized>(
    buf: &mut B,
    index: usize,
    key: &[u8],
    iv: &[u8],
) -> Result<()> {
    if key.len() > KEY_CIPHER_MAX {
        return Err(Error::InvalidKeySize);
    }
    if iv.len() > KEY_IV_MAX || iv.len() % 4 != 0 {
        return Err(Error::InvalidIvSize);
    }
    let base = slot_base(index)?;
    buf.write_at(base, &[0u8; KEY_HASH_OFFSET])?;
    buf.write_at(base + KEY_CIPHER_OFFSET, key)?;
    for (i, word) in iv.chunks_exact(4).enumerate() {
        let mut be = [0u8; 4];
        be.copy_from_slice(word);
        buf.write_u32(base + KEY_IV_OFFSET + i * 4, u32::from_be_bytes(be))?;
    }
    Ok(())
}

/// Fill the hash half of key slot `index`.
///
/// # Errors
/// `InvalidKeySize` for oversized material.
pub fn write_hash_key<B: DmaBuffer + ?Sized>(buf: &mut B, index: usize, key: &[u8]) -> Result<()> {
    if key.len() > KEY_HASH_MAX {
        return Err(Error::InvalidKeySize);
    }
    let base = slot_base(index)? + KEY_HASH_OFFSET;
    buf.write_at(base, &[0u8; KEY_HASH_MAX])?;
    buf.write_at(base, key)
}
