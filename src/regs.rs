// Licensed under the Apache-2.0 license

//! Register map and bit-exact layouts of the engine's control words.
//!
//! Each packed word is a transparent `u32` newtype whose fields are reached
//! through generated accessors: `field()` extracts, `with_field(v)` returns a
//! copy with the field replaced (excess bits of `v` are discarded).

use bitflags::bitflags;

// Interrupt and FIFO control
pub const IRQ_EN: u32 = 0x0000;
pub const IRQ_STAT: u32 = 0x0004;
pub const IRQ_CTRL: u32 = 0x0008;
pub const FIFO_STAT: u32 = 0x000C;
pub const SDMA_BRST_SZ: u32 = 0x0010;

// Job submission window; CTRL is written last and launches the job
pub const SRC_PTR: u32 = 0x0020;
pub const DST_PTR: u32 = 0x0024;
pub const OFFSET: u32 = 0x0028;
pub const PRE_AAD_LEN: u32 = 0x002C;
pub const POST_AAD_LEN: u32 = 0x0030;
pub const PROC_LEN: u32 = 0x0034;
pub const ICV_LEN: u32 = 0x0038;
pub const ICV_OFFSET: u32 = 0x003C;
pub const IV_OFFSET: u32 = 0x0040;
pub const SW_CTRL: u32 = 0x0044;
pub const AUX_INFO: u32 = 0x0048;
pub const CTRL: u32 = 0x004C;

// Completion side
pub const STAT_POP: u32 = 0x0050;
pub const STATUS: u32 = 0x0054;
pub const STAT_WD_CTRL: u32 = 0x0080;

pub const KEY_SZ: u32 = 0x0100;

// Identification
pub const ID: u32 = 0x0180;
pub const CONFIG: u32 = 0x0184;
pub const CONFIG2: u32 = 0x0190;

// Shared-hardware context allocator and inter-port semaphore
pub const HSM_CTX_CMD: u32 = 0x01D0;
pub const HSM_CTX_STAT: u32 = 0x01D4;
pub const HSM_SEM_CMD: u32 = 0x01D8;
pub const HSM_SEM_STAT: u32 = 0x01DC;

// Chain (MPM) engine
pub const MPM_START: u32 = 0x0300;
pub const MPM_STATUS: u32 = 0x0304;

// Context memory windows
pub const CTX_CIPH_KEY: u32 = 0x4000;
pub const CTX_HASH_KEY: u32 = 0x8000;

/// First and last cacheable submission registers.
pub const CACHE_FIRST: u32 = SRC_PTR;
pub const CACHE_LAST: u32 = AUX_INFO;

/// Number of command FIFOs (priority classes) the register file can expose.
pub const PRIORITY_CLASSES: usize = 3;

bitflags! {
    /// Interrupt enable / status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        const CMD0 = 1 << 0;
        const CMD1 = 1 << 1;
        const CMD2 = 1 << 2;
        const STAT = 1 << 4;
        const STAT_WD = 1 << 12;
        const MPM_EOL = 1 << 16;
        const GLBL = 1 << 31;
    }
}

const fn field_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

macro_rules! reg_word {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $shift:literal, $width:literal; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            $(
                $(#[$fmeta])*
                #[must_use]
                pub const fn $field(self) -> u32 {
                    (self.0 >> $shift) & field_mask($width)
                }

                paste::paste! {
                    #[must_use]
                    pub const fn [<with_ $field>](self, value: u32) -> Self {
                        let mask = field_mask($width) << $shift;
                        Self((self.0 & !mask) | ((value << $shift) & mask))
                    }
                }
            )*

            #[must_use]
            pub const fn bits(self) -> u32 {
                self.0
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

reg_word! {
    /// Job control word; writing it to `CTRL` launches the job.
    CtrlWord {
        ciph_alg: 0, 4;
        hash_alg: 4, 4;
        ciph_mode: 8, 4;
        hash_mode: 12, 2;
        msg_begin: 14, 1;
        msg_end: 15, 1;
        ctx_idx: 16, 8;
        encrypt: 24, 1;
        aad_copy: 25, 1;
        /// ICV passes through to the output instead of being checked.
        icv_pt: 26, 1;
        icv_enc: 27, 1;
        icv_append: 28, 1;
        key_exp: 29, 1;
        sec_key: 31, 1;
    }
}

reg_word! {
    /// Software job ID and priority selector.
    SwCtrl {
        swid: 0, 8;
        priority: 30, 2;
    }
}

reg_word! {
    /// Head of the completion status FIFO.
    StatusWord {
        swid: 0, 8;
        ret_code: 24, 3;
    }
}

reg_word! {
    FifoStat {
        cmd0_cnt: 0, 7;
        cmd0_full: 7, 1;
        cmd1_cnt: 8, 7;
        cmd1_full: 15, 1;
        cmd2_cnt: 16, 7;
        cmd2_full: 23, 1;
        stat_cnt: 24, 7;
        stat_empty: 31, 1;
    }
}

impl FifoStat {
    /// Full flag of the command FIFO serving `priority`.
    #[must_use]
    pub const fn cmd_full(self, priority: Priority) -> bool {
        match priority {
            Priority::P0 => self.cmd0_full() != 0,
            Priority::P1 => self.cmd1_full() != 0,
            Priority::P2 => self.cmd2_full() != 0,
        }
    }

    #[must_use]
    pub const fn cmd_count(self, priority: Priority) -> u32 {
        match priority {
            Priority::P0 => self.cmd0_cnt(),
            Priority::P1 => self.cmd1_cnt(),
            Priority::P2 => self.cmd2_cnt(),
        }
    }
}

reg_word! {
    /// Key size programming word.
    KeySize {
        size: 0, 8;
        ctx_idx: 8, 8;
        hash_sel: 30, 1;
        ciph_sel: 31, 1;
    }
}

reg_word! {
    IdWord {
        minor: 0, 4;
        major: 4, 4;
        /// Multiple priority command FIFOs are implemented.
        qos: 8, 1;
        partial: 15, 1;
        project: 16, 16;
    }
}

reg_word! {
    ConfigWord {
        ctx_cnt: 0, 8;
        rc4_ctx_cnt: 8, 8;
        vspacc_cnt: 16, 4;
        ciph_page_log2: 20, 4;
        hash_page_log2: 24, 4;
        dma_type: 28, 2;
    }
}

reg_word! {
    Config2Word {
        cmd0_depth: 0, 8;
        cmd1_depth: 8, 8;
        cmd2_depth: 16, 8;
        stat_depth: 24, 8;
    }
}

reg_word! {
    /// Request word for the shared context allocator and the semaphore.
    HsmCmd {
        ctx_idx: 0, 8;
        release: 30, 1;
        request: 31, 1;
    }
}

reg_word! {
    HsmStat {
        ctx_idx: 0, 8;
        success: 30, 1;
        ready: 31, 1;
    }
}

reg_word! {
    IvOffset {
        offset: 0, 31;
        enable: 31, 1;
    }
}

reg_word! {
    /// Source/destination start offsets.
    OffsetWord {
        src: 0, 16;
        dst: 16, 16;
    }
}

reg_word! {
    MpmStatus {
        busy: 0, 1;
        eol: 1, 1;
    }
}

/// Command FIFO priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    P0,
    P1,
    P2,
}

impl Priority {
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
        }
    }

    /// Value of the `SwCtrl::priority` field.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
        }
    }

    #[must_use]
    pub const fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Priority::P0),
            1 => Some(Priority::P1),
            2 => Some(Priority::P2),
            _ => None,
        }
    }
}

/// DMA addressing mode reported by `CONFIG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaMode {
    Addr32,
    Addr64,
    Unknown(u8),
}

impl DmaMode {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => DmaMode::Addr32,
            2 => DmaMode::Addr64,
            // Field is two bits wide, so the cast is lossless.
            #[allow(clippy::cast_possible_truncation)]
            other => DmaMode::Unknown(other as u8),
        }
    }
}

/// Three-bit result code of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    IcvFail,
    MemoryError,
    BlockError,
    SecurityError,
    Unknown(u8),
}

impl ResultCode {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => ResultCode::Ok,
            1 => ResultCode::IcvFail,
            2 => ResultCode::MemoryError,
            3 => ResultCode::BlockError,
            4 => ResultCode::SecurityError,
            #[allow(clippy::cast_possible_truncation)]
            other => ResultCode::Unknown(other as u8),
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::IcvFail => 1,
            ResultCode::MemoryError => 2,
            ResultCode::BlockError => 3,
            ResultCode::SecurityError => 4,
            ResultCode::Unknown(v) => v as u32 & 0x7,
        }
    }

    /// Translate into the crate's error taxonomy.
    ///
    /// # Errors
    /// Every code other than `Ok` maps to the matching `Error`.
    pub const fn into_result(self) -> crate::error::Result<()> {
        use crate::error::Error;
        match self {
            ResultCode::Ok => Ok(()),
            ResultCode::IcvFail => Err(Error::AuthenticationFailed),
            ResultCode::MemoryError => Err(Error::MemoryError),
            ResultCode::BlockError => Err(Error::InvalidBlockAlignment),
            ResultCode::SecurityError | ResultCode::Unknown(_) => Err(Error::Failed),
        }
    }
}
