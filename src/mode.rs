// Licensed under the Apache-2.0 license

//! Register encodings of the cipher/hash algorithms and modes.
//!
//! Only the identifiers the control word needs live here; per-mode key
//! schedules and padding rules belong to the callers building on the core.

use crate::error::{Error, Result};
use crate::regs::CtrlWord;

macro_rules! reg_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant,)*
            Unknown(u8),
        }

        impl $name {
            #[must_use]
            pub const fn from_bits(bits: u8) -> Self {
                match bits {
                    $($value => $name::$variant,)*
                    other => $name::Unknown(other),
                }
            }

            /// Register value, or `None` for an unrecognised encoding.
            #[must_use]
            pub const fn bits(self) -> Option<u32> {
                match self {
                    $($name::$variant => Some($value),)*
                    $name::Unknown(_) => None,
                }
            }
        }
    };
}

reg_enum! {
    CipherAlg {
        Null = 0,
        Des = 1,
        Aes = 2,
        Rc4 = 3,
        Multi2 = 4,
        Kasumi = 5,
        Snow3g = 6,
        Zuc = 7,
        ChaCha20 = 8,
        Sm4 = 9,
    }
}

reg_enum! {
    CipherMode {
        Ecb = 0,
        Cbc = 1,
        Ctr = 2,
        Ccm = 3,
        Gcm = 5,
        Ofb = 7,
        Cfb = 8,
        F8 = 9,
        Xts = 10,
    }
}

reg_enum! {
    HashAlg {
        Null = 0,
        Md5 = 1,
        Sha1 = 2,
        Sha224 = 3,
        Sha256 = 4,
        Sha384 = 5,
        Sha512 = 6,
    }
}

reg_enum! {
    HashMode {
        Raw = 0,
        SslMac = 1,
        Hmac = 2,
    }
}

/// Complete algorithm selection for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub cipher: CipherAlg,
    pub cipher_mode: CipherMode,
    pub hash: HashAlg,
    pub hash_mode: HashMode,
}

impl Mode {
    pub const NULL: Mode = Mode::new(CipherAlg::Null, CipherMode::Ecb, HashAlg::Null, HashMode::Raw);
    pub const AES_ECB: Mode = Mode::cipher(CipherAlg::Aes, CipherMode::Ecb);
    pub const AES_CBC: Mode = Mode::cipher(CipherAlg::Aes, CipherMode::Cbc);
    pub const AES_CTR: Mode = Mode::cipher(CipherAlg::Aes, CipherMode::Ctr);
    pub const AES_GCM: Mode = Mode::cipher(CipherAlg::Aes, CipherMode::Gcm);
    pub const SHA256: Mode = Mode::hash(HashAlg::Sha256, HashMode::Raw);
    pub const HMAC_SHA256: Mode = Mode::hash(HashAlg::Sha256, HashMode::Hmac);

    #[must_use]
    pub const fn new(
        cipher: CipherAlg,
        cipher_mode: CipherMode,
        hash: HashAlg,
        hash_mode: HashMode,
    ) -> Self {
        Self {
            cipher,
            cipher_mode,
            hash,
            hash_mode,
        }
    }

    #[must_use]
    pub const fn cipher(cipher: CipherAlg, cipher_mode: CipherMode) -> Self {
        Self::new(cipher, cipher_mode, HashAlg::Null, HashMode::Raw)
    }

    #[must_use]
    pub const fn hash(hash: HashAlg, hash_mode: HashMode) -> Self {
        Self::new(CipherAlg::Null, CipherMode::Ecb, hash, hash_mode)
    }

    #[must_use]
    pub const fn has_cipher(&self) -> bool {
        !matches!(self.cipher, CipherAlg::Null)
    }

    #[must_use]
    pub const fn has_hash(&self) -> bool {
        !matches!(self.hash, HashAlg::Null)
    }

    /// Modes whose tag is produced by the cipher itself.
    #[must_use]
    pub const fn is_aead(&self) -> bool {
        matches!(self.cipher_mode, CipherMode::Gcm | CipherMode::Ccm) && self.has_cipher()
    }

    /// Cipher IV length in bytes (zero when the mode takes none).
    #[must_use]
    pub const fn iv_len(&self) -> usize {
        match (self.cipher, self.cipher_mode) {
            (CipherAlg::Null, _) | (_, CipherMode::Ecb) => 0,
            (CipherAlg::Des, _) => 8,
            _ => 16,
        }
    }

    /// Validate and fold the algorithm identifiers into a control word.
    ///
    /// # Errors
    /// `InvalidAlgorithm` or `InvalidMode` for unknown encodings.
    pub fn apply(&self, ctrl: CtrlWord) -> Result<CtrlWord> {
        let ciph_alg = self.cipher.bits().ok_or(Error::InvalidAlgorithm)?;
        let hash_alg = self.hash.bits().ok_or(Error::InvalidAlgorithm)?;
        let ciph_mode = self.cipher_mode.bits().ok_or(Error::InvalidMode)?;
        let hash_mode = self.hash_mode.bits().ok_or(Error::InvalidMode)?;
        Ok(ctrl
            .with_ciph_alg(ciph_alg)
            .with_hash_alg(hash_alg)
            .with_ciph_mode(ciph_mode)
            .with_hash_mode(hash_mode))
    }

    /// Check a key length against the selected cipher.
    ///
    /// # Errors
    /// `InvalidKeySize` if the cipher does not accept `len` bytes.
    pub const fn check_cipher_key(&self, len: usize) -> Result<()> {
        let ok = match (self.cipher, self.cipher_mode) {
            (CipherAlg::Null, _) => len == 0,
            (CipherAlg::Aes, CipherMode::Xts) => matches!(len, 32 | 64),
            (CipherAlg::Aes, _) => matches!(len, 16 | 24 | 32),
            (CipherAlg::Des, _) => matches!(len, 8 | 24),
            (CipherAlg::Sm4, _) => len == 16,
            (CipherAlg::ChaCha20, _) => len == 32,
            _ => len > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidKeySize)
        }
    }
}
