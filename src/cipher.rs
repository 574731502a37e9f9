//! ESP bulk ciphers
//!
//! CBC-mode block ciphers for the ESP payload, decrypting in place.
//! ESP here is authenticate-then-decrypt with a separate HMAC
//! authenticator (see [`crate::auth`]); these ciphers provide
//! confidentiality only.
//!
//! Supported:
//!
//! - NULL (RFC 2410): authentication-only ESP
//! - 3DES-CBC (RFC 2451): 192-bit key, 8-byte blocks
//! - AES-CBC (RFC 3602): 128/192/256-bit key, 16-byte blocks
//!
//! A ciphertext that is not a whole number of blocks cannot have come
//! from a conforming sender; for 3DES that condition is reported with
//! its own error kind, matching the per-transform failure taxonomy.

use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;
use zeroize::Zeroize;

use crate::error::{Error, Result};

type TdesCbcEnc = cbc::Encryptor<TdesEde3>;
type TdesCbcDec = cbc::Decryptor<TdesEde3>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// ESP bulk cipher algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EspCipher {
    /// NULL cipher: authentication-only ESP (RFC 2410)
    Null,
    /// 3DES in CBC mode (RFC 2451)
    TripleDesCbc,
    /// AES in CBC mode, key length 16/24/32 (RFC 3602)
    AesCbc,
}

impl EspCipher {
    /// IV length in bytes carried after the ESP header
    pub fn iv_len(self) -> usize {
        match self {
            EspCipher::Null => 0,
            EspCipher::TripleDesCbc => 8,
            EspCipher::AesCbc => 16,
        }
    }

    /// Cipher block length in bytes
    pub fn block_len(self) -> usize {
        match self {
            EspCipher::Null => 1,
            EspCipher::TripleDesCbc => 8,
            EspCipher::AesCbc => 16,
        }
    }

    /// Is `len` an acceptable key length?
    pub fn key_len_ok(self, len: usize) -> bool {
        match self {
            EspCipher::Null => len == 0,
            EspCipher::TripleDesCbc => len == 24,
            EspCipher::AesCbc => matches!(len, 16 | 24 | 32),
        }
    }

    /// Algorithm name for logs
    pub fn name(self) -> &'static str {
        match self {
            EspCipher::Null => "null",
            EspCipher::TripleDesCbc => "3des-cbc",
            EspCipher::AesCbc => "aes-cbc",
        }
    }
}

/// Bulk cipher algorithm plus its key
#[derive(Debug, Clone)]
pub struct CipherKey {
    alg: EspCipher,
    key: Vec<u8>,
}

impl CipherKey {
    /// Bind a key to an algorithm, validating its length
    pub fn new(alg: EspCipher, key: Vec<u8>) -> Result<Self> {
        if !alg.key_len_ok(key.len()) {
            return Err(Error::Internal(format!(
                "{} rejects key length {}",
                alg.name(),
                key.len()
            )));
        }
        Ok(CipherKey { alg, key })
    }

    /// NULL cipher (no key)
    pub fn null() -> Self {
        CipherKey {
            alg: EspCipher::Null,
            key: Vec::new(),
        }
    }

    /// The bound algorithm
    pub fn algorithm(&self) -> EspCipher {
        self.alg
    }

    /// Check ciphertext blocking before touching the cipher
    ///
    /// A misaligned 3DES ciphertext gets the 3DES-specific kind; any
    /// other cipher reports a generic ESP decapsulation failure.
    pub fn check_blocking(&self, len: usize) -> Result<()> {
        let block = self.alg.block_len();
        if len % block != 0 {
            return match self.alg {
                EspCipher::TripleDesCbc => Err(Error::BadBlocking { len }),
                _ => Err(Error::EspDecapFailed(format!(
                    "ciphertext length {} not a multiple of {}",
                    len, block
                ))),
            };
        }
        Ok(())
    }

    /// Decrypt `data` in place with the given IV
    pub fn decrypt_in_place(&self, iv: &[u8], data: &mut [u8]) -> Result<()> {
        self.check_blocking(data.len())?;
        match self.alg {
            EspCipher::Null => Ok(()),
            EspCipher::TripleDesCbc => {
                let dec = TdesCbcDec::new_from_slices(&self.key, iv)
                    .map_err(|_| Error::EspDecapFailed("bad 3DES key/IV material".into()))?;
                dec.decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|_| Error::EspDecapFailed("3DES decrypt failed".into()))?;
                Ok(())
            }
            EspCipher::AesCbc => {
                match self.key.len() {
                    16 => Aes128CbcDec::new_from_slices(&self.key, iv)
                        .map_err(|_| Error::EspDecapFailed("bad AES key/IV material".into()))?
                        .decrypt_padded_mut::<NoPadding>(data),
                    24 => Aes192CbcDec::new_from_slices(&self.key, iv)
                        .map_err(|_| Error::EspDecapFailed("bad AES key/IV material".into()))?
                        .decrypt_padded_mut::<NoPadding>(data),
                    _ => Aes256CbcDec::new_from_slices(&self.key, iv)
                        .map_err(|_| Error::EspDecapFailed("bad AES key/IV material".into()))?
                        .decrypt_padded_mut::<NoPadding>(data),
                }
                .map_err(|_| Error::EspDecapFailed("AES decrypt failed".into()))?;
                Ok(())
            }
        }
    }

    /// Encrypt `data` in place with the given IV
    ///
    /// The pipeline never encrypts; this exists because a block cipher
    /// is two-sided and the tests must fabricate valid packets.
    pub fn encrypt_in_place(&self, iv: &[u8], data: &mut [u8]) -> Result<()> {
        self.check_blocking(data.len())?;
        let len = data.len();
        match self.alg {
            EspCipher::Null => Ok(()),
            EspCipher::TripleDesCbc => {
                let enc = TdesCbcEnc::new_from_slices(&self.key, iv)
                    .map_err(|_| Error::EspDecapFailed("bad 3DES key/IV material".into()))?;
                enc.encrypt_padded_mut::<NoPadding>(data, len)
                    .map_err(|_| Error::EspDecapFailed("3DES encrypt failed".into()))?;
                Ok(())
            }
            EspCipher::AesCbc => {
                match self.key.len() {
                    16 => Aes128CbcEnc::new_from_slices(&self.key, iv)
                        .map_err(|_| Error::EspDecapFailed("bad AES key/IV material".into()))?
                        .encrypt_padded_mut::<NoPadding>(data, len),
                    24 => Aes192CbcEnc::new_from_slices(&self.key, iv)
                        .map_err(|_| Error::EspDecapFailed("bad AES key/IV material".into()))?
                        .encrypt_padded_mut::<NoPadding>(data, len),
                    _ => Aes256CbcEnc::new_from_slices(&self.key, iv)
                        .map_err(|_| Error::EspDecapFailed("bad AES key/IV material".into()))?
                        .encrypt_padded_mut::<NoPadding>(data, len),
                }
                .map_err(|_| Error::EspDecapFailed("AES encrypt failed".into()))?;
                Ok(())
            }
        }
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
