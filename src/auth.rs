//! Packet authentication
//!
//! Keyed digests over the authenticated region of AH and ESP packets,
//! compared against the trailing authenticator (ICV). Algorithms are
//! described as a pluggable (init, update, final, digest-length)
//! object: [`AuthKey::begin`] yields an incremental [`AuthCtx`] fed
//! region by region, finishing in a 96-bit truncated digest.
//!
//! Supported algorithms:
//!
//! - HMAC-MD5-96 (RFC 2403), 128-bit key
//! - HMAC-SHA-1-96 (RFC 2404), 160-bit key
//!
//! The comparison is constant-time. After a successful compare the
//! caller zeroizes its digest buffer before reuse.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Truncated authenticator length shared by both algorithms (96 bits)
pub const AUTH_DIGEST_LEN: usize = 12;

/// Keyed-digest algorithm for AH/ESP authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlgorithm {
    /// HMAC-MD5 truncated to 96 bits (RFC 2403)
    HmacMd5_96,
    /// HMAC-SHA-1 truncated to 96 bits (RFC 2404)
    HmacSha1_96,
}

impl AuthAlgorithm {
    /// Required key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            AuthAlgorithm::HmacMd5_96 => 16,
            AuthAlgorithm::HmacSha1_96 => 20,
        }
    }

    /// Truncated digest length in bytes
    pub fn digest_len(self) -> usize {
        AUTH_DIGEST_LEN
    }

    /// Algorithm name for logs
    pub fn name(self) -> &'static str {
        match self {
            AuthAlgorithm::HmacMd5_96 => "hmac-md5-96",
            AuthAlgorithm::HmacSha1_96 => "hmac-sha1-96",
        }
    }
}

/// Authentication algorithm plus its key
#[derive(Debug, Clone)]
pub struct AuthKey {
    alg: AuthAlgorithm,
    key: Vec<u8>,
}

impl AuthKey {
    /// Bind a key to an algorithm
    ///
    /// The key must be exactly the algorithm's native length (RFC
    /// 2403/2404 mandate fixed-size keys for the IPsec transforms).
    pub fn new(alg: AuthAlgorithm, key: Vec<u8>) -> Result<Self> {
        if key.len() != alg.key_len() {
            return Err(Error::Internal(format!(
                "{} key must be {} bytes, got {}",
                alg.name(),
                alg.key_len(),
                key.len()
            )));
        }
        Ok(AuthKey { alg, key })
    }

    /// The bound algorithm
    pub fn algorithm(&self) -> AuthAlgorithm {
        self.alg
    }

    /// Start an incremental digest
    pub fn begin(&self) -> AuthCtx {
        let inner = match self.alg {
            AuthAlgorithm::HmacMd5_96 => HmacCtx::Md5(
                Hmac::<Md5>::new_from_slice(&self.key).expect("HMAC can take key of any size"),
            ),
            AuthAlgorithm::HmacSha1_96 => HmacCtx::Sha1(
                Hmac::<Sha1>::new_from_slice(&self.key).expect("HMAC can take key of any size"),
            ),
        };
        AuthCtx { inner }
    }

    /// One-shot digest over a sequence of regions
    pub fn digest(&self, regions: &[&[u8]]) -> [u8; AUTH_DIGEST_LEN] {
        let mut ctx = self.begin();
        for r in regions {
            ctx.update(r);
        }
        ctx.finish()
    }
}

impl Drop for AuthKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

enum HmacCtx {
    Md5(Hmac<Md5>),
    Sha1(Hmac<Sha1>),
}

/// In-progress keyed digest
pub struct AuthCtx {
    inner: HmacCtx,
}

impl AuthCtx {
    /// Feed a region of the authenticated area
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HmacCtx::Md5(mac) => mac.update(data),
            HmacCtx::Sha1(mac) => mac.update(data),
        }
    }

    /// Finish, truncating to 96 bits
    pub fn finish(self) -> [u8; AUTH_DIGEST_LEN] {
        let mut out = [0u8; AUTH_DIGEST_LEN];
        match self.inner {
            HmacCtx::Md5(mac) => {
                let full = mac.finalize().into_bytes();
                out.copy_from_slice(&full[..AUTH_DIGEST_LEN]);
            }
            HmacCtx::Sha1(mac) => {
                let full = mac.finalize().into_bytes();
                out.copy_from_slice(&full[..AUTH_DIGEST_LEN]);
            }
        }
        out
    }
}

/// Constant-time authenticator comparison
pub fn verify(computed: &[u8], received: &[u8]) -> bool {
    computed.ct_eq(received).into()
}
