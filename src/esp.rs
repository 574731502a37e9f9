//! ESP (Encapsulating Security Payload), RFC 4303
//!
//! # Packet format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |               Security Parameters Index (SPI)                 | ^Auth
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |                      Sequence Number                          | |erage
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ | ----
//! |                 IV (cipher-dependent length)                  | |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |
//! |                    Payload Data (variable)                    | |
//! ~                                                               ~ |
//! +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |
//! |               |     Padding (0-255 bytes)                     | |
//! +-+-+-+-+-+-+-+-+               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |
//! |                               |  Pad Length   | Next Header   | v
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |         Integrity Check Value-ICV   (variable)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! This is the separate-authenticator shape (HMAC trailer), not AEAD:
//! the authenticated region runs from the SPI through the end of the
//! ciphertext, and the ICV follows it. The receive order is fixed
//! (anti-replay check, authenticate, then decrypt) so a forged packet
//! never reaches the cipher.

use crate::auth::{AuthKey, AUTH_DIGEST_LEN};
use crate::cipher::CipherKey;
use crate::error::{Error, Result};
use crate::packet::IPPROTO_ESP;
use crate::rcv::RecvContext;
use crate::sa::SecurityAssociation;
use crate::transform::Transform;

/// Fixed ESP header length (SPI + sequence number)
pub const ESP_HEADER_LEN: usize = 8;

/// Parsed fixed portion of an ESP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspHeader {
    /// Security Parameters Index
    pub spi: u32,
    /// Sequence number
    pub sequence: u32,
}

impl EspHeader {
    /// Parse the fixed header at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ESP_HEADER_LEN {
            return Err(Error::TruncatedPayload {
                needed: ESP_HEADER_LEN,
                available: data.len(),
            });
        }
        Ok(EspHeader {
            spi: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// ESP transform
#[derive(Debug)]
pub struct EspTransform;

impl Transform for EspTransform {
    fn proto(&self) -> u8 {
        IPPROTO_ESP
    }

    fn name(&self) -> &'static str {
        "esp"
    }

    fn check(&self, ctx: &mut RecvContext) -> Result<()> {
        let toff = ctx.iphlen;
        let pkt = ctx.packet_ref()?;
        let hdr = EspHeader::parse(&pkt.as_slice()[toff..])?;
        ctx.spi = hdr.spi;
        ctx.seq = hdr.sequence;
        Ok(())
    }

    fn setup_auth(&self, ctx: &mut RecvContext) -> Result<()> {
        // Authenticated region: SPI through end of ciphertext; the ICV
        // trails it.
        let len = ctx.packet_ref()?.len();
        if len < ctx.iphlen + ESP_HEADER_LEN + AUTH_DIGEST_LEN {
            return Err(Error::TruncatedPayload {
                needed: ctx.iphlen + ESP_HEADER_LEN + AUTH_DIGEST_LEN,
                available: len,
            });
        }
        ctx.auth_region = (ctx.iphlen, len - AUTH_DIGEST_LEN);
        ctx.authenticator_off = Some(len - AUTH_DIGEST_LEN);
        Ok(())
    }

    fn calc_auth(&self, ctx: &mut RecvContext, auth: &AuthKey) -> Result<()> {
        let (start, end) = ctx.auth_region;
        let pkt = ctx.packet_ref()?;
        ctx.hash = auth.digest(&[&pkt.as_slice()[start..end]]);
        Ok(())
    }

    fn decrypt(&self, ctx: &mut RecvContext, sa: &SecurityAssociation) -> Result<()> {
        let null_cipher = CipherKey::null();
        let cipher = sa.cipher.as_ref().unwrap_or(&null_cipher);

        let iphlen = ctx.iphlen;
        let iv_len = cipher.algorithm().iv_len();
        let iv_start = iphlen + ESP_HEADER_LEN;
        let ct_start = iv_start + iv_len;
        let ct_end = ctx.packet_ref()?.len() - ctx.auth_len;

        // Need at least the two trailer bytes of plaintext.
        if ct_end < ct_start + 2 {
            return Err(Error::TruncatedPayload {
                needed: ct_start + 2 + ctx.auth_len,
                available: ctx.packet_ref()?.len(),
            });
        }
        let pkt = ctx.packet_mut()?;
        let data = pkt.as_mut_slice();
        let iv = data[iv_start..ct_start].to_vec();
        cipher.decrypt_in_place(&iv, &mut data[ct_start..ct_end])?;

        let pad_len = data[ct_end - 2] as usize;
        let next_header = data[ct_end - 1];
        let ct_len = ct_end - ct_start;
        if pad_len + 2 > ct_len {
            return Err(Error::DecryptFailed(format!(
                "pad length {} exceeds {} byte plaintext",
                pad_len, ct_len
            )));
        }

        // Strip: trailer + ICV off the tail, ESP header + IV out of the
        // middle, then fix the IP total length.
        let payload_len = ct_len - pad_len - 2;
        pkt.truncate(ct_start + payload_len);
        pkt.remove(iphlen..ct_start);
        pkt.set_total_len(iphlen + payload_len);

        ctx.next_header = next_header;
        Ok(())
    }
}

/// Assemble an ESP packet body (header, IV, ciphertext, ICV) around a
/// payload, producing the shape [`EspTransform::decrypt`] consumes
///
/// Padding follows the conventional 1, 2, 3… fill. Used by the tests
/// to fabricate wire packets; authentication is applied over
/// everything preceding the ICV.
pub fn build_esp(
    spi: u32,
    sequence: u32,
    iv: &[u8],
    payload: &[u8],
    next_header: u8,
    cipher: &CipherKey,
    auth: Option<&AuthKey>,
) -> Result<Vec<u8>> {
    let block = cipher.algorithm().block_len();
    let mut pad_len = (block - (payload.len() + 2) % block) % block;
    // RFC 4303 also aligns the trailer end to 4 bytes for the NULL cipher
    if block == 1 {
        pad_len = (4 - (payload.len() + 2) % 4) % 4;
    }

    let mut plaintext = Vec::with_capacity(payload.len() + pad_len + 2);
    plaintext.extend_from_slice(payload);
    for i in 1..=pad_len {
        plaintext.push(i as u8);
    }
    plaintext.push(pad_len as u8);
    plaintext.push(next_header);

    cipher.encrypt_in_place(iv, &mut plaintext)?;

    let mut out = Vec::new();
    out.extend_from_slice(&spi.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(iv);
    out.extend_from_slice(&plaintext);

    if let Some(auth) = auth {
        let icv = auth.digest(&[&out]);
        out.extend_from_slice(&icv);
    }
    Ok(out)
}
