//! AH (Authentication Header), RFC 4302
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Header   |  Payload Len  |          RESERVED             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Security Parameters Index (SPI)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Sequence Number Field                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Integrity Check Value-ICV (variable)           |
//! ~                                                               ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Unlike ESP, AH authenticates the outer IP header too: the digest
//! covers the IP header with its mutable fields (DSCP/ECN, fragment
//! word, TTL, checksum) zeroed, the AH itself with a zeroed ICV, and
//! the payload. AH provides no confidentiality, so its "decrypt" step
//! is a pure header strip.

use crate::auth::{AuthKey, AUTH_DIGEST_LEN};
use crate::error::{Error, Result};
use crate::packet::IPPROTO_AH;
use crate::rcv::RecvContext;
use crate::sa::SecurityAssociation;
use crate::transform::Transform;

/// Fixed AH fields before the ICV
pub const AH_FIXED_LEN: usize = 12;

/// Total AH length for the 96-bit truncated authenticators
pub const AH_HMAC96_LEN: usize = AH_FIXED_LEN + AUTH_DIGEST_LEN;

/// Parsed AH header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhHeader {
    /// Protocol following AH
    pub next_header: u8,
    /// AH length in bytes, derived from the payload-length field
    pub length: usize,
    /// Security Parameters Index
    pub spi: u32,
    /// Sequence number
    pub sequence: u32,
}

impl AhHeader {
    /// Parse the header at the start of `data`
    ///
    /// The payload-length field counts 32-bit words minus 2; both
    /// supported authenticators truncate to 96 bits, so the only
    /// acceptable AH length is [`AH_HMAC96_LEN`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < AH_FIXED_LEN {
            return Err(Error::TruncatedPayload {
                needed: AH_FIXED_LEN,
                available: data.len(),
            });
        }

        let length = (data[1] as usize + 2) << 2;
        if length != AH_HMAC96_LEN {
            return Err(Error::TruncatedPayload {
                needed: AH_HMAC96_LEN,
                available: length,
            });
        }
        if data.len() < length {
            return Err(Error::TruncatedPayload {
                needed: length,
                available: data.len(),
            });
        }

        Ok(AhHeader {
            next_header: data[0],
            length,
            spi: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            sequence: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// AH transform
#[derive(Debug)]
pub struct AhTransform;

impl Transform for AhTransform {
    fn proto(&self) -> u8 {
        IPPROTO_AH
    }

    fn name(&self) -> &'static str {
        "ah"
    }

    fn check(&self, ctx: &mut RecvContext) -> Result<()> {
        let toff = ctx.iphlen;
        let pkt = ctx.packet_ref()?;
        let hdr = AhHeader::parse(&pkt.as_slice()[toff..])?;
        ctx.spi = hdr.spi;
        ctx.seq = hdr.sequence;
        ctx.next_header = hdr.next_header;
        Ok(())
    }

    fn setup_auth(&self, ctx: &mut RecvContext) -> Result<()> {
        // ICV sits inside the AH header, not at the packet tail.
        ctx.authenticator_off = Some(ctx.iphlen + AH_FIXED_LEN);
        ctx.auth_region = (0, ctx.packet_ref()?.len());
        Ok(())
    }

    fn calc_auth(&self, ctx: &mut RecvContext, auth: &AuthKey) -> Result<()> {
        let iphlen = ctx.iphlen;
        let toff = iphlen;
        let pkt = ctx.packet_ref()?;
        let data = pkt.as_slice();

        // IP header with mutable fields zeroed (RFC 4302 Section 3.3.3)
        let mut ip_hdr = data[..iphlen].to_vec();
        ip_hdr[1] = 0; // DSCP/ECN
        ip_hdr[6] = 0; // flags + fragment offset
        ip_hdr[7] = 0;
        ip_hdr[8] = 0; // TTL
        ip_hdr[10] = 0; // checksum
        ip_hdr[11] = 0;

        let zero_icv = [0u8; AUTH_DIGEST_LEN];
        ctx.hash = auth.digest(&[
            &ip_hdr,
            &data[toff..toff + AH_FIXED_LEN],
            &zero_icv,
            &data[toff + AH_HMAC96_LEN..],
        ]);
        Ok(())
    }

    fn decrypt(&self, ctx: &mut RecvContext, _sa: &SecurityAssociation) -> Result<()> {
        // Nothing to decrypt; peel the AH off and fix the IP length.
        let iphlen = ctx.iphlen;
        let pkt = ctx.packet_mut()?;
        let new_len = pkt.len() - AH_HMAC96_LEN;
        pkt.remove(iphlen..iphlen + AH_HMAC96_LEN);
        pkt.set_total_len(new_len);
        // next_header was captured during the header check
        Ok(())
    }
}

/// Assemble an AH packet body (header + ICV) for a payload
///
/// `ip_header` must be the final outer IP header (protocol field set
/// to AH, checksum finalized); its mutable fields are zeroed for the
/// digest exactly as the receiver will. Test fabrication helper.
pub fn build_ah(
    spi: u32,
    sequence: u32,
    next_header: u8,
    ip_header: &[u8],
    payload: &[u8],
    auth: &AuthKey,
) -> Vec<u8> {
    let mut ah = vec![0u8; AH_HMAC96_LEN];
    ah[0] = next_header;
    ah[1] = ((AH_HMAC96_LEN >> 2) - 2) as u8;
    ah[4..8].copy_from_slice(&spi.to_be_bytes());
    ah[8..12].copy_from_slice(&sequence.to_be_bytes());

    let mut ip_hdr = ip_header.to_vec();
    ip_hdr[1] = 0;
    ip_hdr[6] = 0;
    ip_hdr[7] = 0;
    ip_hdr[8] = 0;
    ip_hdr[10] = 0;
    ip_hdr[11] = 0;

    let icv = auth.digest(&[&ip_hdr, &ah[..AH_FIXED_LEN], &[0u8; AUTH_DIGEST_LEN], payload]);
    ah[AH_FIXED_LEN..].copy_from_slice(&icv);
    ah
}
