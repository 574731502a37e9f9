//! IPCOMP (IP Payload Compression Protocol), RFC 3173
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Header   |     Flags     |  Compression Parameter Index  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload following the 4-byte header is a raw DEFLATE stream
//! (RFC 2394). The CPI plays the SPI's role for SA resolution.
//! IPCOMP carries no authenticator and no sequence number; when it
//! appears inside a protected chain, the surrounding AH/ESP layers
//! provide the integrity.
//!
//! Decompression output is capped at the maximum IPv4 datagram size;
//! a stream that inflates past that is hostile and the packet is
//! dropped.

use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::auth::AuthKey;
use crate::error::{Error, Result};
use crate::packet::{PacketBuf, IPPROTO_COMP, IPV4_MAX_PACKET};
use crate::rcv::RecvContext;
use crate::sa::SecurityAssociation;
use crate::transform::Transform;

/// IPCOMP header length
pub const IPCOMP_HEADER_LEN: usize = 4;

/// Well-known CPI for DEFLATE (RFC 3173 Section 3.3)
pub const CPI_DEFLATE: u16 = 2;

/// Parsed IPCOMP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcompHeader {
    /// Protocol of the decompressed payload
    pub next_header: u8,
    /// Compression Parameter Index
    pub cpi: u16,
}

impl IpcompHeader {
    /// Parse the header at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        // Header plus at least one byte of compressed payload.
        if data.len() <= IPCOMP_HEADER_LEN {
            return Err(Error::TruncatedPayload {
                needed: IPCOMP_HEADER_LEN + 1,
                available: data.len(),
            });
        }
        Ok(IpcompHeader {
            next_header: data[0],
            cpi: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// Inflate a raw DEFLATE stream, bounded by the IPv4 datagram limit
pub(crate) fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = DeflateDecoder::new(compressed).take(IPV4_MAX_PACKET as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::IpcompFailed(format!("inflate error: {}", e)))?;
    if out.len() > IPV4_MAX_PACKET {
        return Err(Error::IpcompFailed(
            "decompressed payload exceeds maximum datagram size".into(),
        ));
    }
    Ok(out)
}

/// Strip the IPCOMP header and decompress the payload in `pkt`
///
/// Fixes the IP total length and returns the inner protocol; the
/// caller rewrites the protocol field and checksum. Shared by the
/// transform path (IPCOMP met inside the decapsulation loop) and the
/// trailing-IPCOMP state.
pub(crate) fn decompress_in_packet(pkt: &mut PacketBuf, iphlen: usize) -> Result<u8> {
    let data = pkt.as_slice();
    let hdr = IpcompHeader::parse(&data[iphlen..])?;
    let plain = inflate(&data[iphlen + IPCOMP_HEADER_LEN..])?;

    if iphlen + plain.len() > IPV4_MAX_PACKET {
        return Err(Error::IpcompFailed(
            "decompressed datagram exceeds maximum size".into(),
        ));
    }
    pkt.replace_tail(iphlen, &plain);
    pkt.set_total_len(iphlen + plain.len());
    Ok(hdr.next_header)
}

/// IPCOMP transform
#[derive(Debug)]
pub struct IpcompTransform;

impl Transform for IpcompTransform {
    fn proto(&self) -> u8 {
        IPPROTO_COMP
    }

    fn name(&self) -> &'static str {
        "ipcomp"
    }

    fn check(&self, ctx: &mut RecvContext) -> Result<()> {
        let toff = ctx.iphlen;
        let pkt = ctx.packet_ref()?;
        let hdr = IpcompHeader::parse(&pkt.as_slice()[toff..])?;
        // The CPI stands in for the SPI; compression has no sequence.
        ctx.spi = hdr.cpi as u32;
        ctx.seq = 0;
        ctx.next_header = hdr.next_header;
        Ok(())
    }

    fn setup_auth(&self, _ctx: &mut RecvContext) -> Result<()> {
        // IPCOMP has no authenticator of its own.
        Ok(())
    }

    fn calc_auth(&self, _ctx: &mut RecvContext, _auth: &AuthKey) -> Result<()> {
        Ok(())
    }

    fn decrypt(&self, ctx: &mut RecvContext, _sa: &SecurityAssociation) -> Result<()> {
        let iphlen = ctx.iphlen;
        let next_header = {
            let pkt = ctx.packet_mut()?;
            decompress_in_packet(pkt, iphlen)?
        };
        ctx.next_header = next_header;
        Ok(())
    }
}

/// Compress a payload into an IPCOMP body (header + DEFLATE stream)
///
/// Test fabrication helper, the inverse of
/// [`IpcompTransform::decrypt`].
pub fn build_ipcomp(next_header: u8, cpi: u16, payload: &[u8]) -> Vec<u8> {
    use flate2::read::DeflateEncoder;
    use flate2::Compression;

    let mut compressed = Vec::new();
    DeflateEncoder::new(payload, Compression::default())
        .read_to_end(&mut compressed)
        .expect("in-memory deflate cannot fail");

    let mut out = vec![next_header, 0, 0, 0];
    out[2..4].copy_from_slice(&cpi.to_be_bytes());
    out.extend_from_slice(&compressed);
    out
}
