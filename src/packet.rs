//! Packet buffer and IPv4 header handling
//!
//! The pipeline works on one owned, contiguous buffer per packet,
//! starting at the outer IPv4 header. Decapsulation edits the buffer
//! in place: headers are cut out of the middle, trailers are trimmed,
//! and the IP header is rewritten (protocol, total length, checksum)
//! as outer layers come off.
//!
//! Also provides the internet checksum (RFC 1071) and the TCP/UDP
//! pseudo-header checksum used by the NAT-T transport-mode fixup.

use std::net::Ipv4Addr;
use std::ops::Range;

use crate::error::{Error, Result};

/// IP-in-IP encapsulation (RFC 2003)
pub const IPPROTO_IPIP: u8 = 4;
/// TCP
pub const IPPROTO_TCP: u8 = 6;
/// UDP
pub const IPPROTO_UDP: u8 = 17;
/// Encapsulating Security Payload (RFC 4303)
pub const IPPROTO_ESP: u8 = 50;
/// Authentication Header (RFC 4302)
pub const IPPROTO_AH: u8 = 51;
/// IP Payload Compression (RFC 3173)
pub const IPPROTO_COMP: u8 = 108;

/// Minimum IPv4 header length in bytes
pub const IPV4_MIN_HDR_LEN: usize = 20;

/// Largest possible IPv4 datagram, used to bound decompression
pub const IPV4_MAX_PACKET: usize = 65535;

/// Short protocol name for logs and SA identities
pub fn protocol_name(proto: u8) -> &'static str {
    match proto {
        IPPROTO_IPIP => "ipip",
        IPPROTO_TCP => "tcp",
        IPPROTO_UDP => "udp",
        IPPROTO_ESP => "esp",
        IPPROTO_AH => "ah",
        IPPROTO_COMP => "comp",
        _ => "proto",
    }
}

/// Is this one of the protocols the pipeline decapsulates?
pub fn is_ipsec_protocol(proto: u8) -> bool {
    matches!(proto, IPPROTO_AH | IPPROTO_ESP | IPPROTO_COMP)
}

/// Parsed view of an IPv4 header
///
/// A plain-data snapshot; mutation happens through [`PacketBuf`] so the
/// on-wire bytes and the checksum stay consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL * 4, options included)
    pub header_len: usize,
    /// Total datagram length from the header
    pub total_len: usize,
    /// Raw flags + fragment offset field
    pub frag_raw: u16,
    /// Time to live
    pub ttl: u8,
    /// Payload protocol
    pub protocol: u8,
    /// Header checksum as received
    pub checksum: u16,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse the header at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IPV4_MIN_HDR_LEN {
            return Err(Error::Internal(format!(
                "buffer too short for IP header: {} bytes",
                data.len()
            )));
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(Error::Internal(format!("not IPv4: version {}", version)));
        }

        let header_len = ((data[0] & 0x0f) as usize) << 2;
        if header_len < IPV4_MIN_HDR_LEN || data.len() < header_len {
            return Err(Error::Internal(format!(
                "bad IP header length: {}",
                header_len
            )));
        }

        Ok(Ipv4Header {
            header_len,
            total_len: u16::from_be_bytes([data[2], data[3]]) as usize,
            frag_raw: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Is this datagram a fragment (offset set or more-fragments flag)?
    pub fn is_fragment(&self) -> bool {
        // low 13 bits: offset; bit 13: MF
        self.frag_raw & 0x3fff != 0
    }
}

/// Owned packet buffer, starting at the outer IPv4 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuf {
    data: Vec<u8>,
}

impl PacketBuf {
    /// Wrap an owned datagram
    pub fn new(data: Vec<u8>) -> Self {
        PacketBuf { data }
    }

    /// Buffer length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Is the buffer empty?
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whole buffer as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Whole buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume, yielding the raw datagram
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Parse the IP header at the front of the buffer
    pub fn ip_header(&self) -> Result<Ipv4Header> {
        Ipv4Header::parse(&self.data)
    }

    /// Rewrite the protocol field (checksum is not touched; call
    /// [`PacketBuf::finalize_ip_checksum`] after a batch of edits)
    pub fn set_protocol(&mut self, proto: u8) {
        self.data[9] = proto;
    }

    /// Rewrite the total-length field
    pub fn set_total_len(&mut self, total_len: usize) {
        let n = total_len as u16;
        self.data[2..4].copy_from_slice(&n.to_be_bytes());
    }

    /// Recompute and store the IP header checksum
    pub fn finalize_ip_checksum(&mut self) -> Result<()> {
        let header_len = self.ip_header()?.header_len;
        self.data[10] = 0;
        self.data[11] = 0;
        let sum = checksum(&self.data[..header_len]);
        self.data[10..12].copy_from_slice(&sum.to_be_bytes());
        Ok(())
    }

    /// Cut `range` out of the middle of the buffer
    pub fn remove(&mut self, range: Range<usize>) {
        self.data.drain(range);
    }

    /// Trim the buffer down to `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Replace everything from `from` to the end with `tail`
    ///
    /// Used by IPCOMP decompression, where the payload grows.
    pub fn replace_tail(&mut self, from: usize, tail: &[u8]) {
        self.data.truncate(from);
        self.data.extend_from_slice(tail);
    }
}

/// Internet checksum (RFC 1071) over `data`
///
/// Returns the ones-complement of the ones-complement sum, in host
/// order ready for `to_be_bytes`.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

/// TCP/UDP checksum over the IPv4 pseudo-header and the segment
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum += proto as u32;
    sum += segment.len() as u32;
    !fold(sum_words(segment, sum))
}

fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        sum += u16::from_be_bytes([w[0], w[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Build an IPv4 header into a fresh 20-byte vector (no options)
///
/// Helper for the IPIP/tunnel tests and for synthesizing inner
/// packets; the checksum field is filled in.
pub fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
    payload_len: usize,
) -> Vec<u8> {
    let total_len = (IPV4_MIN_HDR_LEN + payload_len) as u16;
    let mut hdr = vec![0u8; IPV4_MIN_HDR_LEN];
    hdr[0] = 0x45; // version 4, IHL 5
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[8] = 64; // TTL
    hdr[9] = proto;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());
    let sum = checksum(&hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
    hdr
}
