//! NAT traversal (RFC 3948)
//!
//! ESP packets crossing a NAT arrive wrapped in UDP (port 4500). The
//! receive path strips that wrapping at entry, and for transport
//! mode repairs the inner TCP/UDP checksum after decapsulation,
//! since the NAT rewrote the addresses the original checksum covered.
//! Tunnel-mode packets need no repair: the inner datagram was computed
//! against the inner addresses, which the NAT never saw.

use crate::error::{Error, Result};
use crate::packet::{
    pseudo_header_checksum, PacketBuf, IPPROTO_TCP, IPPROTO_UDP,
};

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// Length of the non-IKE marker preceding ESP in the older
/// encapsulation style (two zero words)
pub const NON_IKE_MARKER_LEN: usize = 8;

/// ESP-in-UDP encapsulation style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NattType {
    /// Not UDP-encapsulated
    #[default]
    None,
    /// ESP directly after the UDP header (RFC 3948)
    EspInUdp,
    /// ESP after a non-IKE marker (draft-style encapsulation)
    EspInUdpNonIke,
}

impl NattType {
    /// Bytes to strip after the outer IP header: the UDP header plus
    /// any marker
    pub fn strip_len(self) -> usize {
        match self {
            NattType::None => 0,
            NattType::EspInUdp => UDP_HEADER_LEN,
            NattType::EspInUdpNonIke => UDP_HEADER_LEN + NON_IKE_MARKER_LEN,
        }
    }
}

/// UDP-encapsulation indication accompanying a received packet
///
/// Produced by whatever delivers frames to the pipeline (the UDP
/// socket layer knows it saw port 4500); the ports are kept for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpEncap {
    /// Encapsulation style
    pub kind: NattType,
    /// UDP source port of the wrapping datagram
    pub sport: u16,
    /// UDP destination port of the wrapping datagram
    pub dport: u16,
}

/// Repair the transport-layer checksum after NAT-T decapsulation
///
/// Transport mode only. TCP checksums are recomputed over the
/// pseudo-header; UDP checksums are zeroed, which IPv4 permits and
/// costs nothing. Anything else is left alone.
pub(crate) fn fixup_transport_checksum(pkt: &mut PacketBuf) -> Result<()> {
    let hdr = pkt.ip_header()?;
    let iphlen = hdr.header_len;
    let total = hdr.total_len.min(pkt.len());
    let (src, dst, proto) = (hdr.src, hdr.dst, hdr.protocol);

    match proto {
        IPPROTO_TCP => {
            // 20-byte minimum TCP header, checksum at offset 16
            if total < iphlen + 20 {
                return Err(Error::TruncatedPayload {
                    needed: iphlen + 20,
                    available: total,
                });
            }
            let data = pkt.as_mut_slice();
            data[iphlen + 16] = 0;
            data[iphlen + 17] = 0;
            let sum = pseudo_header_checksum(src, dst, IPPROTO_TCP, &data[iphlen..total]);
            data[iphlen + 16..iphlen + 18].copy_from_slice(&sum.to_be_bytes());
        }
        IPPROTO_UDP => {
            if total < iphlen + UDP_HEADER_LEN {
                return Err(Error::TruncatedPayload {
                    needed: iphlen + UDP_HEADER_LEN,
                    available: total,
                });
            }
            let data = pkt.as_mut_slice();
            // checksum at offset 6; zero means "not computed" in IPv4
            data[iphlen + 6] = 0;
            data[iphlen + 7] = 0;
        }
        _ => {}
    }
    Ok(())
}
