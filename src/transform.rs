//! Per-protocol transform interface
//!
//! One implementation per IPsec protocol (AH, ESP, IPCOMP), selected
//! by the state machine when it meets the corresponding header. The
//! five operations cover everything protocol-specific about one
//! decapsulation round; the driver sequences them and owns SA lookup,
//! policy, replay and lifetime handling, which are protocol-neutral.

use std::fmt;

use crate::auth::AuthKey;
use crate::error::Result;
use crate::packet::{IPPROTO_AH, IPPROTO_COMP, IPPROTO_ESP};
use crate::rcv::RecvContext;
use crate::sa::SecurityAssociation;

/// Protocol-specific decapsulation operations
pub trait Transform: Send + Sync + fmt::Debug {
    /// Protocol number this transform handles
    fn proto(&self) -> u8;

    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Validate the header's length and shape; extract the SPI and the
    /// claimed sequence number into the context
    fn check(&self, ctx: &mut RecvContext) -> Result<()>;

    /// Locate the authenticator and the authenticated region
    ///
    /// Called only when the selected SA is configured for
    /// authentication.
    fn setup_auth(&self, ctx: &mut RecvContext) -> Result<()>;

    /// Compute the keyed digest over the authenticated region into the
    /// context's digest buffer
    fn calc_auth(&self, ctx: &mut RecvContext, auth: &AuthKey) -> Result<()>;

    /// Remove this protocol's protection in place
    ///
    /// Decrypts (a no-op for AH, decompression for IPCOMP), strips the
    /// protocol header and trailer from the buffer, fixes the IP total
    /// length, and records the recovered inner protocol.
    fn decrypt(&self, ctx: &mut RecvContext, sa: &SecurityAssociation) -> Result<()>;

    /// The inner protocol recovered by this round
    ///
    /// Only meaningful after [`Transform::decrypt`]: for ESP the next
    /// header lives in the encrypted trailer.
    fn next_header(&self, ctx: &RecvContext) -> u8 {
        ctx.next_header
    }
}

/// Select the transform for a protocol number
pub fn for_protocol(proto: u8) -> Option<&'static dyn Transform> {
    match proto {
        IPPROTO_ESP => Some(&crate::esp::EspTransform),
        IPPROTO_AH => Some(&crate::ah::AhTransform),
        IPPROTO_COMP => Some(&crate::ipcomp::IpcompTransform),
        _ => None,
    }
}
