//! Error types for inbound decapsulation
//!
//! This module defines a unified error type for the receive pipeline.
//! Every failure is terminal for the packet being processed: the state
//! machine drops the packet, releases its resources and reports the
//! failure exactly once. Two kinds are additionally fatal to the
//! Security Association itself ([`Error::LifetimeExpired`] and
//! [`Error::ReplayRolled`]): they delete the whole SA chain.

use std::fmt;

use crate::sa::{SaId, SaState};

/// Result type for decapsulation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Inbound decapsulation errors
///
/// One variant per drop reason; [`Error::kind`] maps each variant onto
/// a stable [`DropKind`] used for per-reason counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Structurally unusable packet or violated internal invariant
    ///
    /// The catch-all for conditions that should never occur on a sane
    /// receive path: empty buffers, fragments, headers that contradict
    /// the buffer they sit in.
    Internal(String),

    /// Header protocol is not AH, ESP or IPCOMP where one was required
    BadProtocol(u8),

    /// Truncated or runt payload
    TruncatedPayload {
        /// Bytes required to go on
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    /// No Security Association for (destination, protocol, SPI)
    SaNotFound(SaId),

    /// The Security Association exists but is not MATURE
    SaNotLive(SaId, SaState),

    /// Inbound policy violation
    ///
    /// Peer address mismatch, broken chain order, NAT-T binding
    /// mismatch or inner addresses outside the tunnel subnets.
    PolicyMismatch(String),

    /// A hard lifetime limit was reached; the SA chain has been deleted
    LifetimeExpired(&'static str),

    /// Authentication required but unusable
    ///
    /// Unknown authentication algorithm on the SA, or the packet
    /// carries no authenticator where one is expected.
    AuthNotConfigured,

    /// Sequence number rejected by the anti-replay check (pre-authentication)
    ReplayRejected(u32),

    /// Computed digest does not match the packet's authenticator
    AuthFailed,

    /// Post-authentication replay rejection or wrapped sequence counter
    ///
    /// Reaching this after a successful authentication means a likely
    /// attack or a rolled 32-bit counter; it is fatal to the SA and
    /// deletes the whole chain.
    ReplayRolled(u32),

    /// Decryption produced an inconsistent ESP trailer
    DecryptFailed(String),

    /// 3DES ciphertext length is not a multiple of the cipher block
    BadBlocking {
        /// Offending ciphertext length
        len: usize,
    },

    /// ESP decapsulation failure (bad key or IV material, misaligned ciphertext)
    EspDecapFailed(String),

    /// IPCOMP decompression failed or was not permitted here
    IpcompFailed(String),
}

/// Stable drop-reason classification for counters and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DropKind {
    Internal,
    BadProtocol,
    TruncatedPayload,
    SaNotFound,
    SaNotLive,
    PolicyMismatch,
    LifetimeExpired,
    AuthNotConfigured,
    ReplayRejected,
    AuthFailed,
    ReplayRolled,
    DecryptFailed,
    BadBlocking,
    EspDecapFailed,
    IpcompFailed,
}

impl DropKind {
    /// All kinds, in counter order
    pub const ALL: [DropKind; 15] = [
        DropKind::Internal,
        DropKind::BadProtocol,
        DropKind::TruncatedPayload,
        DropKind::SaNotFound,
        DropKind::SaNotLive,
        DropKind::PolicyMismatch,
        DropKind::LifetimeExpired,
        DropKind::AuthNotConfigured,
        DropKind::ReplayRejected,
        DropKind::AuthFailed,
        DropKind::ReplayRolled,
        DropKind::DecryptFailed,
        DropKind::BadBlocking,
        DropKind::EspDecapFailed,
        DropKind::IpcompFailed,
    ];

    /// Short stable name, used as a metrics label
    pub fn as_str(self) -> &'static str {
        match self {
            DropKind::Internal => "internal",
            DropKind::BadProtocol => "bad_protocol",
            DropKind::TruncatedPayload => "truncated",
            DropKind::SaNotFound => "sa_not_found",
            DropKind::SaNotLive => "sa_not_live",
            DropKind::PolicyMismatch => "policy_mismatch",
            DropKind::LifetimeExpired => "lifetime_expired",
            DropKind::AuthNotConfigured => "auth_not_configured",
            DropKind::ReplayRejected => "replay_rejected",
            DropKind::AuthFailed => "auth_failed",
            DropKind::ReplayRolled => "replay_rolled",
            DropKind::DecryptFailed => "decrypt_failed",
            DropKind::BadBlocking => "bad_blocking",
            DropKind::EspDecapFailed => "esp_decap_failed",
            DropKind::IpcompFailed => "ipcomp_failed",
        }
    }
}

impl Error {
    /// Classify this error for per-reason counters
    pub fn kind(&self) -> DropKind {
        match self {
            Error::Internal(_) => DropKind::Internal,
            Error::BadProtocol(_) => DropKind::BadProtocol,
            Error::TruncatedPayload { .. } => DropKind::TruncatedPayload,
            Error::SaNotFound(_) => DropKind::SaNotFound,
            Error::SaNotLive(..) => DropKind::SaNotLive,
            Error::PolicyMismatch(_) => DropKind::PolicyMismatch,
            Error::LifetimeExpired(_) => DropKind::LifetimeExpired,
            Error::AuthNotConfigured => DropKind::AuthNotConfigured,
            Error::ReplayRejected(_) => DropKind::ReplayRejected,
            Error::AuthFailed => DropKind::AuthFailed,
            Error::ReplayRolled(_) => DropKind::ReplayRolled,
            Error::DecryptFailed(_) => DropKind::DecryptFailed,
            Error::BadBlocking { .. } => DropKind::BadBlocking,
            Error::EspDecapFailed(_) => DropKind::EspDecapFailed,
            Error::IpcompFailed(_) => DropKind::IpcompFailed,
        }
    }

    /// Does this failure delete the SA chain in addition to dropping the packet?
    pub fn is_fatal_to_sa(&self) -> bool {
        matches!(self, Error::LifetimeExpired(_) | Error::ReplayRolled(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "invariant violation: {}", msg),
            Error::BadProtocol(p) => write!(f, "not an IPsec protocol: {}", p),
            Error::TruncatedPayload { needed, available } => {
                write!(
                    f,
                    "truncated payload: need {} bytes, have {}",
                    needed, available
                )
            }
            Error::SaNotFound(said) => write!(f, "no SA for {}", said),
            Error::SaNotLive(said, state) => {
                write!(f, "SA {} is {:?}, cannot be used", said, state)
            }
            Error::PolicyMismatch(msg) => write!(f, "inbound policy violation: {}", msg),
            Error::LifetimeExpired(which) => {
                write!(f, "hard {} lifetime reached, SA expired", which)
            }
            Error::AuthNotConfigured => {
                write!(f, "authentication required but not usable")
            }
            Error::ReplayRejected(seq) => {
                write!(f, "replay check rejected sequence {}", seq)
            }
            Error::AuthFailed => write!(f, "authenticator mismatch"),
            Error::ReplayRolled(seq) => {
                write!(f, "replay window rolled at sequence {}, SA expired", seq)
            }
            Error::DecryptFailed(msg) => write!(f, "decryption failed: {}", msg),
            Error::BadBlocking { len } => {
                write!(f, "3DES ciphertext badly blocked: {} bytes", len)
            }
            Error::EspDecapFailed(msg) => write!(f, "ESP decapsulation failed: {}", msg),
            Error::IpcompFailed(msg) => write!(f, "IPCOMP failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
