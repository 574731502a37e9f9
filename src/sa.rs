//! Security Association records
//!
//! A Security Association (SA) is the keyed, stateful context
//! governing one direction of one cryptographic relationship between
//! peers. Inbound SAs are identified by (destination address,
//! protocol, SPI), see [`SaId`], and carry the authentication and
//! encryption keys, the anti-replay window, lifetime counters with
//! soft/hard limits, and the inbound policy the packet must satisfy:
//! the bound peer address, the NAT-T encapsulation binding, the tunnel
//! subnets, and the link to the next SA of a nested decapsulation
//! chain.
//!
//! Lifecycle: LARVAL (keying in progress) → MATURE (usable) → DEAD.
//! An SA that is not MATURE is never used to process a packet.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::auth::AuthKey;
use crate::cipher::CipherKey;
use crate::nat::NattType;
use crate::packet::protocol_name;
use crate::replay::ReplayWindow;

/// Identity of an inbound Security Association
///
/// The SPI alone is not unique; the destination address and protocol
/// disambiguate (RFC 4301 Section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaId {
    /// Destination address the SA was negotiated for
    pub dst: Ipv4Addr,
    /// IPsec protocol (AH, ESP or IPCOMP)
    pub proto: u8,
    /// Security Parameter Index (for IPCOMP, the CPI)
    pub spi: u32,
}

impl SaId {
    /// Build an SA identity
    pub fn new(dst: Ipv4Addr, proto: u8, spi: u32) -> Self {
        SaId { dst, proto, spi }
    }
}

impl fmt::Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}0x{:08x}@{}", protocol_name(self.proto), self.spi, self.dst)
    }
}

/// SA lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaState {
    /// Keying in progress; the SA must not process traffic yet
    Larval,
    /// Fully keyed and usable
    Mature,
    /// Expired or deleted; never usable again
    Dead,
}

/// One soft/hard limit pair
///
/// `None` means unlimited. Soft-limit crossings are advisory (they
/// should trigger an out-of-band rekey, which is not this crate's
/// job); hard-limit crossings expire the SA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeLimit {
    /// Advisory limit
    pub soft: Option<u64>,
    /// Expiry limit
    pub hard: Option<u64>,
}

impl LifetimeLimit {
    /// No limits
    pub const UNLIMITED: LifetimeLimit = LifetimeLimit {
        soft: None,
        hard: None,
    };

    /// Limit with only a hard threshold
    pub fn hard(hard: u64) -> Self {
        LifetimeLimit {
            soft: None,
            hard: Some(hard),
        }
    }

    fn verdict(&self, count: u64, which: &'static str) -> LifetimeVerdict {
        if let Some(hard) = self.hard {
            if count >= hard {
                return LifetimeVerdict::HardExpired(which);
            }
        }
        if let Some(soft) = self.soft {
            if count >= soft {
                return LifetimeVerdict::SoftExpired(which);
            }
        }
        LifetimeVerdict::Ok
    }
}

/// SA lifetime limits over four dimensions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaLifetime {
    /// Bytes processed
    pub bytes: LifetimeLimit,
    /// Packets processed
    pub packets: LifetimeLimit,
    /// Seconds since the SA was added
    pub add_seconds: LifetimeLimit,
    /// Seconds since the SA first processed traffic
    pub use_seconds: LifetimeLimit,
}

/// Outcome of evaluating all lifetime counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeVerdict {
    /// All counters within limits
    Ok,
    /// A soft limit was crossed; traffic continues, rekey is due
    SoftExpired(&'static str),
    /// A hard limit was crossed; the SA must be expired
    HardExpired(&'static str),
}

/// Per-SA error counters, diagnostic only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaErrorCounters {
    /// Authenticator mismatches and missing authenticators
    pub auth_errs: u64,
    /// Replay-window rejections
    pub replay_errs: u64,
    /// Unusable algorithm configuration
    pub alg_errs: u64,
}

/// An address/mask pair describing one side of a tunnel flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    /// Network address
    pub addr: Ipv4Addr,
    /// Network mask
    pub mask: Ipv4Addr,
}

impl Subnet {
    /// Build a subnet
    pub fn new(addr: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Subnet { addr, mask }
    }

    /// A /32 covering exactly one host
    pub fn host(addr: Ipv4Addr) -> Self {
        Subnet {
            addr,
            mask: Ipv4Addr::new(255, 255, 255, 255),
        }
    }

    /// Does `ip` fall inside this subnet?
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        (u32::from(ip) & mask) == (u32::from(self.addr) & mask)
    }
}

/// Inner-flow policy for a tunnel-mode SA
///
/// After the IPIP header is stripped, the inner source and destination
/// must fall inside these subnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelPolicy {
    /// Permitted inner source flow
    pub src: Subnet,
    /// Permitted inner destination flow
    pub dst: Subnet,
}

/// One inbound Security Association
///
/// Owned by the [`crate::store::SaStore`]; the pipeline borrows a
/// reference for the duration of one run and must re-validate liveness
/// after any suspension.
#[derive(Debug, Clone)]
pub struct SecurityAssociation {
    /// Identity (destination, protocol, SPI)
    pub said: SaId,
    /// Lifecycle state
    pub state: SaState,

    /// Authentication algorithm and key; `None` means no authentication
    pub auth: Option<AuthKey>,
    /// Encryption algorithm and key; `None` for AH and IPCOMP SAs
    pub cipher: Option<CipherKey>,
    /// Digest computation is delegated to an external accelerator
    pub auth_offloaded: bool,

    /// Anti-replay window
    pub replay: ReplayWindow,
    /// Lifetime limits
    pub lifetime: SaLifetime,
    /// Bytes processed by this SA
    pub bytes_processed: u64,
    /// Packets processed by this SA
    pub packets_processed: u64,
    /// When the SA was added
    pub created_at: Instant,
    /// When the SA first processed traffic
    pub first_used: Option<Instant>,
    /// When the SA last processed traffic
    pub last_used: Option<Instant>,

    /// Peer the packets must come from (source-address policy)
    pub peer: Ipv4Addr,
    /// NAT-T encapsulation negotiated for this SA
    pub natt: NattType,
    /// Inner-flow policy for tunnel mode
    pub tunnel: Option<TunnelPolicy>,
    /// Next SA towards the inside of a nested decapsulation chain
    pub inner_next: Option<SaId>,

    /// Diagnostic error counters
    pub errs: SaErrorCounters,
}

impl SecurityAssociation {
    /// Create a MATURE SA with defaults: default replay window,
    /// unlimited lifetimes, no keys, no tunnel policy, no chain link
    pub fn new(said: SaId, peer: Ipv4Addr) -> Self {
        SecurityAssociation {
            said,
            state: SaState::Mature,
            auth: None,
            cipher: None,
            auth_offloaded: false,
            replay: ReplayWindow::default(),
            lifetime: SaLifetime::default(),
            bytes_processed: 0,
            packets_processed: 0,
            created_at: Instant::now(),
            first_used: None,
            last_used: None,
            peer,
            natt: NattType::None,
            tunnel: None,
            inner_next: None,
            errs: SaErrorCounters::default(),
        }
    }

    /// Set the authentication algorithm and key
    pub fn with_auth(mut self, auth: AuthKey) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set the encryption algorithm and key
    pub fn with_cipher(mut self, cipher: CipherKey) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Set the lifetime limits
    pub fn with_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the replay window
    pub fn with_replay_window(mut self, replay: ReplayWindow) -> Self {
        self.replay = replay;
        self
    }

    /// Link the next SA of the decapsulation chain
    pub fn with_inner_next(mut self, next: SaId) -> Self {
        self.inner_next = Some(next);
        self
    }

    /// Set the tunnel-mode inner-flow policy
    pub fn with_tunnel(mut self, tunnel: TunnelPolicy) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Set the NAT-T encapsulation binding
    pub fn with_natt(mut self, natt: NattType) -> Self {
        self.natt = natt;
        self
    }

    /// Delegate digest computation to an external accelerator
    pub fn with_auth_offloaded(mut self) -> Self {
        self.auth_offloaded = true;
        self
    }

    /// Can this SA process traffic right now?
    pub fn is_usable(&self) -> bool {
        self.state == SaState::Mature
    }

    /// Evaluate every lifetime counter against its limits
    ///
    /// A hard verdict on any dimension wins over soft verdicts on
    /// others; the first soft crossing is reported otherwise.
    pub fn check_lifetimes(&self) -> LifetimeVerdict {
        let add_secs = self.created_at.elapsed().as_secs();
        let use_secs = self
            .first_used
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);

        let verdicts = [
            self.lifetime.bytes.verdict(self.bytes_processed, "bytes"),
            self.lifetime.add_seconds.verdict(add_secs, "addtime"),
            self.lifetime.use_seconds.verdict(use_secs, "usetime"),
            self.lifetime
                .packets
                .verdict(self.packets_processed, "packets"),
        ];

        let mut soft = LifetimeVerdict::Ok;
        for v in verdicts {
            match v {
                LifetimeVerdict::HardExpired(_) => return v,
                LifetimeVerdict::SoftExpired(_) => {
                    if soft == LifetimeVerdict::Ok {
                        soft = v;
                    }
                }
                LifetimeVerdict::Ok => {}
            }
        }
        soft
    }

    /// Account one processed packet of `bytes` bytes
    pub fn record_usage(&mut self, bytes: u64) {
        self.bytes_processed = self.bytes_processed.saturating_add(bytes);
        self.packets_processed = self.packets_processed.saturating_add(1);
        let now = Instant::now();
        self.first_used.get_or_insert(now);
        self.last_used = Some(now);
    }
}
