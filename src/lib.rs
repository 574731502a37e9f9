//! Inbound IPsec decapsulation pipeline
//!
//! This crate implements the receive side of IPsec packet processing:
//! it takes decapsulated network packets carrying AH/ESP/IPCOMP
//! headers, authenticates and decrypts them, enforces anti-replay and
//! inbound policy, and recursively unwraps nested encapsulations
//! (transport/tunnel, IPIP, IPCOMP) until a plain IP packet is
//! recovered and handed back to ordinary IP input.
//!
//! # Architecture
//!
//! ```text
//! receive path ──▶ DecapEngine (state machine)
//!                    ├── Transform per protocol (AH / ESP / IPCOMP)
//!                    ├── ReplayWindow      (per-SA, check ≠ update)
//!                    ├── Authentication    (HMAC-MD5-96 / HMAC-SHA1-96)
//!                    ├── ESP bulk ciphers  (NULL / 3DES-CBC / AES-CBC)
//!                    └── SaStore           (concurrent, per-entry locks)
//!                          ▼
//!                      IpInput sink (plain IP packet, exactly once)
//! ```
//!
//! # Quick start
//!
//! ```rust
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use ipsec_decap::auth::{AuthAlgorithm, AuthKey};
//! use ipsec_decap::cipher::CipherKey;
//! use ipsec_decap::config::DecapConfig;
//! use ipsec_decap::packet::IPPROTO_ESP;
//! use ipsec_decap::rcv::{DecapEngine, IpInput};
//! use ipsec_decap::sa::{SaId, SecurityAssociation};
//! use ipsec_decap::store::SaStore;
//!
//! struct Discard;
//! impl IpInput for Discard {
//!     fn input(&self, _packet: Vec<u8>) {}
//! }
//!
//! # fn main() -> ipsec_decap::Result<()> {
//! let store = Arc::new(SaStore::new());
//! let local = Ipv4Addr::new(10, 0, 0, 1);
//! let peer = Ipv4Addr::new(10, 0, 0, 2);
//!
//! // One inbound ESP SA: HMAC-SHA1-96 + AES-CBC
//! let sa = SecurityAssociation::new(SaId::new(local, IPPROTO_ESP, 0x1001), peer)
//!     .with_auth(AuthKey::new(AuthAlgorithm::HmacSha1_96, vec![0x22; 20])?)
//!     .with_cipher(CipherKey::new(ipsec_decap::cipher::EspCipher::AesCbc, vec![0x33; 16])?);
//! store.insert(sa);
//!
//! let engine = DecapEngine::new(store, DecapConfig::default(), Arc::new(Discard));
//! // engine.receive(PacketIn::plain(datagram)) for each arriving packet
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```
//!
//! # Processing order
//!
//! The order of operations is a security property, not an
//! implementation detail:
//!
//! 1. anti-replay **check** before any digest work, so obvious
//!    replays never cost cryptography;
//! 2. authenticate before decrypt, so forged packets never reach the
//!    cipher;
//! 3. anti-replay **update** only after authentication, so a forged
//!    packet can never advance the window.
//!
//! # Concurrency
//!
//! One pipeline run per packet; many packets run concurrently. Shared
//! SA state is touched only under short per-entry locks, released
//! before hand-off and never held across a suspension. An action may
//! park the packet for an asynchronous accelerator
//! ([`rcv::RunOutcome::Suspended`]); on resume the SA is re-validated,
//! since it may have been deleted meanwhile.
//!
//! # References
//!
//! - [RFC 4302](https://datatracker.ietf.org/doc/html/rfc4302) - IP Authentication Header
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - IP Encapsulating Security Payload
//! - [RFC 3173](https://datatracker.ietf.org/doc/html/rfc3173) - IP Payload Compression
//! - [RFC 3948](https://datatracker.ietf.org/doc/html/rfc3948) - UDP Encapsulation of ESP

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod ah;
pub mod auth;
pub mod cipher;
pub mod config;
pub mod error;
pub mod esp;
pub mod ipcomp;
pub mod logging;
pub mod metrics;
pub mod nat;
pub mod packet;
pub mod rcv;
pub mod replay;
pub mod sa;
pub mod store;
pub mod transform;

// Re-export commonly used types
pub use config::DecapConfig;
pub use error::{DropKind, Error, Result};
pub use rcv::{DecapEngine, IpInput, PacketIn, RunOutcome};
pub use replay::ReplayWindow;
pub use sa::{SaId, SaState, SecurityAssociation};
pub use store::SaStore;
