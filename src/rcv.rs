//! Inbound decapsulation state machine
//!
//! The heart of the crate: a state machine that walks one received
//! packet from raw AH/ESP/IPCOMP datagram to plain IP, one protocol
//! layer per loop. Re-entered until processing completes, so any
//! action can hand work to an asynchronous accelerator and pick up
//! where it left off.
//!
//! ```text
//! INIT ──▶ DECAP_INIT ──▶ DECAP_CHK ──▶ AUTH_INIT ──▶ AUTH_CALC
//!              ▲                                          │
//!              │ another AH/ESP/IPCOMP header             ▼
//!          DECAP_CONT ◀── DECRYPT ◀──────────────── AUTH_CHK
//!              │
//!              ▼
//!          CLEANUP ──▶ IPCOMP ──▶ COMPLETE ──▶ DONE
//! ```
//!
//! Each state's action returns advance, an explicit next state, a
//! pending suspension, or a terminal failure. Failures drop the
//! packet, count once, log once; two kinds (hard lifetime expiry and
//! a rolled replay window) additionally delete the SA chain.
//!
//! # Locking
//!
//! SA state is only touched under the owning entry's lock, held for
//! single steps and never across a suspension: an accelerator's
//! completion path must be able to re-enter without deadlocking.
//! After a suspension the SA is re-validated through the store; it
//! may have been deleted while the packet was away.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};

use zeroize::Zeroize;

use crate::auth::{self, AUTH_DIGEST_LEN};
use crate::config::DecapConfig;
use crate::error::{Error, Result};
use crate::esp::ESP_HEADER_LEN;
use crate::ipcomp;
use crate::logging;
use crate::metrics::DecapMetrics;
use crate::nat::{self, NattType, UdpEncap};
use crate::packet::{
    is_ipsec_protocol, PacketBuf, IPPROTO_AH, IPPROTO_COMP, IPPROTO_ESP, IPPROTO_IPIP,
};
use crate::sa::{LifetimeVerdict, SaId, SaState};
use crate::store::{SaEntry, SaStore};
use crate::transform::{self, Transform};

/// States of the receive machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Buffer validation, NAT-T unwrapping, header identification
    Init,
    /// Transform selection for the current protocol
    DecapInit,
    /// Protocol header validation, SPI/sequence extraction
    DecapCheck,
    /// SA lookup, policy binding, lifetimes, authenticator location
    AuthInit,
    /// Pre-authentication replay check and digest computation
    AuthCalc,
    /// Digest comparison and replay-window commit
    AuthCheck,
    /// In-place decryption and header strip
    Decrypt,
    /// Inner-header recovery; loops for nested protection
    DecapCont,
    /// IPIP tunnel strip, tunnel policy, NAT-T checksum repair
    Cleanup,
    /// Trailing IPCOMP handling
    Ipcomp,
    /// Hand-off to IP input
    Complete,
    /// Terminal
    Done,
}

impl RecvState {
    /// State name for logs
    pub fn name(self) -> &'static str {
        match self {
            RecvState::Init => "init",
            RecvState::DecapInit => "decap_init",
            RecvState::DecapCheck => "decap_chk",
            RecvState::AuthInit => "auth_init",
            RecvState::AuthCalc => "auth_calc",
            RecvState::AuthCheck => "auth_chk",
            RecvState::Decrypt => "decrypt",
            RecvState::DecapCont => "decap_cont",
            RecvState::Cleanup => "cleanup",
            RecvState::Ipcomp => "ipcomp",
            RecvState::Complete => "complete",
            RecvState::Done => "done",
        }
    }
}

/// Asynchronous work a suspended packet is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    /// Keyed digest over `region` of the packet buffer, delegated to
    /// an accelerator
    AuthDigest {
        /// Byte range of the authenticated region
        region: (usize, usize),
    },
}

/// What one state action asks the driver to do next
enum StepOutcome {
    /// Move to the table's default successor
    Advance,
    /// Move to an explicit state (the nested-decapsulation loop)
    Goto(RecvState),
    /// Suspend; the driver parks the context and returns it
    Pending(PendingOp),
}

type ActionResult = Result<StepOutcome>;
type Action = fn(&DecapEngine, &mut RecvContext) -> ActionResult;

/// One packet's processing context
///
/// Created on arrival, mutated at every transition, released at the
/// terminal state or on failure. Holds the borrowed packet buffer,
/// the current SA reference, and the per-round scratch.
#[derive(Debug)]
pub struct RecvContext {
    pub(crate) state: RecvState,
    pub(crate) next_state: RecvState,

    pub(crate) packet: Option<PacketBuf>,
    pub(crate) iphlen: usize,
    pub(crate) len: usize,
    pub(crate) proto: u8,
    pub(crate) src: Ipv4Addr,
    pub(crate) dst: Ipv4Addr,
    pub(crate) src_txt: String,
    pub(crate) dst_txt: String,

    pub(crate) spi: u32,
    pub(crate) seq: u32,
    pub(crate) said: Option<SaId>,
    pub(crate) sa: Option<SaEntry>,
    pub(crate) transform: Option<&'static dyn Transform>,

    pub(crate) auth_len: usize,
    pub(crate) auth_region: (usize, usize),
    pub(crate) authenticator_off: Option<usize>,
    pub(crate) hash: [u8; AUTH_DIGEST_LEN],
    pub(crate) next_header: u8,

    pub(crate) natt: Option<UdpEncap>,
    pub(crate) pending: Option<PendingOp>,
    pub(crate) rounds: u32,
}

impl RecvContext {
    fn new(input: PacketIn) -> Self {
        RecvContext {
            state: RecvState::Init,
            next_state: RecvState::Init,
            packet: Some(input.buf),
            iphlen: 0,
            len: 0,
            proto: 0,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            src_txt: String::new(),
            dst_txt: String::new(),
            spi: 0,
            seq: 0,
            said: None,
            sa: None,
            transform: None,
            auth_len: 0,
            auth_region: (0, 0),
            authenticator_off: None,
            hash: [0u8; AUTH_DIGEST_LEN],
            next_header: 0,
            natt: input.encap,
            pending: None,
            rounds: 0,
        }
    }

    pub(crate) fn packet_ref(&self) -> Result<&PacketBuf> {
        self.packet
            .as_ref()
            .ok_or_else(|| Error::Internal("packet buffer gone".into()))
    }

    pub(crate) fn packet_mut(&mut self) -> Result<&mut PacketBuf> {
        self.packet
            .as_mut()
            .ok_or_else(|| Error::Internal("packet buffer gone".into()))
    }

    fn transform(&self) -> Result<&'static dyn Transform> {
        self.transform
            .ok_or_else(|| Error::Internal("no transform selected".into()))
    }

    fn sa_entry(&self) -> Result<&SaEntry> {
        self.sa
            .as_ref()
            .ok_or_else(|| Error::Internal("no SA bound to packet".into()))
    }

    fn natt_kind(&self) -> NattType {
        self.natt.map(|e| e.kind).unwrap_or(NattType::None)
    }

    /// Re-read the IP header at the front of the buffer into the
    /// context, including the diagnostic address strings
    pub(crate) fn refresh_header(&mut self) -> Result<()> {
        let hdr = self.packet_ref()?.ip_header()?;
        self.len = self.packet_ref()?.len();
        self.iphlen = hdr.header_len;
        self.proto = hdr.protocol;
        self.src = hdr.src;
        self.dst = hdr.dst;
        self.src_txt = hdr.src.to_string();
        self.dst_txt = hdr.dst.to_string();
        Ok(())
    }
}

fn lock(entry: &SaEntry) -> MutexGuard<'_, crate::sa::SecurityAssociation> {
    entry.lock().expect("SA entry lock poisoned")
}

/// One packet as delivered by the host's receive path
#[derive(Debug, Clone)]
pub struct PacketIn {
    /// Datagram, starting at the outer IPv4 header
    pub buf: PacketBuf,
    /// UDP-encapsulation indication (NAT-T), if any
    pub encap: Option<UdpEncap>,
}

impl PacketIn {
    /// A packet that arrived as a bare IP datagram
    pub fn plain(data: Vec<u8>) -> Self {
        PacketIn {
            buf: PacketBuf::new(data),
            encap: None,
        }
    }

    /// A packet that arrived ESP-in-UDP (NAT-T)
    pub fn udp_encapsulated(data: Vec<u8>, encap: UdpEncap) -> Self {
        PacketIn {
            buf: PacketBuf::new(data),
            encap: Some(encap),
        }
    }
}

/// Sink for fully decapsulated packets
///
/// The pipeline's only output: ownership of the plain IP datagram is
/// transferred here exactly once per delivered packet.
pub trait IpInput: Send + Sync {
    /// Take delivery of a plain IP datagram
    fn input(&self, packet: Vec<u8>);
}

/// Result of driving one packet
#[derive(Debug)]
pub enum RunOutcome {
    /// Decapsulated and handed to IP input
    Delivered,
    /// Parked awaiting asynchronous work; resume via
    /// [`DecapEngine::resume`]
    Suspended(SuspendedPacket),
    /// Dropped; the error has been counted and logged
    Dropped(Error),
}

/// A packet parked mid-pipeline for asynchronous work
///
/// The accelerator reads the work via [`SuspendedPacket::pending`] and
/// [`SuspendedPacket::auth_data`], stores the result with
/// [`SuspendedPacket::supply_digest`], then re-enters the engine.
#[derive(Debug)]
pub struct SuspendedPacket {
    ctx: Box<RecvContext>,
}

impl SuspendedPacket {
    /// The operation being waited on, if still outstanding
    pub fn pending(&self) -> Option<&PendingOp> {
        self.ctx.pending.as_ref()
    }

    /// The bytes to digest for an outstanding authentication request
    pub fn auth_data(&self) -> Option<&[u8]> {
        let PendingOp::AuthDigest { region } = self.ctx.pending.as_ref()?;
        self.ctx.packet.as_ref()?.as_slice().get(region.0..region.1)
    }

    /// Identity of the SA this packet is bound to
    pub fn sa_id(&self) -> Option<SaId> {
        self.ctx.said
    }

    /// Claimed sequence number of the suspended round
    pub fn sequence(&self) -> u32 {
        self.ctx.seq
    }

    /// Store the accelerator's digest and mark the work complete
    pub fn supply_digest(&mut self, digest: [u8; AUTH_DIGEST_LEN]) {
        self.ctx.hash = digest;
        self.ctx.pending = None;
    }
}

/// The inbound decapsulation engine
///
/// One engine serves many packets concurrently; each packet gets its
/// own [`RecvContext`], and shared SA state is only touched under
/// per-entry locks.
pub struct DecapEngine {
    store: Arc<SaStore>,
    config: DecapConfig,
    metrics: DecapMetrics,
    ip_input: Arc<dyn IpInput>,
    in_flight: AtomicUsize,
}

impl DecapEngine {
    /// Build an engine over an SA store and an IP-input sink
    pub fn new(store: Arc<SaStore>, config: DecapConfig, ip_input: Arc<dyn IpInput>) -> Self {
        DecapEngine {
            store,
            config,
            metrics: DecapMetrics::new(),
            ip_input,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// The engine's counters
    pub fn metrics(&self) -> &DecapMetrics {
        &self.metrics
    }

    /// The SA store this engine resolves against
    pub fn store(&self) -> &Arc<SaStore> {
        &self.store
    }

    /// Packets currently processing or suspended
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Process one received packet
    pub fn receive(&self, input: PacketIn) -> RunOutcome {
        self.metrics.record_received();

        if self.in_flight.fetch_add(1, Ordering::AcqRel) >= self.config.max_in_flight {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.metrics.record_shed();
            let err = Error::Internal("pipeline at capacity, packet shed".into());
            return RunOutcome::Dropped(err);
        }

        self.run(RecvContext::new(input))
    }

    /// Resume a packet previously parked for asynchronous work
    ///
    /// The referenced SA is re-validated first: it may have been
    /// deleted while the packet was suspended.
    pub fn resume(&self, suspended: SuspendedPacket) -> RunOutcome {
        let mut ctx = *suspended.ctx;

        if ctx.pending.is_some() {
            let err = Error::Internal("resumed before asynchronous completion".into());
            self.fail(&mut ctx, &err);
            return RunOutcome::Dropped(err);
        }

        if let Some(said) = ctx.said {
            match self.store.lookup(&said) {
                None => {
                    let err = Error::SaNotFound(said);
                    self.fail(&mut ctx, &err);
                    return RunOutcome::Dropped(err);
                }
                Some(entry) => {
                    let state = lock(&entry).state;
                    if state != SaState::Mature {
                        let err = Error::SaNotLive(said, state);
                        self.fail(&mut ctx, &err);
                        return RunOutcome::Dropped(err);
                    }
                    ctx.sa = Some(entry);
                    logging::log_resumed(&said);
                }
            }
        }

        self.run(ctx)
    }

    /// The state table: action and default successor per state
    fn entry(state: RecvState) -> (Action, RecvState) {
        match state {
            RecvState::Init => (Self::rcv_init, RecvState::DecapInit),
            RecvState::DecapInit => (Self::rcv_decap_init, RecvState::DecapCheck),
            RecvState::DecapCheck => (Self::rcv_decap_check, RecvState::AuthInit),
            RecvState::AuthInit => (Self::rcv_auth_init, RecvState::AuthCalc),
            RecvState::AuthCalc => (Self::rcv_auth_calc, RecvState::AuthCheck),
            RecvState::AuthCheck => (Self::rcv_auth_check, RecvState::Decrypt),
            RecvState::Decrypt => (Self::rcv_decrypt, RecvState::DecapCont),
            RecvState::DecapCont => (Self::rcv_decap_cont, RecvState::Cleanup),
            RecvState::Cleanup => (Self::rcv_cleanup, RecvState::Ipcomp),
            RecvState::Ipcomp => (Self::rcv_ipcomp, RecvState::Complete),
            RecvState::Complete => (Self::rcv_complete, RecvState::Done),
            RecvState::Done => (Self::rcv_done, RecvState::Done),
        }
    }

    /// Trampoline over the state table
    fn run(&self, mut ctx: RecvContext) -> RunOutcome {
        while ctx.state != RecvState::Done {
            let from = ctx.state;
            let (action, default_next) = Self::entry(ctx.state);
            ctx.next_state = default_next;

            match action(self, &mut ctx) {
                Ok(StepOutcome::Advance) => {
                    logging::log_state_transition(from.name(), ctx.next_state.name(), ctx.spi);
                    ctx.state = ctx.next_state;
                }
                Ok(StepOutcome::Goto(next)) => {
                    logging::log_state_transition(from.name(), next.name(), ctx.spi);
                    ctx.state = next;
                }
                Ok(StepOutcome::Pending(op)) => {
                    ctx.pending = Some(op);
                    ctx.state = ctx.next_state;
                    self.metrics.record_suspended();
                    return RunOutcome::Suspended(SuspendedPacket { ctx: Box::new(ctx) });
                }
                Err(err) => {
                    self.fail(&mut ctx, &err);
                    return RunOutcome::Dropped(err);
                }
            }
        }

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        RunOutcome::Delivered
    }

    /// Terminal failure: report once, release everything, and delete
    /// the SA chain for the kinds fatal to the SA
    fn fail(&self, ctx: &mut RecvContext, err: &Error) {
        logging::log_drop(err, &ctx.src_txt, &ctx.dst_txt);
        self.metrics.record_drop(err.kind());

        if err.is_fatal_to_sa() {
            if let Some(said) = ctx.said {
                self.store.delete_chain(&said);
                logging::log_sa_chain_deleted(&said, &err.to_string());
            }
        }

        ctx.sa = None;
        ctx.packet = None;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    // --- state actions ---

    /// INIT: validate the buffer, unwrap NAT-T, identify the protocol
    fn rcv_init(&self, ctx: &mut RecvContext) -> ActionResult {
        let encap = ctx.natt;
        {
            let pkt = ctx.packet_mut()?;
            if pkt.is_empty() {
                return Err(Error::Internal("empty packet buffer".into()));
            }
            let hdr = pkt.ip_header()?;
            if hdr.is_fragment() {
                return Err(Error::Internal("cannot process an IP fragment".into()));
            }
            if pkt.len() < hdr.total_len {
                return Err(Error::Internal(format!(
                    "buffer {} shorter than IP total length {}",
                    pkt.len(),
                    hdr.total_len
                )));
            }
            // drop link-layer trailer padding
            if pkt.len() > hdr.total_len {
                pkt.truncate(hdr.total_len);
            }

            if let Some(encap) = encap {
                let strip = encap.kind.strip_len();
                if strip > 0 {
                    if hdr.total_len < hdr.header_len + strip + ESP_HEADER_LEN {
                        return Err(Error::Internal(
                            "UDP-encapsulated packet too small for ESP".into(),
                        ));
                    }
                    pkt.remove(hdr.header_len..hdr.header_len + strip);
                    pkt.set_total_len(hdr.total_len - strip);
                    pkt.set_protocol(IPPROTO_ESP);
                    pkt.finalize_ip_checksum()?;
                    logging::log_natt_decap(encap.sport, encap.dport, strip);
                }
            }
        }

        ctx.refresh_header()?;
        if !is_ipsec_protocol(ctx.proto) {
            return Err(Error::Internal(format!(
                "not an IPsec packet: protocol {}",
                ctx.proto
            )));
        }
        Ok(StepOutcome::Advance)
    }

    /// DECAP_INIT: select the transform for this round's protocol
    fn rcv_decap_init(&self, ctx: &mut RecvContext) -> ActionResult {
        ctx.rounds += 1;
        match transform::for_protocol(ctx.proto) {
            Some(t) => {
                ctx.transform = Some(t);
                Ok(StepOutcome::Advance)
            }
            None => Err(Error::BadProtocol(ctx.proto)),
        }
    }

    /// DECAP_CHK: reset per-round scratch, validate the protocol header
    fn rcv_decap_check(&self, ctx: &mut RecvContext) -> ActionResult {
        ctx.spi = 0;
        ctx.seq = 0;
        ctx.auth_len = 0;
        ctx.auth_region = (0, 0);
        ctx.authenticator_off = None;
        ctx.hash = [0u8; AUTH_DIGEST_LEN];
        ctx.next_header = 0;

        ctx.refresh_header()?;
        ctx.transform()?.check(ctx)?;
        Ok(StepOutcome::Advance)
    }

    /// AUTH_INIT: SA lookup, liveness, policy binding, lifetimes,
    /// authenticator location
    fn rcv_auth_init(&self, ctx: &mut RecvContext) -> ActionResult {
        let said = SaId::new(ctx.dst, ctx.proto, ctx.spi);

        let entry = match self.store.lookup(&said) {
            Some(e) => e,
            None => return Err(Error::SaNotFound(said)),
        };

        // the previous round's SA designates its legal successor
        let prev_link = ctx.sa.as_ref().map(|prev| lock(prev).inner_next);

        ctx.said = Some(said);

        {
            let mut sa = lock(&entry);
            if !sa.is_usable() {
                return Err(Error::SaNotLive(said, sa.state));
            }

            if self.config.inbound_policy_check {
                if ctx.src != sa.peer {
                    return Err(Error::PolicyMismatch(format!(
                        "source {} does not match SA peer {}",
                        ctx.src, sa.peer
                    )));
                }
                if let Some(expected) = prev_link {
                    if expected != Some(said) {
                        return Err(Error::PolicyMismatch(format!(
                            "SA {} does not follow the previous SA's chain link",
                            said
                        )));
                    }
                }
                if ctx.proto == IPPROTO_ESP && ctx.natt_kind() != sa.natt {
                    return Err(Error::PolicyMismatch(format!(
                        "encapsulation {:?} does not match SA binding {:?}",
                        ctx.natt_kind(),
                        sa.natt
                    )));
                }
            }

            match sa.check_lifetimes() {
                LifetimeVerdict::HardExpired(which) => {
                    return Err(Error::LifetimeExpired(which));
                }
                LifetimeVerdict::SoftExpired(which) => {
                    logging::log_soft_lifetime(&said, which);
                }
                LifetimeVerdict::Ok => {}
            }

            match (&sa.auth, ctx.proto) {
                (Some(_), _) => ctx.auth_len = AUTH_DIGEST_LEN,
                (None, IPPROTO_AH) => {
                    // an AH SA without an authenticator cannot work
                    sa.errs.alg_errs += 1;
                    return Err(Error::AuthNotConfigured);
                }
                (None, _) => ctx.auth_len = 0,
            }
        }

        ctx.sa = Some(entry);

        // runt check: there must be payload beyond the authenticator
        let len = ctx.packet_ref()?.len();
        if len <= ctx.iphlen + ctx.auth_len {
            return Err(Error::TruncatedPayload {
                needed: ctx.iphlen + ctx.auth_len + 1,
                available: len,
            });
        }

        if ctx.auth_len > 0 {
            ctx.transform()?.setup_auth(ctx)?;
        }
        Ok(StepOutcome::Advance)
    }

    /// AUTH_CALC: pre-authentication replay check, then digest
    /// computation (or suspension for an accelerator)
    fn rcv_auth_calc(&self, ctx: &mut RecvContext) -> ActionResult {
        if ctx.auth_len == 0 {
            return Ok(StepOutcome::Advance);
        }

        if ctx.authenticator_off.is_none() {
            let mut sa = lock(ctx.sa_entry()?);
            sa.errs.auth_errs += 1;
            return Err(Error::AuthNotConfigured);
        }

        let (offloaded, auth_key, said) = {
            let entry = ctx.sa_entry()?.clone();
            let mut sa = lock(&entry);
            // cheap rejection before any digest work
            if !sa.replay.check(ctx.seq) {
                sa.errs.replay_errs += 1;
                logging::log_replay_rejected(&sa.said, ctx.seq);
                return Err(Error::ReplayRejected(ctx.seq));
            }
            (sa.auth_offloaded, sa.auth.clone(), sa.said)
        };

        if offloaded {
            logging::log_suspended(&said);
            return Ok(StepOutcome::Pending(PendingOp::AuthDigest {
                region: ctx.auth_region,
            }));
        }

        let key = auth_key.ok_or(Error::AuthNotConfigured)?;
        ctx.transform()?.calc_auth(ctx, &key)?;
        Ok(StepOutcome::Advance)
    }

    /// AUTH_CHK: constant-time compare, digest hygiene, replay commit
    fn rcv_auth_check(&self, ctx: &mut RecvContext) -> ActionResult {
        if ctx.auth_len == 0 {
            return Ok(StepOutcome::Advance);
        }

        let off = ctx
            .authenticator_off
            .ok_or_else(|| Error::Internal("authenticator location lost".into()))?;

        let matched = {
            let pkt = ctx.packet_ref()?;
            let received = &pkt.as_slice()[off..off + ctx.auth_len];
            auth::verify(&ctx.hash[..ctx.auth_len], received)
        };
        if !matched {
            let mut sa = lock(ctx.sa_entry()?);
            sa.errs.auth_errs += 1;
            return Err(Error::AuthFailed);
        }

        // clear the scratch digest before anything else reuses it
        ctx.hash.zeroize();

        let entry = ctx.sa_entry()?.clone();
        let mut sa = lock(&entry);

        // an authenticated sequence of zero means the counter wrapped
        if !sa.replay.is_disabled() && ctx.seq == 0 {
            return Err(Error::ReplayRolled(0));
        }
        if !sa.replay.update(ctx.seq) {
            sa.errs.replay_errs += 1;
            return Err(Error::ReplayRolled(ctx.seq));
        }
        Ok(StepOutcome::Advance)
    }

    /// DECRYPT: remove this round's protection in place
    fn rcv_decrypt(&self, ctx: &mut RecvContext) -> ActionResult {
        let t = ctx.transform()?;
        let entry = ctx.sa_entry()?.clone();
        let sa = lock(&entry);
        t.decrypt(ctx, &sa)?;
        Ok(StepOutcome::Advance)
    }

    /// DECAP_CONT: recover the inner header, account lifetimes, and
    /// loop if another IPsec layer follows
    fn rcv_decap_cont(&self, ctx: &mut RecvContext) -> ActionResult {
        {
            let next_header = ctx.next_header;
            let pkt = ctx.packet_mut()?;
            pkt.set_protocol(next_header);
            pkt.finalize_ip_checksum()?;
        }
        ctx.refresh_header()?;

        let entry = ctx.sa_entry()?.clone();
        let chain_next = lock(&entry).inner_next;

        if self.config.inbound_policy_check {
            if let Some(next_said) = chain_next {
                let allowed = matches!(
                    ctx.proto,
                    IPPROTO_AH | IPPROTO_ESP | IPPROTO_COMP | IPPROTO_IPIP
                );
                // a terminal IPCOMP link may legally go unused: senders
                // skip compression for incompressible payloads
                let skippable_ipcomp = next_said.proto == IPPROTO_COMP
                    && self
                        .store
                        .lookup(&next_said)
                        .map(|ne| lock(&ne).inner_next.is_none())
                        .unwrap_or(false);
                if !allowed && !skippable_ipcomp {
                    return Err(Error::PolicyMismatch(format!(
                        "protocol {} with chain link {} unsatisfied",
                        ctx.proto, next_said
                    )));
                }
            }
        }

        lock(&entry).record_usage(ctx.len as u64);

        if is_ipsec_protocol(ctx.proto) {
            return Ok(StepOutcome::Goto(RecvState::DecapInit));
        }
        Ok(StepOutcome::Advance)
    }

    /// CLEANUP: strip an IPIP tunnel header under the tunnel SA's
    /// policy; repair NAT-T transport checksums
    fn rcv_cleanup(&self, ctx: &mut RecvContext) -> ActionResult {
        let entry = ctx.sa_entry()?.clone();
        let mut chain_next = lock(&entry).inner_next;

        // hop over a negotiated-but-unused IPCOMP link
        if let Some(n) = chain_next {
            if n.proto == IPPROTO_COMP {
                if let Some(ne) = self.store.lookup(&n) {
                    chain_next = lock(&ne).inner_next;
                }
            }
        }

        if ctx.natt_kind() != NattType::None && ctx.proto != IPPROTO_IPIP {
            nat::fixup_transport_checksum(ctx.packet_mut()?)?;
        }

        if let Some(tunnel_said) = chain_next {
            if ctx.proto != IPPROTO_IPIP {
                return Err(Error::Internal(format!(
                    "protocol {} slipped through with SA {} remaining",
                    ctx.proto, tunnel_said
                )));
            }
            let tunnel_entry = self
                .store
                .lookup(&tunnel_said)
                .ok_or_else(|| Error::Internal(format!("chain link {} vanished", tunnel_said)))?;

            {
                let sa = lock(&tunnel_entry);
                if self.config.inbound_policy_check {
                    if sa.inner_next.is_some() {
                        return Err(Error::PolicyMismatch(format!(
                            "unexpected SA after tunnel SA {}",
                            tunnel_said
                        )));
                    }
                    if ctx.src != sa.peer {
                        return Err(Error::PolicyMismatch(format!(
                            "outer source {} does not match tunnel SA peer {}",
                            ctx.src, sa.peer
                        )));
                    }
                }
            }

            // strip the outer header; the inner datagram takes over
            {
                let iphlen = ctx.iphlen;
                let pkt = ctx.packet_mut()?;
                if pkt.len() < iphlen {
                    return Err(Error::Internal(
                        "buffer shorter than its own IP header".into(),
                    ));
                }
                pkt.remove(0..iphlen);
            }
            ctx.refresh_header()?;

            let mut sa = lock(&tunnel_entry);
            sa.record_usage(ctx.len as u64);
            if self.config.inbound_policy_check {
                if let Some(tp) = sa.tunnel {
                    if !tp.src.contains(ctx.src) || !tp.dst.contains(ctx.dst) {
                        return Err(Error::PolicyMismatch(format!(
                            "inner flow {} -> {} outside tunnel policy",
                            ctx.src, ctx.dst
                        )));
                    }
                }
            }
        }

        Ok(StepOutcome::Advance)
    }

    /// IPCOMP: a compression header surviving to this point follows an
    /// IPIP unwrap; policy forbids it, otherwise decompress in place
    fn rcv_ipcomp(&self, ctx: &mut RecvContext) -> ActionResult {
        if ctx.proto != IPPROTO_COMP {
            return Ok(StepOutcome::Advance);
        }
        if self.config.inbound_policy_check {
            return Err(Error::IpcompFailed(
                "compression header after tunnel decapsulation".into(),
            ));
        }

        let iphlen = ctx.iphlen;
        let next_header = {
            let pkt = ctx.packet_mut()?;
            ipcomp::decompress_in_packet(pkt, iphlen)?
        };
        {
            let pkt = ctx.packet_mut()?;
            pkt.set_protocol(next_header);
            pkt.finalize_ip_checksum()?;
        }
        ctx.refresh_header()?;
        Ok(StepOutcome::Advance)
    }

    /// COMPLETE: hand the plain IP packet to IP input, exactly once
    fn rcv_complete(&self, ctx: &mut RecvContext) -> ActionResult {
        let pkt = ctx
            .packet
            .take()
            .ok_or_else(|| Error::Internal("no packet at completion".into()))?;
        ctx.sa = None;
        logging::log_delivered(ctx.proto, pkt.len(), ctx.rounds);
        self.metrics.record_delivered(pkt.len());
        self.ip_input.input(pkt.into_vec());
        Ok(StepOutcome::Advance)
    }

    fn rcv_done(&self, _ctx: &mut RecvContext) -> ActionResult {
        Ok(StepOutcome::Advance)
    }
}
