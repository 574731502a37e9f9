//! Decapsulation Integration Tests
//!
//! End-to-end tests driving complete packets through the receive state
//! machine: ESP/AH transport mode, tunnel mode with policy, nested
//! chains, NAT-T, anti-replay ordering, lifetimes, and suspension for
//! offloaded authentication.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ipsec_decap::ah::build_ah;
use ipsec_decap::auth::{AuthAlgorithm, AuthKey};
use ipsec_decap::cipher::{CipherKey, EspCipher};
use ipsec_decap::config::DecapConfig;
use ipsec_decap::error::{DropKind, Error};
use ipsec_decap::esp::build_esp;
use ipsec_decap::ipcomp::{build_ipcomp, CPI_DEFLATE};
use ipsec_decap::nat::{NattType, UdpEncap};
use ipsec_decap::packet::{
    build_ipv4_header, Ipv4Header, IPPROTO_AH, IPPROTO_COMP, IPPROTO_ESP, IPPROTO_IPIP,
    IPPROTO_UDP,
};
use ipsec_decap::rcv::{DecapEngine, IpInput, PacketIn, RunOutcome};
use ipsec_decap::sa::{
    LifetimeLimit, SaId, SaState, SecurityAssociation, Subnet, TunnelPolicy,
};
use ipsec_decap::store::SaStore;

/// Local endpoint (packet destination)
const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
/// Remote peer (packet source)
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Sink capturing everything handed to IP input
#[derive(Default)]
struct Sink {
    delivered: Mutex<Vec<Vec<u8>>>,
}

impl IpInput for Sink {
    fn input(&self, packet: Vec<u8>) {
        self.delivered.lock().unwrap().push(packet);
    }
}

impl Sink {
    fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    fn last(&self) -> Vec<u8> {
        self.delivered.lock().unwrap().last().cloned().expect("no packet delivered")
    }
}

fn make_engine(store: Arc<SaStore>) -> (Arc<Sink>, DecapEngine) {
    let sink = Arc::new(Sink::default());
    let engine = DecapEngine::new(store, DecapConfig::default(), sink.clone());
    (sink, engine)
}

/// Test authentication key (HMAC-SHA1-96)
fn sha1_key() -> AuthKey {
    AuthKey::new(AuthAlgorithm::HmacSha1_96, vec![0x22; 20]).expect("valid SHA1 key")
}

/// Test encryption key (AES-128-CBC)
fn aes_key() -> CipherKey {
    CipherKey::new(EspCipher::AesCbc, vec![0x33; 16]).expect("valid AES key")
}

/// A small UDP datagram with a deliberately stale checksum
fn udp_payload() -> Vec<u8> {
    let payload = b"telemetry sample 42";
    let mut seg = Vec::new();
    seg.extend_from_slice(&4500u16.to_be_bytes()); // sport
    seg.extend_from_slice(&9999u16.to_be_bytes()); // dport
    seg.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    seg.extend_from_slice(&0xabcdu16.to_be_bytes()); // checksum
    seg.extend_from_slice(payload);
    seg
}

/// Wrap an ESP body in an outer IPv4 header
fn esp_packet(src: Ipv4Addr, dst: Ipv4Addr, body: &[u8]) -> Vec<u8> {
    let mut pkt = build_ipv4_header(src, dst, IPPROTO_ESP, body.len());
    pkt.extend_from_slice(body);
    pkt
}

/// Build a complete transport-mode ESP packet around `payload`
fn transport_esp_packet(spi: u32, seq: u32, payload: &[u8], next_header: u8) -> Vec<u8> {
    let body = build_esp(
        spi,
        seq,
        &[0x41; 16],
        payload,
        next_header,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("ESP build");
    esp_packet(PEER, LOCAL, &body)
}

/// Insert the standard transport-mode ESP SA for `spi`
fn insert_esp_sa(store: &SaStore, spi: u32) -> SaId {
    let said = SaId::new(LOCAL, IPPROTO_ESP, spi);
    store.insert(
        SecurityAssociation::new(said, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key()),
    );
    said
}

//
// Test Cases - End-to-end transport mode
//

#[test]
fn test_esp_transport_udp_end_to_end() {
    let store = Arc::new(SaStore::new());
    insert_esp_sa(&store, 0x1001);
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let outcome = engine.receive(PacketIn::plain(transport_esp_packet(
        0x1001, 1, &payload, IPPROTO_UDP,
    )));

    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);
    assert_eq!(sink.count(), 1, "delivered exactly once");

    let delivered = sink.last();
    let hdr = Ipv4Header::parse(&delivered).expect("delivered packet parses");
    assert_eq!(hdr.protocol, IPPROTO_UDP);
    assert_eq!(hdr.src, PEER);
    assert_eq!(hdr.dst, LOCAL);
    assert_eq!(hdr.total_len, delivered.len());
    assert_eq!(&delivered[hdr.header_len..], &payload[..]);

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.received, 1);
    assert_eq!(snapshot.delivered, 1);
    assert_eq!(snapshot.dropped_total, 0);
}

#[test]
fn test_ah_transport_end_to_end() {
    let store = Arc::new(SaStore::new());
    let md5 = AuthKey::new(AuthAlgorithm::HmacMd5_96, vec![0x44; 16]).expect("valid MD5 key");
    let said = SaId::new(LOCAL, IPPROTO_AH, 0x2002);
    store.insert(SecurityAssociation::new(said, PEER).with_auth(md5.clone()));
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let total = 24 + payload.len(); // AH + payload
    let ip_header = build_ipv4_header(PEER, LOCAL, IPPROTO_AH, total);
    let ah = build_ah(0x2002, 1, IPPROTO_UDP, &ip_header, &payload, &md5);

    let mut pkt = ip_header;
    pkt.extend_from_slice(&ah);
    pkt.extend_from_slice(&payload);

    let outcome = engine.receive(PacketIn::plain(pkt));
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);

    let delivered = sink.last();
    let hdr = Ipv4Header::parse(&delivered).expect("delivered packet parses");
    assert_eq!(hdr.protocol, IPPROTO_UDP);
    assert_eq!(&delivered[hdr.header_len..], &payload[..]);
}

#[test]
fn test_esp_null_cipher_auth_only() {
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_ESP, 0x3003);
    store.insert(
        SecurityAssociation::new(said, PEER)
            .with_auth(sha1_key())
            .with_cipher(CipherKey::null()),
    );
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let body = build_esp(
        0x3003,
        1,
        &[],
        &payload,
        IPPROTO_UDP,
        &CipherKey::null(),
        Some(&sha1_key()),
    )
    .expect("ESP build");

    let outcome = engine.receive(PacketIn::plain(esp_packet(PEER, LOCAL, &body)));
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);
    let delivered = sink.last();
    assert_eq!(&delivered[20..], &payload[..]);
}

//
// Test Cases - Authentication and anti-replay ordering
//

#[test]
fn test_corrupted_icv_rejected() {
    let store = Arc::new(SaStore::new());
    insert_esp_sa(&store, 0x1001);
    let (sink, engine) = make_engine(store);

    let mut pkt = transport_esp_packet(0x1001, 1, &udp_payload(), IPPROTO_UDP);
    let tail = pkt.len() - 1;
    pkt[tail] ^= 0xff;

    let outcome = engine.receive(PacketIn::plain(pkt));
    assert!(matches!(outcome, RunOutcome::Dropped(Error::AuthFailed)));
    assert_eq!(sink.count(), 0);
    assert_eq!(engine.metrics().drop_count(DropKind::AuthFailed), 1);
}

#[test]
fn test_forged_packet_does_not_advance_window() {
    // A forged packet with a fresh sequence number and a bad digest
    // must not consume that sequence number.
    let store = Arc::new(SaStore::new());
    insert_esp_sa(&store, 0x1001);
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let mut forged = transport_esp_packet(0x1001, 7, &payload, IPPROTO_UDP);
    let tail = forged.len() - 1;
    forged[tail] ^= 0xff;

    let outcome = engine.receive(PacketIn::plain(forged));
    assert!(matches!(outcome, RunOutcome::Dropped(Error::AuthFailed)));

    // The legitimate packet with the same sequence number still goes
    // through.
    let genuine = transport_esp_packet(0x1001, 7, &payload, IPPROTO_UDP);
    let outcome = engine.receive(PacketIn::plain(genuine));
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);
    assert_eq!(sink.count(), 1);
}

#[test]
fn test_replayed_packet_rejected_before_auth() {
    let store = Arc::new(SaStore::new());
    insert_esp_sa(&store, 0x1001);
    let (sink, engine) = make_engine(store);

    let pkt = transport_esp_packet(0x1001, 3, &udp_payload(), IPPROTO_UDP);
    assert!(matches!(
        engine.receive(PacketIn::plain(pkt.clone())),
        RunOutcome::Delivered
    ));

    // Same packet again: the pre-authentication check rejects it.
    let outcome = engine.receive(PacketIn::plain(pkt));
    assert!(matches!(
        outcome,
        RunOutcome::Dropped(Error::ReplayRejected(3))
    ));
    assert_eq!(sink.count(), 1);
    assert_eq!(engine.metrics().drop_count(DropKind::ReplayRejected), 1);
}

#[test]
fn test_out_of_order_within_window_delivered() {
    let store = Arc::new(SaStore::new());
    insert_esp_sa(&store, 0x1001);
    let (sink, engine) = make_engine(store);

    for seq in [10u32, 5, 8, 3] {
        let pkt = transport_esp_packet(0x1001, seq, &udp_payload(), IPPROTO_UDP);
        let outcome = engine.receive(PacketIn::plain(pkt));
        assert!(
            matches!(outcome, RunOutcome::Delivered),
            "seq {}: {:?}",
            seq,
            outcome
        );
    }
    assert_eq!(sink.count(), 4);
}

#[test]
fn test_stale_sequence_outside_window_rejected() {
    let store = Arc::new(SaStore::new());
    insert_esp_sa(&store, 0x1001);
    let (_sink, engine) = make_engine(store);

    let pkt = transport_esp_packet(0x1001, 100, &udp_payload(), IPPROTO_UDP);
    assert!(matches!(
        engine.receive(PacketIn::plain(pkt)),
        RunOutcome::Delivered
    ));

    // 64 behind the window head: outside a 64-packet window.
    let stale = transport_esp_packet(0x1001, 36, &udp_payload(), IPPROTO_UDP);
    assert!(matches!(
        engine.receive(PacketIn::plain(stale)),
        RunOutcome::Dropped(Error::ReplayRejected(36))
    ));
}

//
// Test Cases - Policy enforcement
//

#[test]
fn test_wrong_source_address_rejected() {
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_ESP, 0x1001);
    store.insert(
        SecurityAssociation::new(said, Ipv4Addr::new(10, 0, 0, 9))
            .with_auth(sha1_key())
            .with_cipher(aes_key()),
    );
    let (sink, engine) = make_engine(store);

    let outcome = engine.receive(PacketIn::plain(transport_esp_packet(
        0x1001,
        1,
        &udp_payload(),
        IPPROTO_UDP,
    )));
    assert!(matches!(
        outcome,
        RunOutcome::Dropped(Error::PolicyMismatch(_))
    ));
    assert_eq!(sink.count(), 0);
}

#[test]
fn test_larval_and_dead_sa_not_used() {
    let store = Arc::new(SaStore::new());
    let said = insert_esp_sa(&store, 0x1001);
    let (_sink, engine) = make_engine(store.clone());

    let entry = store.lookup(&said).unwrap();
    entry.lock().unwrap().state = SaState::Larval;

    let pkt = transport_esp_packet(0x1001, 1, &udp_payload(), IPPROTO_UDP);
    assert!(matches!(
        engine.receive(PacketIn::plain(pkt.clone())),
        RunOutcome::Dropped(Error::SaNotLive(_, SaState::Larval))
    ));

    entry.lock().unwrap().state = SaState::Dead;
    assert!(matches!(
        engine.receive(PacketIn::plain(pkt)),
        RunOutcome::Dropped(Error::SaNotLive(_, SaState::Dead))
    ));
}

#[test]
fn test_chain_skip_is_policy_violation_not_auth_failure() {
    // Chain A -> B -> C; a packet presenting valid A and C headers but
    // skipping B must fail as a policy violation.
    let store = Arc::new(SaStore::new());
    let said_a = SaId::new(LOCAL, IPPROTO_ESP, 0xA);
    let said_b = SaId::new(LOCAL, IPPROTO_AH, 0xB);
    let said_c = SaId::new(LOCAL, IPPROTO_ESP, 0xC);

    store.insert(
        SecurityAssociation::new(said_a, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key())
            .with_inner_next(said_b),
    );
    store.insert(
        SecurityAssociation::new(said_b, PEER)
            .with_auth(sha1_key())
            .with_inner_next(said_c),
    );
    store.insert(
        SecurityAssociation::new(said_c, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key()),
    );
    let (sink, engine) = make_engine(store);

    // Inner ESP (C) directly inside outer ESP (A): B is skipped.
    let inner = build_esp(
        0xC,
        1,
        &[0x42; 16],
        &udp_payload(),
        IPPROTO_UDP,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("inner ESP build");
    let outer = build_esp(
        0xA,
        1,
        &[0x41; 16],
        &inner,
        IPPROTO_ESP,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("outer ESP build");

    let outcome = engine.receive(PacketIn::plain(esp_packet(PEER, LOCAL, &outer)));
    match outcome {
        RunOutcome::Dropped(Error::PolicyMismatch(_)) => {}
        other => panic!("expected policy violation, got {:?}", other),
    }
    assert_eq!(sink.count(), 0);
    assert_eq!(engine.metrics().drop_count(DropKind::AuthFailed), 0);
}

//
// Test Cases - Lifetimes
//

#[test]
fn test_hard_lifetime_expires_sa_permanently() {
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_ESP, 0x1001);
    let mut sa = SecurityAssociation::new(said, PEER)
        .with_auth(sha1_key())
        .with_cipher(aes_key());
    sa.lifetime.bytes = LifetimeLimit::hard(1);
    store.insert(sa);
    let (sink, engine) = make_engine(store.clone());

    // First packet passes (counters are evaluated before any usage).
    let pkt = transport_esp_packet(0x1001, 1, &udp_payload(), IPPROTO_UDP);
    assert!(matches!(
        engine.receive(PacketIn::plain(pkt)),
        RunOutcome::Delivered
    ));

    // Second packet finds the byte counter over the hard limit.
    let pkt = transport_esp_packet(0x1001, 2, &udp_payload(), IPPROTO_UDP);
    assert!(matches!(
        engine.receive(PacketIn::plain(pkt)),
        RunOutcome::Dropped(Error::LifetimeExpired("bytes"))
    ));

    // The SA is now DEAD, permanently unusable.
    let entry = store.lookup(&said).unwrap();
    assert_eq!(entry.lock().unwrap().state, SaState::Dead);
    let pkt = transport_esp_packet(0x1001, 3, &udp_payload(), IPPROTO_UDP);
    assert!(matches!(
        engine.receive(PacketIn::plain(pkt)),
        RunOutcome::Dropped(Error::SaNotLive(_, SaState::Dead))
    ));
    assert_eq!(sink.count(), 1);
}

//
// Test Cases - Nested decapsulation
//

#[test]
fn test_nested_esp_ipcomp_esp_unwraps_to_plain_ip() {
    // Outermost ESP, then IPCOMP, then ESP, then the UDP datagram.
    let store = Arc::new(SaStore::new());
    let said_outer = SaId::new(LOCAL, IPPROTO_ESP, 0x10);
    let said_comp = SaId::new(LOCAL, IPPROTO_COMP, CPI_DEFLATE as u32);
    let said_inner = SaId::new(LOCAL, IPPROTO_ESP, 0x30);

    store.insert(
        SecurityAssociation::new(said_outer, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key())
            .with_inner_next(said_comp),
    );
    store.insert(SecurityAssociation::new(said_comp, PEER).with_inner_next(said_inner));
    store.insert(
        SecurityAssociation::new(said_inner, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key()),
    );
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let inner = build_esp(
        0x30,
        1,
        &[0x43; 16],
        &payload,
        IPPROTO_UDP,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("inner ESP build");
    let compressed = build_ipcomp(IPPROTO_ESP, CPI_DEFLATE, &inner);
    let outer = build_esp(
        0x10,
        1,
        &[0x44; 16],
        &compressed,
        IPPROTO_COMP,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("outer ESP build");

    let outcome = engine.receive(PacketIn::plain(esp_packet(PEER, LOCAL, &outer)));
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);
    assert_eq!(sink.count(), 1, "delivered exactly once");

    let delivered = sink.last();
    let hdr = Ipv4Header::parse(&delivered).expect("delivered packet parses");
    assert_eq!(hdr.protocol, IPPROTO_UDP);
    assert_eq!(&delivered[hdr.header_len..], &payload[..]);
}

#[test]
fn test_ipcomp_entry_packet_decompressed() {
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_COMP, CPI_DEFLATE as u32);
    store.insert(SecurityAssociation::new(said, PEER));
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let body = build_ipcomp(IPPROTO_UDP, CPI_DEFLATE, &payload);
    let mut pkt = build_ipv4_header(PEER, LOCAL, IPPROTO_COMP, body.len());
    pkt.extend_from_slice(&body);

    let outcome = engine.receive(PacketIn::plain(pkt));
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);

    let delivered = sink.last();
    let hdr = Ipv4Header::parse(&delivered).expect("delivered packet parses");
    assert_eq!(hdr.protocol, IPPROTO_UDP);
    assert_eq!(&delivered[hdr.header_len..], &payload[..]);
}

//
// Test Cases - Tunnel mode
//

/// Tunnel fixture: ESP SA chained to an IPIP SA with subnet policy
fn tunnel_store(tunnel: Option<TunnelPolicy>) -> Arc<SaStore> {
    let store = Arc::new(SaStore::new());
    let said_esp = SaId::new(LOCAL, IPPROTO_ESP, 0x7007);
    let said_tun = SaId::new(LOCAL, IPPROTO_IPIP, 0x7007);

    store.insert(
        SecurityAssociation::new(said_esp, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key())
            .with_inner_next(said_tun),
    );
    let mut tun_sa = SecurityAssociation::new(said_tun, PEER);
    tun_sa.tunnel = tunnel;
    store.insert(tun_sa);
    store
}

fn subnet(a: u8, b: u8, c: u8) -> Subnet {
    Subnet::new(Ipv4Addr::new(a, b, c, 0), Ipv4Addr::new(255, 255, 255, 0))
}

fn tunnel_packet(inner_src: Ipv4Addr, inner_dst: Ipv4Addr) -> Vec<u8> {
    let payload = udp_payload();
    let mut inner = build_ipv4_header(inner_src, inner_dst, IPPROTO_UDP, payload.len());
    inner.extend_from_slice(&payload);

    let body = build_esp(
        0x7007,
        1,
        &[0x45; 16],
        &inner,
        IPPROTO_IPIP,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("tunnel ESP build");
    esp_packet(PEER, LOCAL, &body)
}

#[test]
fn test_tunnel_mode_delivers_inner_packet() {
    let policy = TunnelPolicy {
        src: subnet(192, 168, 1),
        dst: subnet(192, 168, 2),
    };
    let store = tunnel_store(Some(policy));
    let (sink, engine) = make_engine(store);

    let inner_src = Ipv4Addr::new(192, 168, 1, 5);
    let inner_dst = Ipv4Addr::new(192, 168, 2, 7);
    let outcome = engine.receive(PacketIn::plain(tunnel_packet(inner_src, inner_dst)));
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);

    let delivered = sink.last();
    let hdr = Ipv4Header::parse(&delivered).expect("delivered packet parses");
    assert_eq!(hdr.src, inner_src);
    assert_eq!(hdr.dst, inner_dst);
    assert_eq!(hdr.protocol, IPPROTO_UDP);
}

#[test]
fn test_tunnel_mode_rejects_inner_flow_outside_policy() {
    let policy = TunnelPolicy {
        src: subnet(192, 168, 1),
        dst: subnet(192, 168, 2),
    };
    let store = tunnel_store(Some(policy));
    let (sink, engine) = make_engine(store);

    // Inner source outside 192.168.1.0/24.
    let outcome = engine.receive(PacketIn::plain(tunnel_packet(
        Ipv4Addr::new(172, 16, 0, 1),
        Ipv4Addr::new(192, 168, 2, 7),
    )));
    assert!(matches!(
        outcome,
        RunOutcome::Dropped(Error::PolicyMismatch(_))
    ));
    assert_eq!(sink.count(), 0);
}

//
// Test Cases - NAT traversal
//

#[test]
fn test_natt_esp_in_udp_transport() {
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_ESP, 0x1001);
    store.insert(
        SecurityAssociation::new(said, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key())
            .with_natt(NattType::EspInUdp),
    );
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let body = build_esp(
        0x1001,
        1,
        &[0x46; 16],
        &payload,
        IPPROTO_UDP,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("ESP build");

    // Outer UDP wrapping on port 4500.
    let mut wrapped = Vec::new();
    wrapped.extend_from_slice(&4500u16.to_be_bytes());
    wrapped.extend_from_slice(&4500u16.to_be_bytes());
    wrapped.extend_from_slice(&((8 + body.len()) as u16).to_be_bytes());
    wrapped.extend_from_slice(&[0, 0]);
    wrapped.extend_from_slice(&body);

    let mut pkt = build_ipv4_header(PEER, LOCAL, IPPROTO_UDP, wrapped.len());
    pkt.extend_from_slice(&wrapped);

    let encap = UdpEncap {
        kind: NattType::EspInUdp,
        sport: 4500,
        dport: 4500,
    };
    let outcome = engine.receive(PacketIn::udp_encapsulated(pkt, encap));
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);

    let delivered = sink.last();
    let hdr = Ipv4Header::parse(&delivered).expect("delivered packet parses");
    assert_eq!(hdr.protocol, IPPROTO_UDP);
    // Transport-mode NAT-T fixup zeroed the inner UDP checksum.
    assert_eq!(&delivered[hdr.header_len + 6..hdr.header_len + 8], &[0, 0]);
    assert_eq!(
        &delivered[hdr.header_len + 8..],
        &payload[8..],
        "UDP payload intact"
    );
}

#[test]
fn test_natt_binding_mismatch_rejected() {
    // SA negotiated without NAT-T must refuse a UDP-encapsulated packet.
    let store = Arc::new(SaStore::new());
    insert_esp_sa(&store, 0x1001); // natt = None
    let (_sink, engine) = make_engine(store);

    let body = build_esp(
        0x1001,
        1,
        &[0x47; 16],
        &udp_payload(),
        IPPROTO_UDP,
        &aes_key(),
        Some(&sha1_key()),
    )
    .expect("ESP build");

    let mut wrapped = Vec::new();
    wrapped.extend_from_slice(&4500u16.to_be_bytes());
    wrapped.extend_from_slice(&4500u16.to_be_bytes());
    wrapped.extend_from_slice(&((8 + body.len()) as u16).to_be_bytes());
    wrapped.extend_from_slice(&[0, 0]);
    wrapped.extend_from_slice(&body);

    let mut pkt = build_ipv4_header(PEER, LOCAL, IPPROTO_UDP, wrapped.len());
    pkt.extend_from_slice(&wrapped);

    let encap = UdpEncap {
        kind: NattType::EspInUdp,
        sport: 4500,
        dport: 4500,
    };
    let outcome = engine.receive(PacketIn::udp_encapsulated(pkt, encap));
    assert!(matches!(
        outcome,
        RunOutcome::Dropped(Error::PolicyMismatch(_))
    ));
}

//
// Test Cases - Suspension for offloaded authentication
//

#[test]
fn test_offloaded_auth_suspends_and_resumes() {
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_ESP, 0x1001);
    store.insert(
        SecurityAssociation::new(said, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key())
            .with_auth_offloaded(),
    );
    let (sink, engine) = make_engine(store);

    let payload = udp_payload();
    let pkt = transport_esp_packet(0x1001, 1, &payload, IPPROTO_UDP);

    let mut suspended = match engine.receive(PacketIn::plain(pkt)) {
        RunOutcome::Suspended(s) => s,
        other => panic!("expected suspension, got {:?}", other),
    };
    assert_eq!(engine.in_flight(), 1);
    assert_eq!(suspended.sa_id(), Some(said));

    // Play the accelerator: digest the authenticated region.
    let region = suspended.auth_data().expect("auth region available").to_vec();
    suspended.supply_digest(sha1_key().digest(&[&region]));

    let outcome = engine.resume(suspended);
    assert!(matches!(outcome, RunOutcome::Delivered), "{:?}", outcome);
    assert_eq!(sink.count(), 1);
    assert_eq!(engine.in_flight(), 0);

    let delivered = sink.last();
    assert_eq!(&delivered[20..], &payload[..]);
}

#[test]
fn test_resume_after_concurrent_sa_deletion() {
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_ESP, 0x1001);
    store.insert(
        SecurityAssociation::new(said, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key())
            .with_auth_offloaded(),
    );
    let (sink, engine) = make_engine(store.clone());

    let pkt = transport_esp_packet(0x1001, 1, &udp_payload(), IPPROTO_UDP);
    let mut suspended = match engine.receive(PacketIn::plain(pkt)) {
        RunOutcome::Suspended(s) => s,
        other => panic!("expected suspension, got {:?}", other),
    };

    // The SA goes away while the packet is parked.
    store.delete_chain(&said);

    let region = suspended.auth_data().expect("auth region available").to_vec();
    suspended.supply_digest(sha1_key().digest(&[&region]));

    let outcome = engine.resume(suspended);
    assert!(matches!(
        outcome,
        RunOutcome::Dropped(Error::SaNotLive(_, SaState::Dead))
    ));
    assert_eq!(sink.count(), 0);
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn test_post_auth_replay_commit_failure_expires_sa() {
    // Two packets with the same sequence number, both past the
    // pre-auth check thanks to suspension. The second to commit hits
    // the post-authentication window update, which is fatal to the SA.
    let store = Arc::new(SaStore::new());
    let said = SaId::new(LOCAL, IPPROTO_ESP, 0x1001);
    store.insert(
        SecurityAssociation::new(said, PEER)
            .with_auth(sha1_key())
            .with_cipher(aes_key())
            .with_auth_offloaded(),
    );
    let (sink, engine) = make_engine(store.clone());

    let payload = udp_payload();
    let pkt = transport_esp_packet(0x1001, 5, &payload, IPPROTO_UDP);

    let mut first = match engine.receive(PacketIn::plain(pkt.clone())) {
        RunOutcome::Suspended(s) => s,
        other => panic!("expected suspension, got {:?}", other),
    };
    let mut second = match engine.receive(PacketIn::plain(pkt)) {
        RunOutcome::Suspended(s) => s,
        other => panic!("expected suspension, got {:?}", other),
    };

    let region = first.auth_data().expect("auth region").to_vec();
    first.supply_digest(sha1_key().digest(&[&region]));
    let region = second.auth_data().expect("auth region").to_vec();
    second.supply_digest(sha1_key().digest(&[&region]));

    // First commit wins and is delivered.
    assert!(matches!(engine.resume(first), RunOutcome::Delivered));

    // Second commit fails post-authentication: rolled, SA expired.
    let outcome = engine.resume(second);
    assert!(matches!(
        outcome,
        RunOutcome::Dropped(Error::ReplayRolled(5))
    ));
    assert_eq!(sink.count(), 1);

    let entry = store.lookup(&said).unwrap();
    assert_eq!(entry.lock().unwrap().state, SaState::Dead);
}
