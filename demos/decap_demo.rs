//! Inbound Decapsulation Demo
//!
//! This example walks a handful of fabricated ESP packets through the
//! receive pipeline: a well-formed transport-mode packet, a replay of
//! it, and one with a corrupted authenticator. It prints what happens
//! to each and finishes with the engine's counters.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example decap_demo
//! ```
//!
//! Environment variables:
//!
//! ```bash
//! RUST_LOG=debug cargo run --example decap_demo   # per-packet progress
//! RUST_LOG=trace cargo run --example decap_demo   # state transitions
//! ```

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ipsec_decap::auth::{AuthAlgorithm, AuthKey};
use ipsec_decap::cipher::{CipherKey, EspCipher};
use ipsec_decap::config::DecapConfig;
use ipsec_decap::esp::build_esp;
use ipsec_decap::packet::{build_ipv4_header, Ipv4Header, IPPROTO_ESP, IPPROTO_UDP};
use ipsec_decap::rcv::{DecapEngine, IpInput, PacketIn, RunOutcome};
use ipsec_decap::sa::{SaId, SecurityAssociation};
use ipsec_decap::store::SaStore;

/// Sink that prints every delivered datagram
struct Printer {
    delivered: Mutex<usize>,
}

impl IpInput for Printer {
    fn input(&self, packet: Vec<u8>) {
        let mut n = self.delivered.lock().unwrap();
        *n += 1;
        let hdr = Ipv4Header::parse(&packet).expect("delivered packet parses");
        println!(
            "  -> IP input #{}: {} -> {}, protocol {}, {} bytes",
            *n,
            hdr.src,
            hdr.dst,
            hdr.protocol,
            packet.len()
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let local = Ipv4Addr::new(10, 0, 0, 1);
    let peer = Ipv4Addr::new(10, 0, 0, 2);
    let spi = 0x1001;

    println!("Inbound Decapsulation Demo");
    println!("==========================");
    println!("Local endpoint: {}", local);
    println!("Peer:           {}", peer);
    println!("ESP SA:         spi 0x{:08x}, HMAC-SHA1-96 + AES-128-CBC", spi);
    println!();

    // Set up the SA store and the engine
    println!("[1/3] Creating SA store and engine...");
    let auth = AuthKey::new(AuthAlgorithm::HmacSha1_96, vec![0x22; 20])?;
    let cipher = CipherKey::new(EspCipher::AesCbc, vec![0x33; 16])?;

    let store = Arc::new(SaStore::new());
    store.insert(
        SecurityAssociation::new(SaId::new(local, IPPROTO_ESP, spi), peer)
            .with_auth(auth.clone())
            .with_cipher(cipher.clone()),
    );

    let sink = Arc::new(Printer {
        delivered: Mutex::new(0),
    });
    let engine = DecapEngine::new(store, DecapConfig::default(), sink);
    println!("✓ Engine ready");
    println!();

    // Fabricate a transport-mode ESP packet around a UDP datagram
    println!("[2/3] Fabricating a transport-mode ESP packet...");
    let udp: Vec<u8> = {
        let payload = b"hello through the tunnel";
        let mut seg = Vec::new();
        seg.extend_from_slice(&4000u16.to_be_bytes());
        seg.extend_from_slice(&9000u16.to_be_bytes());
        seg.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        seg.extend_from_slice(&[0, 0]);
        seg.extend_from_slice(payload);
        seg
    };
    let body = build_esp(spi, 1, &[0x41; 16], &udp, IPPROTO_UDP, &cipher, Some(&auth))?;
    let mut wire = build_ipv4_header(peer, local, IPPROTO_ESP, body.len());
    wire.extend_from_slice(&body);
    println!("✓ {} byte ESP datagram (carrying {} bytes of UDP)", wire.len(), udp.len());
    println!();

    println!("[3/3] Driving packets through the engine...");
    println!();

    println!("Packet 1: well-formed, sequence 1");
    describe(engine.receive(PacketIn::plain(wire.clone())));

    println!("Packet 2: exact replay of packet 1");
    describe(engine.receive(PacketIn::plain(wire.clone())));

    println!("Packet 3: sequence 2, authenticator corrupted in flight");
    let mut tampered =
        build_esp(spi, 2, &[0x42; 16], &udp, IPPROTO_UDP, &cipher, Some(&auth))?;
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    let mut wire3 = build_ipv4_header(peer, local, IPPROTO_ESP, tampered.len());
    wire3.extend_from_slice(&tampered);
    describe(engine.receive(PacketIn::plain(wire3)));

    // Final statistics
    let stats = engine.metrics().snapshot();
    println!("Engine Statistics:");
    println!("  Received:  {}", stats.received);
    println!("  Delivered: {} ({} bytes)", stats.delivered, stats.delivered_bytes);
    println!("  Dropped:   {}", stats.dropped_total);
    for (kind, count) in &stats.drops {
        if *count > 0 {
            println!("    {:<20} {}", kind.as_str(), count);
        }
    }

    Ok(())
}

fn describe(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Delivered => println!("  ✓ delivered to IP input\n"),
        RunOutcome::Dropped(err) => println!("  ✗ dropped: {}\n", err),
        RunOutcome::Suspended(_) => println!("  … suspended for asynchronous work\n"),
    }
}
