//! Structured logging for the receive pipeline
//!
//! Thin helpers over the `tracing` framework so every event carries
//! the same context fields. One diagnostic is emitted per dropped
//! packet, at the drop site.
//!
//! Levels:
//!
//! - **TRACE**: state-machine transitions
//! - **DEBUG**: per-packet progress (NAT-T strip, delivery)
//! - **WARN**: policy refusals, replay rejections, soft lifetime
//! - **ERROR**: authentication failures, SA expiry

use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::sa::SaId;

/// Log a state transition
pub fn log_state_transition(from: &str, to: &str, spi: u32) {
    trace!(
        state_from = from,
        state_to = to,
        spi = %hex::encode(spi.to_be_bytes()),
        "decap state"
    );
}

/// Log the one diagnostic for a dropped packet
pub fn log_drop(err: &Error, src: &str, dst: &str) {
    match err {
        Error::AuthFailed | Error::ReplayRolled(_) | Error::LifetimeExpired(_) => {
            error!(src = src, dst = dst, reason = %err, "packet dropped");
        }
        Error::PolicyMismatch(_) | Error::ReplayRejected(_) => {
            warn!(src = src, dst = dst, reason = %err, "packet dropped");
        }
        _ => {
            debug!(src = src, dst = dst, reason = %err, "packet dropped");
        }
    }
}

/// Log a replay-window rejection before authentication
pub fn log_replay_rejected(said: &SaId, seq: u32) {
    warn!(sa = %said, seq_num = seq, "replay check rejected packet");
}

/// Log SA chain deletion caused by a fatal failure
pub fn log_sa_chain_deleted(said: &SaId, reason: &str) {
    error!(sa = %said, reason = reason, "SA chain deleted");
}

/// Log a soft lifetime crossing (rekey is due, traffic continues)
pub fn log_soft_lifetime(said: &SaId, which: &str) {
    warn!(sa = %said, limit = which, "soft lifetime reached, rekey due");
}

/// Log NAT-T UDP decapsulation at entry
pub fn log_natt_decap(sport: u16, dport: u16, stripped: usize) {
    debug!(
        sport = sport,
        dport = dport,
        stripped = stripped,
        "ESP-in-UDP encapsulation removed"
    );
}

/// Log a suspension for asynchronous work
pub fn log_suspended(said: &SaId) {
    debug!(sa = %said, "packet suspended awaiting accelerator");
}

/// Log a resumption after asynchronous work completed
pub fn log_resumed(said: &SaId) {
    debug!(sa = %said, "packet resumed");
}

/// Log hand-off of a finished packet to IP input
pub fn log_delivered(protocol: u8, bytes: usize, rounds: u32) {
    debug!(
        protocol = protocol,
        bytes = bytes,
        rounds = rounds,
        "decapsulated packet delivered"
    );
}
