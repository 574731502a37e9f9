//! Engine configuration

/// Configuration for a [`crate::rcv::DecapEngine`]
#[derive(Debug, Clone)]
pub struct DecapConfig {
    /// Enforce inbound policy: peer source address, chain order,
    /// NAT-T binding, tunnel subnets, and the no-IPCOMP-after-IPIP
    /// rule. On by default; turning it off accepts any packet the
    /// cryptography accepts.
    pub inbound_policy_check: bool,

    /// Maximum packets in flight (processing or suspended) before new
    /// arrivals are shed
    pub max_in_flight: usize,
}

impl Default for DecapConfig {
    fn default() -> Self {
        DecapConfig {
            inbound_policy_check: true,
            max_in_flight: 1000,
        }
    }
}

impl DecapConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable inbound policy enforcement
    pub fn with_policy_check(mut self, enabled: bool) -> Self {
        self.inbound_policy_check = enabled;
        self
    }

    /// Set the in-flight packet cap
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }
}
