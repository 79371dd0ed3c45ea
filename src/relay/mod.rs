//! Relay Engine
//!
//! TTL-bounded store-and-forward: for every packet it decides whether to
//! deliver locally, forward to neighbours, or drop. The engine owns the
//! dedup filter and the per-neighbour rate limiter; actual I/O is done by
//! the caller through the outbound queues in the peer table.

pub mod outbound;
pub mod rate_limit;

pub use outbound::OutboundQueue;
pub use rate_limit::RateLimiter;

use log::debug;
use parking_lot::Mutex;
use std::time::Instant;

use crate::config::MeshConfig;
use crate::dedup::{DedupFilter, DedupStats};
use crate::identity::PeerId;
use crate::protocol::{Fingerprint, Packet};

/// Forwarding half of a relay decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// The packet with its TTL already decremented
    pub packet: Packet,
    pub targets: Vec<PeerId>,
}

/// What to do with one inbound packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelayDecision {
    pub duplicate: bool,
    pub deliver: bool,
    pub forward: Option<Forward>,
    pub rate_limited: bool,
}

pub struct RelayEngine {
    local_id: PeerId,
    max_ttl: u8,
    dedup: Mutex<DedupFilter>,
    limiter: Mutex<RateLimiter>,
}

impl RelayEngine {
    pub fn new(local_id: PeerId, config: &MeshConfig, now: Instant) -> Self {
        Self {
            local_id,
            max_ttl: config.max_ttl,
            dedup: Mutex::new(DedupFilter::new(config.dedup.clone(), now)),
            limiter: Mutex::new(RateLimiter::new(
                config.relay.max_relays_per_window,
                config.relay.rate_window(),
            )),
        }
    }

    pub fn max_ttl(&self) -> u8 {
        self.max_ttl
    }

    /// Decide the fate of `packet` received from neighbour `ingress`.
    /// `neighbours` are the peers with an open bearer right now.
    pub fn process(&self, packet: &Packet, ingress: PeerId, neighbours: &[PeerId], now: Instant) -> RelayDecision {
        let fingerprint = packet.fingerprint();
        if !self.dedup.lock().check_and_insert(&fingerprint, now) {
            debug!("Dropping duplicate packet {} from {}", fingerprint, ingress);
            return RelayDecision {
                duplicate: true,
                ..RelayDecision::default()
            };
        }

        // Our own packets echoed back by a neighbour.
        if packet.sender == self.local_id {
            return RelayDecision::default();
        }

        let for_us = packet.is_addressed_to(&self.local_id);
        let mut decision = RelayDecision {
            deliver: packet.is_broadcast() || for_us,
            ..RelayDecision::default()
        };

        if for_us {
            return decision;
        }
        let Some(relayed) = packet.next_hop() else {
            return decision;
        };

        let targets = self.targets(&relayed, Some(ingress), neighbours);
        if targets.is_empty() {
            return decision;
        }
        if !self.limiter.lock().allow(ingress, now) {
            debug!("Relay budget of {} exhausted, not forwarding {}", ingress, fingerprint);
            decision.rate_limited = true;
            return decision;
        }

        decision.forward = Some(Forward {
            packet: relayed,
            targets,
        });
        decision
    }

    /// Local-origin path: record the fingerprint so echoes are dropped and
    /// return the neighbours to send to. The packet is sent as is.
    pub fn originate(&self, packet: &Packet, neighbours: &[PeerId], now: Instant) -> Vec<PeerId> {
        self.dedup.lock().insert(&packet.fingerprint(), now);
        self.targets(packet, None, neighbours)
    }

    /// Record a fingerprint that did not arrive as a single packet (a
    /// reassembled fragment set, an envelope from another transport).
    /// Returns `true` if it was new.
    pub fn observe(&self, fingerprint: &Fingerprint, now: Instant) -> bool {
        self.dedup.lock().check_and_insert(fingerprint, now)
    }

    pub fn has_seen(&self, fingerprint: &Fingerprint) -> bool {
        self.dedup.lock().test(fingerprint)
    }

    /// Periodic upkeep: filter rotation and rate-limit window reset
    pub fn maintain(&self, now: Instant) {
        self.dedup.lock().maintain(now);
        self.limiter.lock().sweep(now);
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.lock().stats()
    }

    /// Directed packets go only to the recipient when it is a neighbour;
    /// everything else floods to all neighbours but the ingress and the
    /// original sender.
    fn targets(&self, packet: &Packet, ingress: Option<PeerId>, neighbours: &[PeerId]) -> Vec<PeerId> {
        if let Some(recipient) = packet.recipient {
            if neighbours.contains(&recipient) && Some(recipient) != ingress {
                return vec![recipient];
            }
        }
        neighbours
            .iter()
            .copied()
            .filter(|peer| Some(*peer) != ingress && *peer != packet.sender && *peer != self.local_id)
            .collect()
    }
}
