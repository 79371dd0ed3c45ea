//! Peer Table
//!
//! Every known peer, its Noise session, its bearer (if directly connected)
//! and routing metadata. The table is the sole owner of sessions and
//! bearers; callers only borrow them for the duration of one call.
//!
//! Backed by a `DashMap`, so relay, session and sweep paths may use it
//! concurrently. No method holds a shard guard while calling back into the
//! table.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::crypto::{Session, SessionInfo, SessionPolicy, SessionState};
use crate::identity::{PeerId, PUBLIC_KEY_LEN};
use crate::relay::OutboundQueue;

/// Connection state for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,    // Known through relayed traffic, no bearer
    Connected,     // Direct bearer, no session yet
    Authenticated, // Noise session established
}

/// A live bearer owned by the peer table. Dropping it cancels the bearer's
/// reader task and closes its outbound queue.
pub struct BearerHandle {
    pub address: String,
    pub bearer_id: u64,
    pub mtu: usize,
    pub queue: Arc<OutboundQueue>,
    _cancel: oneshot::Sender<()>,
}

impl BearerHandle {
    pub fn new(address: String, bearer_id: u64, mtu: usize, queue: Arc<OutboundQueue>, cancel: oneshot::Sender<()>) -> Self {
        Self {
            address,
            bearer_id,
            mtu,
            queue,
            _cancel: cancel,
        }
    }
}

impl Drop for BearerHandle {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl std::fmt::Debug for BearerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerHandle")
            .field("address", &self.address)
            .field("bearer_id", &self.bearer_id)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

/// Peer data held in the table
#[derive(Debug)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub nickname: Option<String>,
    pub session: Session,
    pub bearer: Option<BearerHandle>,
    pub rssi: Option<i16>,
    pub noise_public_key: Option<[u8; PUBLIC_KEY_LEN]>,
    pub signing_public_key: Option<[u8; PUBLIC_KEY_LEN]>,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub message_count: u64,
    auth_failures: VecDeque<Instant>,
}

impl PeerEntry {
    fn new(peer_id: PeerId, now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            peer_id,
            nickname: None,
            session: Session::new(peer_id),
            bearer: None,
            rssi: None,
            noise_public_key: None,
            signing_public_key: None,
            last_seen: now,
            last_seen_at: wall,
            first_seen_at: wall,
            message_count: 0,
            auth_failures: VecDeque::new(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.session.is_established() {
            ConnectionState::Authenticated
        } else if self.bearer.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Discovered
        }
    }

    /// Connection quality based on RSSI and connection state
    pub fn link_quality(&self) -> f32 {
        match self.connection_state() {
            ConnectionState::Authenticated | ConnectionState::Connected if self.bearer.is_some() => {
                // Typical BLE RSSI range: -100 to -30 dBm
                match self.rssi {
                    Some(rssi) => ((rssi as f32 + 100.0) / 70.0).clamp(0.0, 1.0),
                    None => 0.8,
                }
            }
            ConnectionState::Authenticated => 0.5,
            _ => 0.0,
        }
    }

    fn info(&self, blocked: bool) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id,
            nickname: self.nickname.clone(),
            connection_state: self.connection_state(),
            session_state: self.session.state(),
            link_address: self.bearer.as_ref().map(|b| b.address.clone()),
            rssi: self.rssi,
            link_quality: self.link_quality(),
            noise_public_key: self.noise_public_key.map(hex::encode),
            last_seen: self.last_seen_at,
            first_seen: self.first_seen_at,
            message_count: self.message_count,
            blocked,
        }
    }
}

/// Point-in-time view of one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub nickname: Option<String>,
    pub connection_state: ConnectionState,
    pub session_state: SessionState,
    pub link_address: Option<String>,
    pub rssi: Option<i16>,
    pub link_quality: f32,
    pub noise_public_key: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub message_count: u64,
    pub blocked: bool,
}

/// Table contents at the time `PeerTable::snapshot` was called. Iterating
/// it any number of times yields the same peers.
#[derive(Debug, Clone, Default)]
pub struct PeerSnapshot {
    peers: Vec<PeerInfo>,
}

impl PeerSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, PeerInfo> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl IntoIterator for PeerSnapshot {
    type Item = PeerInfo;
    type IntoIter = std::vec::IntoIter<PeerInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.into_iter()
    }
}

impl<'a> IntoIterator for &'a PeerSnapshot {
    type Item = &'a PeerInfo;
    type IntoIter = std::slice::Iter<'a, PeerInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}

/// Auth-failure escalation policy
#[derive(Debug, Clone)]
pub struct BlockPolicy {
    pub threshold: usize,
    pub window: Duration,
    pub duration: Duration,
}

pub struct PeerTable {
    local_id: PeerId,
    peers: DashMap<PeerId, PeerEntry>,
    /// Block deadlines, kept apart from the entries so eviction cannot
    /// lift a block
    blocked: DashMap<PeerId, Instant>,
}

impl PeerTable {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: DashMap::new(),
            blocked: DashMap::new(),
        }
    }

    /// Add a peer or refresh it. A new bearer replaces (and closes) any
    /// previous one, and the session bound to the old bearer is torn down.
    /// Returns `true` if the peer was not known before.
    pub fn upsert(&self, peer_id: PeerId, bearer: Option<BearerHandle>, now: Instant) -> bool {
        if peer_id == self.local_id {
            return false;
        }

        let mut is_new = false;
        let mut entry = self.peers.entry(peer_id).or_insert_with(|| {
            is_new = true;
            PeerEntry::new(peer_id, now)
        });
        entry.last_seen = now;
        entry.last_seen_at = Utc::now();

        if let Some(bearer) = bearer {
            let replaced = entry
                .bearer
                .as_ref()
                .is_some_and(|old| old.bearer_id != bearer.bearer_id);
            if replaced {
                log::info!("Peer {} moved to a new bearer ({}), resetting session", peer_id, bearer.address);
                entry.session.teardown();
            }
            entry.bearer = Some(bearer);
        }

        if is_new {
            log::info!("Discovered new peer: {}", peer_id);
        }
        is_new
    }

    /// Record announced identity data. Returns `true` if anything changed.
    pub fn update_identity(
        &self,
        peer_id: PeerId,
        nickname: &str,
        noise_public_key: [u8; PUBLIC_KEY_LEN],
        signing_public_key: [u8; PUBLIC_KEY_LEN],
    ) -> bool {
        let Some(mut entry) = self.peers.get_mut(&peer_id) else {
            return false;
        };
        let changed = entry.nickname.as_deref() != Some(nickname)
            || entry.noise_public_key != Some(noise_public_key)
            || entry.signing_public_key != Some(signing_public_key);
        entry.nickname = Some(nickname.to_string());
        entry.noise_public_key = Some(noise_public_key);
        entry.signing_public_key = Some(signing_public_key);
        changed
    }

    pub fn mark_seen(&self, peer_id: PeerId, now: Instant) {
        if let Some(mut entry) = self.peers.get_mut(&peer_id) {
            entry.last_seen = now;
            entry.last_seen_at = Utc::now();
        }
    }

    pub fn update_rssi(&self, peer_id: PeerId, rssi: i16) {
        if let Some(mut entry) = self.peers.get_mut(&peer_id) {
            entry.rssi = Some(rssi);
        }
    }

    pub fn increment_message_count(&self, peer_id: PeerId) {
        if let Some(mut entry) = self.peers.get_mut(&peer_id) {
            entry.message_count += 1;
        }
    }

    /// Remove a peer, dropping its session and bearer
    pub fn evict(&self, peer_id: &PeerId) -> bool {
        match self.peers.remove(peer_id) {
            Some((_, entry)) => {
                log::debug!("Evicted peer {} ({:?})", peer_id, entry.nickname);
                true
            }
            None => false,
        }
    }

    /// Drop the bearer of `peer_id` if it is still `bearer_id`, tearing
    /// down the session that ran over it
    pub fn detach_bearer(&self, peer_id: &PeerId, bearer_id: u64) -> bool {
        let Some(mut entry) = self.peers.get_mut(peer_id) else {
            return false;
        };
        if entry.bearer.as_ref().map(|b| b.bearer_id) != Some(bearer_id) {
            return false;
        }
        entry.bearer = None;
        entry.session.teardown();
        true
    }

    /// Evict peers with no traffic for `liveness_timeout` and forget
    /// blocks that have run out. Blocks of evicted peers stay in force.
    pub fn sweep_expired(&self, now: Instant, liveness_timeout: Duration) -> Vec<PeerId> {
        let mut expired = Vec::new();
        self.peers.retain(|peer_id, entry| {
            if now.duration_since(entry.last_seen) < liveness_timeout {
                return true;
            }
            log::debug!("Removed offline peer: {}", peer_id);
            expired.push(*peer_id);
            false
        });
        self.blocked.retain(|_, until| now < *until);
        expired
    }

    /// Fail handshakes that have been pending too long
    pub fn expire_handshakes(&self, policy: &SessionPolicy, now: Instant) -> Vec<PeerId> {
        let mut expired = Vec::new();
        for mut entry in self.peers.iter_mut() {
            if entry.session.check_timeout(policy, now) {
                expired.push(*entry.key());
            }
        }
        expired
    }

    /// Run `f` on the session for `peer_id`, creating the entry (and an
    /// `Uninitialized` session) if needed. There is only ever one session
    /// per peer. `f` must not call back into the table.
    pub fn with_session<R>(&self, peer_id: PeerId, now: Instant, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut entry = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| PeerEntry::new(peer_id, now));
        f(&mut entry.session)
    }

    pub fn session_state(&self, peer_id: &PeerId) -> Option<SessionState> {
        self.peers.get(peer_id).map(|entry| entry.session.state())
    }

    pub fn session_info(&self, peer_id: &PeerId) -> Option<SessionInfo> {
        self.peers.get(peer_id).map(|entry| entry.session.info())
    }

    /// Static key negotiated by the peer's Established session
    pub fn remote_static_key(&self, peer_id: &PeerId) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.peers
            .get(peer_id)
            .and_then(|entry| entry.session.remote_static_key().copied())
    }

    pub fn teardown(&self, peer_id: &PeerId) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.session.teardown();
        }
    }

    /// Signing key from the announce, or from the handshake identity proof
    pub fn signing_key(&self, peer_id: &PeerId) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.peers.get(peer_id).and_then(|entry| {
            entry
                .session
                .remote_proof()
                .map(|proof| proof.signing_public_key)
                .or(entry.signing_public_key)
        })
    }

    /// Count an AuthError from `peer_id`. Returns `true` if the peer just
    /// became blocked; its session is torn down in that case.
    pub fn record_auth_failure(&self, peer_id: &PeerId, policy: &BlockPolicy, now: Instant) -> bool {
        let Some(mut entry) = self.peers.get_mut(peer_id) else {
            return false;
        };
        while let Some(oldest) = entry.auth_failures.front() {
            if now.duration_since(*oldest) >= policy.window {
                entry.auth_failures.pop_front();
            } else {
                break;
            }
        }
        entry.auth_failures.push_back(now);
        if entry.auth_failures.len() < policy.threshold {
            return false;
        }
        entry.auth_failures.clear();
        entry.session.teardown();
        self.blocked.insert(*peer_id, now + policy.duration);
        log::warn!("Blocking peer {} for {:?} after repeated auth failures", peer_id, policy.duration);
        true
    }

    pub fn is_blocked(&self, peer_id: &PeerId, now: Instant) -> bool {
        let until = match self.blocked.get(peer_id) {
            Some(until) => *until,
            None => return false,
        };
        if now < until {
            return true;
        }
        self.blocked.remove_if(peer_id, |_, until| now >= *until);
        false
    }

    fn blocked_now(&self, peer_id: &PeerId) -> bool {
        self.blocked.get(peer_id).is_some_and(|until| Instant::now() < *until)
    }

    /// Peers with an open bearer
    pub fn neighbours(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|entry| entry.bearer.is_some())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn is_neighbour(&self, peer_id: &PeerId) -> bool {
        self.peers.get(peer_id).is_some_and(|entry| entry.bearer.is_some())
    }

    /// Outbound queue and MTU of a neighbour's bearer
    pub fn bearer_queue(&self, peer_id: &PeerId) -> Option<(Arc<OutboundQueue>, usize)> {
        self.peers
            .get(peer_id)
            .and_then(|entry| entry.bearer.as_ref().map(|b| (b.queue.clone(), b.mtu)))
    }

    pub fn has_bearer_to(&self, address: &str) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.bearer.as_ref().is_some_and(|b| b.address == address))
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.get(peer_id).map(|entry| entry.info(self.blocked_now(peer_id)))
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peers: self
                .peers
                .iter()
                .map(|entry| entry.info(self.blocked_now(entry.key())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Remove everything, returning the peers that were known
    pub fn clear(&self) -> Vec<PeerId> {
        let ids: Vec<PeerId> = self.peers.iter().map(|entry| *entry.key()).collect();
        self.peers.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 8])
    }

    fn bearer(id: u64) -> (BearerHandle, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let handle = BearerHandle::new(format!("addr-{}", id), id, 512, Arc::new(OutboundQueue::new(8)), tx);
        (handle, rx)
    }

    #[test]
    fn test_upsert_ignores_self_and_reports_new() {
        let table = PeerTable::new(peer(0));
        let now = Instant::now();
        assert!(!table.upsert(peer(0), None, now));
        assert!(table.upsert(peer(1), None, now));
        assert!(!table.upsert(peer(1), None, now));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&peer(1)).unwrap().connection_state, ConnectionState::Discovered);
    }

    #[test]
    fn test_replacing_bearer_closes_old_and_resets_session() {
        let table = PeerTable::new(peer(0));
        let now = Instant::now();
        let (first, mut first_cancel) = bearer(1);
        let first_queue = first.queue.clone();
        table.upsert(peer(1), Some(first), now);
        let first_session = table.session_info(&peer(1)).unwrap().session_id;

        let (second, _second_cancel) = bearer(2);
        table.upsert(peer(1), Some(second), now);

        assert!(first_queue.is_closed());
        assert!(matches!(first_cancel.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert_ne!(table.session_info(&peer(1)).unwrap().session_id, first_session);
        assert_eq!(table.get(&peer(1)).unwrap().link_address.as_deref(), Some("addr-2"));
    }

    #[test]
    fn test_detach_only_matching_bearer() {
        let table = PeerTable::new(peer(0));
        let now = Instant::now();
        let (handle, _cancel) = bearer(7);
        table.upsert(peer(1), Some(handle), now);

        assert!(!table.detach_bearer(&peer(1), 6));
        assert!(table.is_neighbour(&peer(1)));
        assert!(table.detach_bearer(&peer(1), 7));
        assert!(!table.is_neighbour(&peer(1)));
        assert!(table.contains(&peer(1)));
    }

    #[test]
    fn test_sweep_expired() {
        let table = PeerTable::new(peer(0));
        let start = Instant::now();
        table.upsert(peer(1), None, start);
        table.upsert(peer(2), None, start);
        table.mark_seen(peer(2), start + Duration::from_secs(60));

        let expired = table.sweep_expired(start + Duration::from_secs(90), Duration::from_secs(90));
        assert_eq!(expired, vec![peer(1)]);
        assert!(table.contains(&peer(2)));
    }

    #[test]
    fn test_one_session_per_peer() {
        let table = PeerTable::new(peer(0));
        let now = Instant::now();
        let first = table.with_session(peer(1), now, |s| s.id());
        let second = table.with_session(peer(1), now, |s| s.id());
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_snapshot_is_restartable_and_static() {
        let table = PeerTable::new(peer(0));
        let now = Instant::now();
        table.upsert(peer(1), None, now);
        table.upsert(peer(2), None, now);

        let snapshot = table.snapshot();
        table.upsert(peer(3), None, now);

        assert_eq!(snapshot.iter().count(), 2);
        assert_eq!(snapshot.iter().count(), 2);
        let ids: Vec<_> = snapshot.into_iter().map(|p| p.peer_id).collect();
        assert!(!ids.contains(&peer(3)));
    }

    #[test]
    fn test_auth_failures_escalate_to_block() {
        let table = PeerTable::new(peer(0));
        let now = Instant::now();
        table.upsert(peer(1), None, now);
        let policy = BlockPolicy {
            threshold: 3,
            window: Duration::from_secs(60),
            duration: Duration::from_secs(300),
        };

        assert!(!table.record_auth_failure(&peer(1), &policy, now));
        assert!(!table.record_auth_failure(&peer(1), &policy, now));
        assert!(table.record_auth_failure(&peer(1), &policy, now));
        assert!(table.is_blocked(&peer(1), now));
        assert!(table.get(&peer(1)).unwrap().blocked);
        assert!(!table.is_blocked(&peer(1), now + policy.duration));
    }

    #[test]
    fn test_block_outlives_liveness_sweep() {
        let table = PeerTable::new(peer(0));
        let now = Instant::now();
        table.upsert(peer(1), None, now);
        let policy = BlockPolicy {
            threshold: 1,
            window: Duration::from_secs(60),
            duration: Duration::from_secs(300),
        };
        assert!(table.record_auth_failure(&peer(1), &policy, now));

        let liveness = Duration::from_secs(90);
        let evicted = table.sweep_expired(now + Duration::from_secs(91), liveness);
        assert_eq!(evicted, vec![peer(1)]);
        assert!(!table.contains(&peer(1)));
        assert!(table.is_blocked(&peer(1), now + Duration::from_secs(100)));

        // Coming back through relayed traffic does not lift the block.
        table.upsert(peer(1), None, now + Duration::from_secs(120));
        assert!(table.is_blocked(&peer(1), now + Duration::from_secs(120)));

        table.sweep_expired(now + policy.duration, liveness);
        assert!(!table.is_blocked(&peer(1), now + policy.duration));
    }

    #[test]
    fn test_link_quality_from_rssi() {
        let table = PeerTable::new(peer(0));
        let (handle, _cancel) = bearer(1);
        table.upsert(peer(1), Some(handle), Instant::now());
        table.update_rssi(peer(1), -65);
        let info = table.get(&peer(1)).unwrap();
        assert!((info.link_quality - 0.5).abs() < 0.01);
        assert_eq!(info.connection_state, ConnectionState::Connected);
    }
}
