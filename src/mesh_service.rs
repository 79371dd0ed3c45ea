//! Mesh Service
//!
//! The single entry point for applications. `MeshService` owns the peer
//! table, the relay engine and the reassembler, drives the link layer and
//! exposes sending, a message stream and a peer event stream.
//!
//! Every bearer gets a reader task and a writer task. Frames from one
//! bearer are handled in arrival order; all packet handling is synchronous
//! and no lock is held across an await point.

use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::MeshConfig;
use crate::crypto::{Role, SessionInfo, SessionPolicy, SessionState};
use crate::dedup::DedupStats;
use crate::error::{AuthError, CodecError, HandshakeError, LinkError, MeshError, MeshResult, SendError};
use crate::identity::{IdentityProof, LocalIdentity, PeerId, VerificationStatus};
use crate::link::{BearerConnection, DiscoveryStream, IncomingStream, Link, PeerDiscovered};
use crate::peer_table::{BearerHandle, BlockPolicy, ConnectionState, PeerInfo, PeerSnapshot, PeerTable};
use crate::protocol::packet::{compress, decompress};
use crate::protocol::{
    fragment_packet, AnnouncePayload, ContentType, Envelope, Fragment, Packet, PacketType, Reassembler,
};
use crate::relay::outbound::run_writer;
use crate::relay::{OutboundQueue, RelayEngine};
use crate::transport::TransportKind;

/// Envelope header bytes on top of the application payload
const ENVELOPE_OVERHEAD: usize = 64;

/// How long `stop` waits for Leave packets to reach the bearers
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

pub type MessageStream = BoxStream<'static, ReceivedMessage>;
pub type PeerEventStream = BoxStream<'static, PeerEvent>;

/// Destination of an outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Broadcast,
    Peer(PeerId),
}

impl Recipient {
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            Recipient::Broadcast => None,
            Recipient::Peer(peer_id) => Some(*peer_id),
        }
    }
}

impl From<PeerId> for Recipient {
    fn from(peer_id: PeerId) -> Self {
        Recipient::Peer(peer_id)
    }
}

/// Peer presence change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEvent {
    Joined {
        peer_id: PeerId,
        nickname: Option<String>,
    },
    Left {
        peer_id: PeerId,
    },
    Updated {
        peer_id: PeerId,
        connection_state: ConnectionState,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> PeerId {
        match self {
            PeerEvent::Joined { peer_id, .. } | PeerEvent::Left { peer_id } | PeerEvent::Updated { peer_id, .. } => {
                *peer_id
            }
        }
    }
}

/// An application message handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    pub via: TransportKind,
    /// Sender proven by a Noise session or a verified signature
    pub authenticated: bool,
}

/// Counter snapshot returned by `MeshService::statistics`
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatistics {
    pub peer_id: PeerId,
    pub running: bool,
    pub known_peers: usize,
    pub neighbours: usize,
    pub authenticated_peers: usize,
    pub packets_received: u64,
    pub packets_originated: u64,
    pub packets_relayed: u64,
    pub messages_delivered: u64,
    pub duplicates_dropped: u64,
    pub malformed_dropped: u64,
    /// Encrypted messages from peers without an Established session
    pub no_session_dropped: u64,
    pub rate_limited: u64,
    pub queue_overflows: u64,
    pub reassembly_dropped: u64,
    pub delivery_backlog_drops: u64,
    pub auth_failures: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    pub pending_fragment_sets: usize,
    pub dedup: DedupStats,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    packets_originated: AtomicU64,
    packets_relayed: AtomicU64,
    messages_delivered: AtomicU64,
    duplicates_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
    no_session_dropped: AtomicU64,
    rate_limited: AtomicU64,
    queue_overflows: AtomicU64,
    reassembly_dropped: AtomicU64,
    delivery_backlog_drops: AtomicU64,
    auth_failures: AtomicU64,
    handshakes_completed: AtomicU64,
    handshakes_failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Per-bearer state owned by its reader task
struct BearerState {
    bearer_id: u64,
    address: String,
    mtu: usize,
    rssi: Option<i16>,
    queue: Arc<OutboundQueue>,
    /// Peer bound by a verified announce
    peer: Option<PeerId>,
    /// Handed to the peer table on binding
    cancel: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: MeshConfig,
    identity: LocalIdentity,
    link: Arc<dyn Link>,
    peers: PeerTable,
    relay: RelayEngine,
    reassembler: Mutex<Reassembler>,
    session_policy: SessionPolicy,
    block_policy: BlockPolicy,
    messages_tx: mpsc::Sender<ReceivedMessage>,
    messages_rx: Mutex<Option<mpsc::Receiver<ReceivedMessage>>>,
    events: broadcast::Sender<PeerEvent>,
    counters: Counters,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Link addresses with an open or pending bearer, and its id
    links: Mutex<HashMap<String, u64>>,
    next_bearer: AtomicU64,
}

/// Handle to a mesh node. Clones share the same node.
#[derive(Clone)]
pub struct MeshService {
    inner: Arc<Inner>,
}

impl MeshService {
    pub fn new(config: MeshConfig, identity: LocalIdentity, link: Arc<dyn Link>) -> MeshResult<Self> {
        config.validate()?;
        let now = Instant::now();
        let local_id = identity.peer_id();
        let (messages_tx, messages_rx) = mpsc::channel(config.message_buffer);
        let (events, _) = broadcast::channel(config.event_buffer);

        let inner = Inner {
            peers: PeerTable::new(local_id),
            relay: RelayEngine::new(local_id, &config, now),
            reassembler: Mutex::new(Reassembler::new(
                config.relay.max_reassembly_sets,
                config.relay.max_reassembly_bytes,
                config.reassembly_timeout(),
            )),
            session_policy: SessionPolicy::from(&config.session),
            block_policy: BlockPolicy {
                threshold: config.session.auth_block_threshold as usize,
                window: Duration::from_secs(config.session.auth_failure_window_secs),
                duration: Duration::from_secs(config.session.auth_block_duration_secs),
            },
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            events,
            counters: Counters::default(),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            next_bearer: AtomicU64::new(1),
            config,
            identity,
            link,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.local_id()
    }

    pub fn nickname(&self) -> &str {
        &self.inner.config.nickname
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Start scanning, advertising, accepting bearers and the periodic
    /// sweeps. Starting a running service is a no-op.
    pub async fn start(&self) -> MeshResult<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Starting mesh service as {} ({})", inner.local_id(), inner.config.nickname);

        let (mut discovery, mut incoming) = match inner.open_link().await {
            Ok(streams) => streams,
            Err(e) => {
                inner.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        inner.advertise().await;

        let mut tasks = Vec::with_capacity(4);

        let node = inner.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(found) = discovery.next().await {
                node.on_discovered(found);
            }
            debug!("Discovery stream ended");
        }));

        let node = inner.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(connection) = incoming.next().await {
                let bearer_id = node.claim(&connection.address);
                node.attach(connection, bearer_id);
            }
            debug!("Incoming bearer stream ended");
        }));

        let node = inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.maintain(Instant::now());
            }
        }));

        let node = inner.clone();
        tasks.push(tokio::spawn(async move {
            let period = node.config.announce_interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.reannounce().await;
            }
        }));

        inner.tasks.lock().extend(tasks);
        info!("Mesh service started");
        Ok(())
    }

    /// Send Leave to every neighbour, drop all bearers and sessions and stop
    /// the link. The message stream stays open.
    pub async fn stop(&self) -> MeshResult<()> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Stopping mesh service");

        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Some(frame) = inner.link_local_frame(PacketType::Leave, Vec::new()) {
            let queues = inner.neighbour_queues();
            for queue in &queues {
                queue.push(frame.clone());
            }
            let flushed = tokio::time::timeout(LEAVE_FLUSH_TIMEOUT, async {
                while queues.iter().any(|queue| !queue.is_empty()) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
            .await;
            if flushed.is_err() {
                debug!("Leave not flushed to every neighbour");
            }
        }

        for peer_id in inner.peers.clear() {
            inner.emit(PeerEvent::Left { peer_id });
        }
        inner.links.lock().clear();
        inner.link.stop().await?;
        info!("Mesh service stopped");
        Ok(())
    }

    /// Originate an application message. Point-to-point messages need an
    /// Established session; if there is none a handshake is started and
    /// `SessionNotEstablished` returned.
    pub fn send_message(&self, recipient: Recipient, content_type: ContentType, payload: Vec<u8>) -> Result<(), SendError> {
        let max = self.inner.config.max_message_size;
        if payload.len() > max {
            return Err(SendError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        let envelope = Envelope::new(self.peer_id(), recipient.peer_id(), content_type, payload);
        self.inner.send_envelope(&envelope)
    }

    pub fn send_text(&self, recipient: Recipient, text: &str) -> Result<(), SendError> {
        self.send_message(recipient, ContentType::Text, text.as_bytes().to_vec())
    }

    /// Send an envelope built elsewhere, e.g. one also published on another
    /// transport. Only envelopes originated by this node are accepted.
    pub fn publish(&self, envelope: &Envelope) -> MeshResult<()> {
        if envelope.sender != self.peer_id() {
            return Err(MeshError::ForeignEnvelope(envelope.sender));
        }
        let max = self.inner.config.max_message_size;
        if envelope.payload.len() > max {
            return Err(SendError::PayloadTooLarge {
                size: envelope.payload.len(),
                max,
            }
            .into());
        }
        self.inner.send_envelope(envelope).map_err(MeshError::from)
    }

    /// Feed an envelope that arrived over another transport into the
    /// delivery path. Returns `true` if it was delivered, `false` if it was
    /// a duplicate or not addressed to this node.
    pub fn ingest_envelope(&self, envelope: Envelope, via: TransportKind) -> bool {
        let local = self.peer_id();
        if envelope.sender == local || envelope.recipient.is_some_and(|recipient| recipient != local) {
            return false;
        }
        self.inner.accept_envelope(envelope, via, false, Instant::now())
    }

    /// The decrypted application message stream. It can be taken once.
    pub fn messages(&self) -> MeshResult<MessageStream> {
        let receiver = self.inner.messages_rx.lock().take().ok_or(MeshError::StreamTaken)?;
        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        })
        .boxed())
    }

    /// A new subscription to peer presence events
    pub fn peer_events(&self) -> PeerEventStream {
        let receiver = self.inner.events.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Peer event subscriber lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub fn peers(&self) -> PeerSnapshot {
        self.inner.peers.snapshot()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.inner.peers.get(peer_id)
    }

    pub fn session_info(&self, peer_id: &PeerId) -> Option<SessionInfo> {
        self.inner.peers.session_info(peer_id)
    }

    pub fn identity_proof(&self) -> IdentityProof {
        self.inner.identity.identity_proof()
    }

    pub fn fingerprint(&self) -> String {
        self.inner.identity.fingerprint()
    }

    /// Check an out-of-band proof against the key negotiated with that peer
    pub fn verify_identity(&self, proof: &IdentityProof) -> VerificationStatus {
        let negotiated = self.inner.peers.remote_static_key(&proof.peer_id());
        proof.check_against(negotiated.as_ref())
    }

    pub fn statistics(&self) -> MeshStatistics {
        let inner = &self.inner;
        let counters = &inner.counters;
        let snapshot = inner.peers.snapshot();
        MeshStatistics {
            peer_id: inner.local_id(),
            running: self.is_running(),
            known_peers: snapshot.len(),
            neighbours: snapshot.iter().filter(|peer| peer.link_address.is_some()).count(),
            authenticated_peers: snapshot
                .iter()
                .filter(|peer| peer.session_state == SessionState::Established)
                .count(),
            packets_received: read(&counters.packets_received),
            packets_originated: read(&counters.packets_originated),
            packets_relayed: read(&counters.packets_relayed),
            messages_delivered: read(&counters.messages_delivered),
            duplicates_dropped: read(&counters.duplicates_dropped),
            malformed_dropped: read(&counters.malformed_dropped),
            no_session_dropped: read(&counters.no_session_dropped),
            rate_limited: read(&counters.rate_limited),
            queue_overflows: read(&counters.queue_overflows),
            reassembly_dropped: read(&counters.reassembly_dropped),
            delivery_backlog_drops: read(&counters.delivery_backlog_drops),
            auth_failures: read(&counters.auth_failures),
            handshakes_completed: read(&counters.handshakes_completed),
            handshakes_failed: read(&counters.handshakes_failed),
            pending_fragment_sets: inner.reassembler.lock().pending_sets(),
            dedup: inner.relay.dedup_stats(),
        }
    }
}

impl Inner {
    fn local_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_updated(&self, peer_id: PeerId) {
        if let Some(info) = self.peers.get(&peer_id) {
            self.emit(PeerEvent::Updated {
                peer_id,
                connection_state: info.connection_state,
            });
        }
    }

    fn emit_joined(&self, peer_id: PeerId) {
        let nickname = self.peers.get(&peer_id).and_then(|info| info.nickname);
        self.emit(PeerEvent::Joined { peer_id, nickname });
    }

    async fn open_link(&self) -> Result<(DiscoveryStream, IncomingStream), LinkError> {
        let discovery = self.link.start_discovery().await?;
        let incoming = self.link.incoming().await?;
        Ok((discovery, incoming))
    }

    async fn advertise(&self) {
        match self.link.advertise(self.local_id()).await {
            Ok(()) => {}
            Err(LinkError::Unsupported(reason)) => debug!("Advertising unavailable: {}", reason),
            Err(e) => warn!("Failed to advertise: {}", e),
        }
    }

    // ---- bearers ----

    /// Reserve `address` for an outgoing connection
    fn reserve(&self, address: &str) -> Option<u64> {
        let mut links = self.links.lock();
        if links.contains_key(address) {
            return None;
        }
        let bearer_id = self.next_bearer.fetch_add(1, Ordering::Relaxed);
        links.insert(address.to_string(), bearer_id);
        Some(bearer_id)
    }

    /// Record an inbound bearer; never displaces an existing reservation
    fn claim(&self, address: &str) -> u64 {
        let bearer_id = self.next_bearer.fetch_add(1, Ordering::Relaxed);
        self.links.lock().entry(address.to_string()).or_insert(bearer_id);
        bearer_id
    }

    fn release(&self, address: &str, bearer_id: u64) {
        let mut links = self.links.lock();
        if links.get(address) == Some(&bearer_id) {
            links.remove(address);
        }
    }

    /// Connect unless a bearer already exists or the other side is the one
    /// expected to connect (the lower id dials)
    fn on_discovered(self: &Arc<Self>, found: PeerDiscovered) {
        let local = self.local_id();
        if let Some(hint) = found.peer_id {
            if hint <= local {
                return;
            }
        }
        let Some(bearer_id) = self.reserve(&found.address) else {
            return;
        };

        let node = self.clone();
        tokio::spawn(async move {
            let address = found.address;
            match tokio::time::timeout(node.config.connect_timeout(), node.link.connect(&address)).await {
                Ok(Ok(connection)) => node.attach(connection, bearer_id),
                Ok(Err(e)) => {
                    debug!("Failed to connect to {}: {}", address, e);
                    node.release(&address, bearer_id);
                }
                Err(_) => {
                    debug!("Connection timeout for {}", address);
                    node.release(&address, bearer_id);
                }
            }
        });
    }

    /// Start the writer and reader for a new bearer and announce ourselves
    fn attach(self: &Arc<Self>, connection: BearerConnection, bearer_id: u64) {
        let BearerConnection {
            address,
            mtu,
            rssi,
            outbound,
            inbound,
        } = connection;
        if !self.running.load(Ordering::Acquire) {
            self.release(&address, bearer_id);
            return;
        }

        let mtu = mtu.min(self.config.mtu);
        let queue = Arc::new(OutboundQueue::new(self.config.relay.peer_queue_capacity));
        tokio::spawn(run_writer(queue.clone(), outbound, self.config.write_timeout()));
        if let Some(frame) = self.announce_frame() {
            queue.push(frame);
        }

        info!("Bearer {} open to {} (mtu {})", bearer_id, address, mtu);
        let (cancel, cancelled) = oneshot::channel();
        let state = BearerState {
            bearer_id,
            address,
            mtu,
            rssi,
            queue,
            peer: None,
            cancel: Some(cancel),
        };
        tokio::spawn(self.clone().run_bearer(state, inbound, cancelled));
    }

    async fn run_bearer(
        self: Arc<Self>,
        mut state: BearerState,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        mut cancelled: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(&mut state, frame),
                    None => break,
                },
            }
        }

        info!("Bearer {} to {} closed", state.bearer_id, state.address);
        if let Some(peer_id) = state.peer {
            if self.peers.detach_bearer(&peer_id, state.bearer_id) {
                self.peers.evict(&peer_id);
                self.emit(PeerEvent::Left { peer_id });
            }
        }
        self.release(&state.address, state.bearer_id);
        state.queue.close();
    }

    fn neighbour_queues(&self) -> Vec<Arc<OutboundQueue>> {
        self.peers
            .neighbours()
            .iter()
            .filter_map(|peer_id| self.peers.bearer_queue(peer_id))
            .map(|(queue, _)| queue)
            .collect()
    }

    fn announce_frame(&self) -> Option<Vec<u8>> {
        match AnnouncePayload::for_identity(&self.identity, &self.config.nickname).to_bytes() {
            Ok(payload) => self.link_local_frame(PacketType::Announce, payload),
            Err(e) => {
                warn!("Failed to encode announce: {}", e);
                None
            }
        }
    }

    /// Signed ttl-0 packet for the directly connected neighbour only
    fn link_local_frame(&self, packet_type: PacketType, payload: Vec<u8>) -> Option<Vec<u8>> {
        let result = Packet::new(packet_type, self.local_id(), 0, payload)
            .sign(&self.identity)
            .and_then(|packet| packet.encode());
        match result {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Failed to build {:?} packet: {}", packet_type, e);
                None
            }
        }
    }

    async fn reannounce(&self) {
        if let Some(frame) = self.announce_frame() {
            for queue in self.neighbour_queues() {
                if queue.push(frame.clone()) {
                    bump(&self.counters.queue_overflows);
                }
            }
        }
        self.advertise().await;
    }

    /// Periodic upkeep: dedup rotation, rate-limit windows, reassembly and
    /// liveness timeouts, handshake timeouts and retries
    fn maintain(&self, now: Instant) {
        self.relay.maintain(now);

        let dropped = self.reassembler.lock().sweep(now);
        if dropped > 0 {
            self.counters.reassembly_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }

        for peer_id in self.peers.sweep_expired(now, self.config.liveness_timeout()) {
            info!("Peer {} timed out", peer_id);
            self.emit(PeerEvent::Left { peer_id });
        }

        for peer_id in self.peers.expire_handshakes(&self.session_policy, now) {
            bump(&self.counters.handshakes_failed);
            self.emit_updated(peer_id);
        }

        let local = self.local_id();
        for peer_id in self.peers.neighbours() {
            if local < peer_id {
                self.maybe_initiate(peer_id, now);
            }
        }
    }

    // ---- inbound ----

    fn handle_frame(&self, bearer: &mut BearerState, frame: Vec<u8>) {
        bump(&self.counters.packets_received);
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                bump(&self.counters.malformed_dropped);
                debug!("Dropping malformed frame from {}: {}", bearer.address, e);
                return;
            }
        };
        let now = Instant::now();

        if packet.packet_type == PacketType::Announce {
            self.handle_announce(bearer, &packet, now);
            return;
        }

        let Some(ingress) = bearer.peer else {
            debug!("Dropping {:?} from unannounced bearer {}", packet.packet_type, bearer.address);
            return;
        };
        if self.peers.is_blocked(&ingress, now) {
            return;
        }
        self.peers.mark_seen(ingress, now);

        match packet.packet_type {
            PacketType::Leave => self.handle_leave(bearer, &packet, ingress, now),
            _ => self.route(packet, ingress, now),
        }
    }

    /// Bind the bearer to the announced peer once the announce proves it
    fn handle_announce(&self, bearer: &mut BearerState, packet: &Packet, now: Instant) {
        let peer_id = packet.sender;
        if peer_id == self.local_id() {
            return;
        }

        let announce = match AnnouncePayload::from_bytes(&packet.payload) {
            Ok(announce) => announce,
            Err(e) => {
                bump(&self.counters.malformed_dropped);
                debug!("Bad announce from {}: {}", bearer.address, e);
                return;
            }
        };
        let keys = announce.noise_key().and_then(|noise| Ok((noise, announce.signing_key()?)));
        let (noise_key, signing_key) = match keys {
            Ok(keys) => keys,
            Err(e) => {
                bump(&self.counters.malformed_dropped);
                debug!("Bad announce keys from {}: {}", bearer.address, e);
                return;
            }
        };
        if PeerId::from_noise_key(&noise_key) != peer_id {
            self.auth_failure(peer_id, "announced key does not match peer id", now);
            return;
        }
        if !packet.verify(&signing_key) {
            self.auth_failure(peer_id, AuthError::BadSignature, now);
            return;
        }
        if self.peers.is_blocked(&peer_id, now) {
            debug!("Ignoring announce from blocked peer {}", peer_id);
            return;
        }

        let mut newly_bound = false;
        let mut is_new = false;
        match bearer.peer {
            Some(bound) if bound != peer_id => {
                warn!("Bearer {} is bound to {}, ignoring announce from {}", bearer.address, bound, peer_id);
                return;
            }
            Some(_) => self.peers.mark_seen(peer_id, now),
            None => {
                let Some(cancel) = bearer.cancel.take() else {
                    return;
                };
                let handle = BearerHandle::new(bearer.address.clone(), bearer.bearer_id, bearer.mtu, bearer.queue.clone(), cancel);
                is_new = self.peers.upsert(peer_id, Some(handle), now);
                bearer.peer = Some(peer_id);
                newly_bound = true;
                if let Some(rssi) = bearer.rssi {
                    self.peers.update_rssi(peer_id, rssi);
                }
                info!("Peer {} ({}) bound to bearer {}", peer_id, announce.nickname, bearer.address);
            }
        }

        let changed = self
            .peers
            .update_identity(peer_id, &announce.nickname, noise_key, signing_key);
        if is_new {
            self.emit_joined(peer_id);
        } else if newly_bound || changed {
            self.emit_updated(peer_id);
        }

        if self.local_id() < peer_id {
            self.maybe_initiate(peer_id, now);
        }
    }

    fn handle_leave(&self, bearer: &mut BearerState, packet: &Packet, ingress: PeerId, now: Instant) {
        if packet.sender != ingress {
            return;
        }
        if let Some(key) = self.peers.signing_key(&ingress) {
            if !packet.verify(&key) {
                self.auth_failure(ingress, AuthError::BadSignature, now);
                return;
            }
        }
        info!("Peer {} left", ingress);
        bearer.peer = None;
        if self.peers.evict(&ingress) {
            self.emit(PeerEvent::Left { peer_id: ingress });
        }
    }

    /// Dedup, relay and local delivery of a packet from neighbour `ingress`
    fn route(&self, packet: Packet, ingress: PeerId, now: Instant) {
        if packet.sender != self.local_id() && self.peers.is_blocked(&packet.sender, now) {
            debug!("Dropping packet from blocked peer {}", packet.sender);
            return;
        }

        let decision = self.relay.process(&packet, ingress, &self.peers.neighbours(), now);
        if decision.duplicate {
            bump(&self.counters.duplicates_dropped);
            return;
        }
        if decision.rate_limited {
            bump(&self.counters.rate_limited);
        }
        if let Some(forward) = &decision.forward {
            bump(&self.counters.packets_relayed);
            self.transmit(&forward.packet, &forward.targets);
        }
        if decision.deliver {
            self.deliver(packet, now);
        }
    }

    fn deliver(&self, packet: Packet, now: Instant) {
        match packet.packet_type {
            PacketType::Message => self.handle_message(packet, now),
            PacketType::Fragment => self.handle_fragment(packet, now),
            kind if kind.is_handshake() => {
                if packet.is_addressed_to(&self.local_id()) {
                    self.handle_handshake(&packet, now);
                }
            }
            kind => debug!("Ignoring relayed {:?} from {}", kind, packet.sender),
        }
    }

    fn handle_fragment(&self, packet: Packet, now: Instant) {
        let fragment = match Fragment::decode(&packet.payload) {
            Ok(fragment) => fragment,
            Err(e) => {
                bump(&self.counters.malformed_dropped);
                debug!("Bad fragment from {}: {}", packet.sender, e);
                return;
            }
        };

        let result = self.reassembler.lock().accept(packet.sender, fragment, now);
        match result {
            Ok(None) => {}
            Ok(Some(original)) => {
                if original.sender != packet.sender || original.recipient != packet.recipient {
                    bump(&self.counters.malformed_dropped);
                    debug!("Reassembled packet from {} disagrees with its fragments", packet.sender);
                    return;
                }
                if !self.relay.observe(&original.fingerprint(), now) {
                    bump(&self.counters.duplicates_dropped);
                    return;
                }
                self.deliver(original, now);
            }
            Err(MeshError::Capacity(e)) => {
                bump(&self.counters.reassembly_dropped);
                debug!("Fragment from {} dropped: {}", packet.sender, e);
            }
            Err(e) => {
                bump(&self.counters.malformed_dropped);
                debug!("Fragment set from {} dropped: {}", packet.sender, e);
            }
        }
    }

    fn handle_message(&self, packet: Packet, now: Instant) {
        let sender = packet.sender;
        let local = self.local_id();
        if sender == local {
            return;
        }
        if self.peers.upsert(sender, None, now) {
            self.emit_joined(sender);
        }

        let (body, authenticated) = if packet.flags.is_encrypted {
            if !packet.is_addressed_to(&local) {
                bump(&self.counters.malformed_dropped);
                return;
            }
            match self.peers.with_session(sender, now, |session| session.decrypt(&packet.payload, now)) {
                Ok(plaintext) => (plaintext, true),
                Err(AuthError::NoSession(_)) => {
                    // Sender is unproven; nothing to charge it with
                    bump(&self.counters.no_session_dropped);
                    debug!("Encrypted message from {} without a session", sender);
                    return;
                }
                Err(e) => {
                    self.auth_failure(sender, e, now);
                    return;
                }
            }
        } else {
            if packet.recipient.is_some() {
                bump(&self.counters.malformed_dropped);
                debug!("Dropping unencrypted directed message from {}", sender);
                return;
            }
            let authenticated = match (packet.signature.is_some(), self.peers.signing_key(&sender)) {
                (true, Some(key)) => {
                    if !packet.verify(&key) {
                        self.auth_failure(sender, AuthError::BadSignature, now);
                        return;
                    }
                    true
                }
                _ => false,
            };
            (packet.payload, authenticated)
        };

        let body = if packet.flags.is_compressed {
            match decompress(&body, self.config.max_message_size + ENVELOPE_OVERHEAD) {
                Ok(body) => body,
                Err(e) => {
                    bump(&self.counters.malformed_dropped);
                    debug!("Bad compressed payload from {}: {}", sender, e);
                    return;
                }
            }
        } else {
            body
        };

        let envelope = match Envelope::decode(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                bump(&self.counters.malformed_dropped);
                debug!("Bad envelope from {}: {}", sender, e);
                return;
            }
        };
        if envelope.sender != sender || envelope.recipient != packet.recipient {
            bump(&self.counters.malformed_dropped);
            debug!("Envelope addressing from {} disagrees with its packet", sender);
            return;
        }

        self.accept_envelope(envelope, TransportKind::Mesh, authenticated, now);
    }

    /// Common delivery path for every transport; exactly once per
    /// envelope fingerprint
    fn accept_envelope(&self, envelope: Envelope, via: TransportKind, authenticated: bool, now: Instant) -> bool {
        let fingerprint = envelope.fingerprint();
        if !self.relay.observe(&fingerprint, now) {
            bump(&self.counters.duplicates_dropped);
            debug!("Envelope {} already delivered", fingerprint);
            return false;
        }

        let sender = envelope.sender;
        let wants_ack = self.config.delivery_acks
            && via == TransportKind::Mesh
            && envelope.recipient.is_some()
            && envelope.content_type != ContentType::DeliveryAck;

        self.peers.increment_message_count(sender);
        bump(&self.counters.messages_delivered);
        let message = ReceivedMessage {
            envelope,
            via,
            authenticated,
        };
        match self.messages_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                bump(&self.counters.delivery_backlog_drops);
                warn!("Message stream backlog full, dropping message from {}", sender);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Message stream closed, dropping message from {}", sender);
            }
        }

        if wants_ack {
            let ack = Envelope::new(self.local_id(), Some(sender), ContentType::DeliveryAck, fingerprint.as_bytes().to_vec());
            if let Err(e) = self.send_envelope(&ack) {
                debug!("Delivery ack to {} not sent: {}", sender, e);
            }
        }
        true
    }

    // ---- sessions ----

    fn handle_handshake(&self, packet: &Packet, now: Instant) {
        let peer_id = packet.sender;
        let local = self.local_id();
        if self.peers.is_blocked(&peer_id, now) {
            return;
        }
        if self.peers.upsert(peer_id, None, now) {
            self.emit_joined(peer_id);
        }

        match packet.packet_type {
            PacketType::NoiseHandshakeInit => {
                let result = self.peers.with_session(peer_id, now, |session| {
                    let initiating = session.state() == SessionState::Handshaking && session.role() == Some(Role::Initiator);
                    if initiating && local < peer_id {
                        return Ok(None);
                    }
                    session
                        .respond(&self.identity, &packet.payload, &self.session_policy, now)
                        .map(Some)
                });
                match result {
                    Ok(Some(reply)) => self.send_handshake(peer_id, PacketType::NoiseHandshakeResponse, reply, now),
                    Ok(None) => debug!("Simultaneous handshake with {}, keeping ours", peer_id),
                    Err(e) => self.handshake_failed(peer_id, e),
                }
            }
            PacketType::NoiseHandshakeResponse => {
                let result = self
                    .peers
                    .with_session(peer_id, now, |session| session.on_response(&self.identity, &packet.payload, now));
                match result {
                    Ok(reply) => {
                        self.send_handshake(peer_id, PacketType::NoiseHandshakeFinal, reply, now);
                        self.established(peer_id);
                    }
                    Err(e) => self.handshake_failed(peer_id, e),
                }
            }
            PacketType::NoiseHandshakeFinal => {
                match self.peers.with_session(peer_id, now, |session| session.on_final(&packet.payload, now)) {
                    Ok(()) => self.established(peer_id),
                    Err(e) => self.handshake_failed(peer_id, e),
                }
            }
            _ => {}
        }
    }

    fn established(&self, peer_id: PeerId) {
        bump(&self.counters.handshakes_completed);
        self.emit_updated(peer_id);
    }

    /// Handshake messages carry a claimed sender only, so failures are
    /// counted but never charged to that peer
    fn handshake_failed(&self, peer_id: PeerId, err: HandshakeError) {
        match err {
            HandshakeError::InvalidState(state) => {
                debug!("Ignoring handshake message from {} in state {:?}", peer_id, state);
            }
            HandshakeError::RetryLimited => debug!("Handshake with {} rate limited", peer_id),
            other => {
                bump(&self.counters.handshakes_failed);
                warn!("Handshake with {} failed: {}", peer_id, other);
                self.emit_updated(peer_id);
            }
        }
    }

    /// Start a handshake if the session is fresh, or failed and past its
    /// cool-down
    fn maybe_initiate(&self, peer_id: PeerId, now: Instant) {
        if self.peers.is_blocked(&peer_id, now) {
            return;
        }
        let result = self.peers.with_session(peer_id, now, |session| match session.state() {
            SessionState::Uninitialized => session.initiate(&self.identity, &self.session_policy, now).map(Some),
            SessionState::Failed if session.can_retry(&self.session_policy, now) => {
                session.retry(&self.session_policy, now)?;
                session.initiate(&self.identity, &self.session_policy, now).map(Some)
            }
            _ => Ok(None),
        });
        match result {
            Ok(Some(message)) => {
                debug!("Initiating handshake with {}", peer_id);
                self.send_handshake(peer_id, PacketType::NoiseHandshakeInit, message, now);
            }
            Ok(None) => {}
            Err(e) => debug!("Handshake with {} not started: {}", peer_id, e),
        }
    }

    fn send_handshake(&self, peer_id: PeerId, packet_type: PacketType, payload: Vec<u8>, now: Instant) {
        let packet = Packet::new(packet_type, self.local_id(), self.config.max_ttl, payload).with_recipient(peer_id);
        if let Err(e) = self.originate(packet, now) {
            debug!("{:?} to {} not sent: {}", packet_type, peer_id, e);
        }
    }

    fn auth_failure(&self, peer_id: PeerId, reason: impl Display, now: Instant) {
        bump(&self.counters.auth_failures);
        warn!("Authentication failure from {}: {}", peer_id, reason);
        if self.peers.record_auth_failure(&peer_id, &self.block_policy, now) {
            self.emit_updated(peer_id);
        }
    }

    // ---- outbound ----

    fn send_envelope(&self, envelope: &Envelope) -> Result<(), SendError> {
        let now = Instant::now();
        let local = self.local_id();
        if self.peers.neighbours().is_empty() {
            return Err(SendError::NoRoute);
        }

        let encoded = envelope.encode();
        let (body, compressed) = match compress(&encoded, self.config.compression_threshold) {
            Some(smaller) => (smaller, true),
            None => (encoded, false),
        };

        let packet = match envelope.recipient {
            None => {
                let packet =
                    Packet::new(PacketType::Message, local, self.config.max_ttl, body).with_compression(compressed);
                if self.config.sign_broadcasts {
                    let size = envelope.payload.len();
                    let max = self.config.max_message_size;
                    packet.sign(&self.identity).map_err(|e| too_large(e, size, max))?
                } else {
                    packet
                }
            }
            Some(peer_id) => {
                if peer_id == local || !self.peers.contains(&peer_id) {
                    return Err(SendError::NoRoute);
                }
                let encrypted = self.peers.with_session(peer_id, now, |session| session.encrypt(&body));
                let ciphertext = match encrypted {
                    Ok(ciphertext) => ciphertext,
                    Err(e) => {
                        if matches!(e, AuthError::NonceExhausted) {
                            self.peers.teardown(&peer_id);
                        }
                        // Direct neighbours are dialled by the lower id.
                        if !self.peers.is_neighbour(&peer_id) || local < peer_id {
                            self.maybe_initiate(peer_id, now);
                        }
                        return Err(SendError::SessionNotEstablished);
                    }
                };
                Packet::new(PacketType::Message, local, self.config.max_ttl, ciphertext)
                    .with_recipient(peer_id)
                    .with_compression(compressed)
                    .with_encryption(true)
            }
        };

        self.relay.observe(&envelope.fingerprint(), now);
        self.originate(packet, now)
    }

    fn originate(&self, packet: Packet, now: Instant) -> Result<(), SendError> {
        let targets = self.relay.originate(&packet, &self.peers.neighbours(), now);
        if targets.is_empty() {
            return Err(SendError::NoRoute);
        }
        bump(&self.counters.packets_originated);
        self.transmit(&packet, &targets);
        Ok(())
    }

    /// Queue `packet` on each target's bearer, fragmenting to its MTU
    fn transmit(&self, packet: &Packet, targets: &[PeerId]) {
        let mut framed: HashMap<usize, Vec<Vec<u8>>> = HashMap::new();
        for target in targets {
            let Some((queue, mtu)) = self.peers.bearer_queue(target) else {
                continue;
            };
            let frames = match framed.entry(mtu) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match frames_for(packet, mtu) {
                    Ok(frames) => entry.insert(frames),
                    Err(e) => {
                        warn!("Cannot frame packet for {} (mtu {}): {}", target, mtu, e);
                        continue;
                    }
                },
            };
            for frame in frames.iter() {
                if queue.push(frame.clone()) {
                    bump(&self.counters.queue_overflows);
                    debug!("Outbound queue to {} overflowed, oldest frame dropped", target);
                }
            }
        }
    }
}

fn frames_for(packet: &Packet, mtu: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    fragment_packet(packet, mtu)?.iter().map(Packet::encode).collect()
}

fn too_large(err: CodecError, size: usize, max: usize) -> SendError {
    match err {
        CodecError::Oversized { size, max } => SendError::PayloadTooLarge { size, max },
        CodecError::Malformed(_) => SendError::PayloadTooLarge { size, max },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Session;
    use crate::link::MemoryNetwork;

    fn service(network: &MemoryNetwork, address: &str) -> MeshService {
        let link = Arc::new(network.link(address));
        MeshService::new(MeshConfig::default(), LocalIdentity::generate().unwrap(), link).unwrap()
    }

    async fn next_event(events: &mut PeerEventStream) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("peer event")
            .expect("stream open")
    }

    async fn wait_established(a: &MeshService, b: &MeshService) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let ready = [(a, b.peer_id()), (b, a.peer_id())].iter().all(|(node, peer)| {
                node.session_info(peer)
                    .is_some_and(|info| info.state == SessionState::Established)
            });
            if ready {
                return;
            }
            assert!(Instant::now() < deadline, "handshake did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let network = MemoryNetwork::new();
        let mut config = MeshConfig::default();
        config.mtu = 10;
        let result = MeshService::new(config, LocalIdentity::generate().unwrap(), Arc::new(network.link("a")));
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[test]
    fn test_send_errors_without_neighbours() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");

        let too_big = vec![0u8; node.config().max_message_size + 1];
        assert!(matches!(
            node.send_message(Recipient::Broadcast, ContentType::Binary, too_big),
            Err(SendError::PayloadTooLarge { .. })
        ));
        assert_eq!(node.send_text(Recipient::Broadcast, "hi"), Err(SendError::NoRoute));
        assert_eq!(node.send_text(PeerId::new([9; 8]).into(), "hi"), Err(SendError::NoRoute));
    }

    #[test]
    fn test_message_stream_taken_once() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");
        assert!(node.messages().is_ok());
        assert!(matches!(node.messages(), Err(MeshError::StreamTaken)));
    }

    #[tokio::test]
    async fn test_ingest_envelope_delivers_once() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");
        let mut messages = node.messages().unwrap();

        let remote = PeerId::new([7; 8]);
        let envelope = Envelope::new(remote, None, ContentType::Text, b"over the overlay".to_vec());
        assert!(node.ingest_envelope(envelope.clone(), TransportKind::Overlay));
        assert!(!node.ingest_envelope(envelope.clone(), TransportKind::Relay));

        let elsewhere = Envelope::new(remote, Some(PeerId::new([8; 8])), ContentType::Text, b"not ours".to_vec());
        assert!(!node.ingest_envelope(elsewhere, TransportKind::Overlay));

        let received = messages.next().await.unwrap();
        assert_eq!(received.envelope, envelope);
        assert_eq!(received.via, TransportKind::Overlay);
        assert!(!received.authenticated);
        assert_eq!(node.statistics().duplicates_dropped, 1);
    }

    #[test]
    fn test_publish_rejects_foreign_envelope() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");
        let envelope = Envelope::new(PeerId::new([7; 8]), None, ContentType::Text, b"x".to_vec());
        assert!(matches!(node.publish(&envelope), Err(MeshError::ForeignEnvelope(_))));
    }

    #[test]
    fn test_verify_identity_without_session_is_unverified() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");
        let stranger = LocalIdentity::generate().unwrap();
        assert_eq!(node.verify_identity(&stranger.identity_proof()), VerificationStatus::Unverified);

        let mut forged = stranger.identity_proof();
        forged.signature[0] ^= 1;
        assert_eq!(node.verify_identity(&forged), VerificationStatus::Mismatch);
    }

    #[tokio::test]
    async fn test_neighbours_handshake_and_exchange() {
        let network = MemoryNetwork::new();
        let a = service(&network, "a");
        let b = service(&network, "b");
        let mut a_messages = a.messages().unwrap();
        let mut b_messages = b.messages().unwrap();
        let mut b_events = b.peer_events();

        a.start().await.unwrap();
        b.start().await.unwrap();
        network.connect_nodes("a", "b");

        assert_eq!(
            next_event(&mut b_events).await,
            PeerEvent::Joined {
                peer_id: a.peer_id(),
                nickname: Some("anon".to_string())
            }
        );
        wait_established(&a, &b).await;
        assert_eq!(b.verify_identity(&a.identity_proof()), VerificationStatus::Verified);

        a.send_text(b.peer_id().into(), "secret").unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), b_messages.next()).await.unwrap().unwrap();
        assert_eq!(received.envelope.text(), Some("secret"));
        assert!(received.authenticated);

        let ack = tokio::time::timeout(Duration::from_secs(5), a_messages.next()).await.unwrap().unwrap();
        assert_eq!(ack.envelope.content_type, ContentType::DeliveryAck);
        assert_eq!(ack.envelope.payload, received.envelope.fingerprint().as_bytes().to_vec());

        b.send_text(Recipient::Broadcast, "hello all").unwrap();
        let broadcast = tokio::time::timeout(Duration::from_secs(5), a_messages.next()).await.unwrap().unwrap();
        assert_eq!(broadcast.envelope.text(), Some("hello all"));
        assert!(broadcast.authenticated);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_reports_left_to_neighbour() {
        let network = MemoryNetwork::new();
        let a = service(&network, "a");
        let b = service(&network, "b");
        let mut b_events = b.peer_events();

        a.start().await.unwrap();
        b.start().await.unwrap();
        network.connect_nodes("a", "b");
        assert!(matches!(next_event(&mut b_events).await, PeerEvent::Joined { .. }));

        a.stop().await.unwrap();
        let left = loop {
            match next_event(&mut b_events).await {
                PeerEvent::Left { peer_id } => break peer_id,
                _ => continue,
            }
        };
        assert_eq!(left, a.peer_id());
        assert!(b.peer(&a.peer_id()).is_none());
        assert!(!a.is_running());
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_message_is_fragmented() {
        let network = MemoryNetwork::new();
        let a = service(&network, "a");
        let b = service(&network, "b");
        let mut b_messages = b.messages().unwrap();

        a.start().await.unwrap();
        b.start().await.unwrap();
        network.connect_nodes("a", "b");
        wait_established(&a, &b).await;

        let payload: Vec<u8> = (0..4000).map(|_| rand::random::<u8>()).collect();
        a.send_message(b.peer_id().into(), ContentType::Binary, payload.clone()).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), b_messages.next()).await.unwrap().unwrap();
        assert_eq!(received.envelope.payload, payload);
        assert_eq!(b.statistics().pending_fragment_sets, 0);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    fn forged_init(claimed: PeerId, target: PeerId) -> Packet {
        let stranger = LocalIdentity::generate().unwrap();
        let m1 = Session::new(target)
            .initiate(&stranger, &SessionPolicy::default(), Instant::now())
            .unwrap();
        Packet::new(PacketType::NoiseHandshakeInit, claimed, 7, m1).with_recipient(target)
    }

    #[tokio::test]
    async fn test_unanswered_handshake_times_out() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");
        let silent = LocalIdentity::generate().unwrap().peer_id();
        let timeout = node.config().handshake_timeout();
        let now = Instant::now();

        node.inner.maybe_initiate(silent, now);
        assert_eq!(node.session_info(&silent).unwrap().state, SessionState::Handshaking);

        node.inner.maintain(now + timeout - Duration::from_secs(1));
        assert_eq!(node.session_info(&silent).unwrap().state, SessionState::Handshaking);

        node.inner.maintain(now + timeout);
        assert_eq!(node.session_info(&silent).unwrap().state, SessionState::Failed);
        let stats = node.statistics();
        assert_eq!(stats.handshakes_failed, 1);
        assert_eq!(stats.auth_failures, 0);
    }

    #[tokio::test]
    async fn test_forged_init_leaves_established_session() {
        let network = MemoryNetwork::new();
        let a = service(&network, "a");
        let b = service(&network, "b");
        let mut b_messages = b.messages().unwrap();

        a.start().await.unwrap();
        b.start().await.unwrap();
        network.connect_nodes("a", "b");
        wait_established(&a, &b).await;
        let before = b.session_info(&a.peer_id()).unwrap();

        for _ in 0..3 {
            b.inner.handle_handshake(&forged_init(a.peer_id(), b.peer_id()), Instant::now());
            let garbage = Packet::new(PacketType::NoiseHandshakeFinal, a.peer_id(), 7, vec![0x42; 64])
                .with_recipient(b.peer_id());
            b.inner.handle_handshake(&garbage, Instant::now());
        }

        let after = b.session_info(&a.peer_id()).unwrap();
        assert_eq!(after.state, SessionState::Established);
        assert_eq!(after.session_id, before.session_id);
        assert_eq!(b.statistics().auth_failures, 0);
        assert!(!b.peer(&a.peer_id()).unwrap().blocked);

        a.send_text(b.peer_id().into(), "still trusted").unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), b_messages.next()).await.unwrap().unwrap();
        assert_eq!(received.envelope.text(), Some("still trusted"));
        assert!(received.authenticated);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_encrypted_message_without_session_not_charged() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");
        let stranger = PeerId::new([5; 8]);

        for _ in 0..5 {
            let packet = Packet::new(PacketType::Message, stranger, 7, vec![1; 48])
                .with_recipient(node.peer_id())
                .with_encryption(true);
            node.inner.handle_message(packet, Instant::now());
        }

        let stats = node.statistics();
        assert_eq!(stats.no_session_dropped, 5);
        assert_eq!(stats.auth_failures, 0);
        assert!(!node.peer(&stranger).unwrap().blocked);
    }

    #[tokio::test]
    async fn test_block_survives_liveness_eviction() {
        let network = MemoryNetwork::new();
        let node = service(&network, "a");
        let offender = LocalIdentity::generate().unwrap().peer_id();
        let now = Instant::now();

        node.inner.peers.upsert(offender, None, now);
        for _ in 0..node.config().session.auth_block_threshold {
            node.inner.auth_failure(offender, AuthError::BadSignature, now);
        }
        assert!(node.peer(&offender).unwrap().blocked);

        node.inner.maintain(now + node.config().liveness_timeout() + Duration::from_secs(1));
        assert!(node.peer(&offender).is_none());

        // Handshakes from the evicted peer stay refused while the block runs
        node.inner.handle_handshake(&forged_init(offender, node.peer_id()), now + Duration::from_secs(100));
        assert!(node.peer(&offender).is_none());
        assert!(node.inner.peers.is_blocked(&offender, now + Duration::from_secs(100)));
    }
}
