//! An in-process network implementing [`LogStore`] and [`ProviderRouting`].
//!
//! Every node joins a shared [`MemNetwork`]. Replicas of the same log that are open on
//! connected nodes exchange entries, transitively, whenever a replica is opened, an entry is
//! appended or two nodes connect. Event delivery mimics a real replicated log during a sync
//! burst: when several entries arrive at once, only the last one is reported as
//! [`LogEvent::EntryAppended`].

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    discovery::{PeerEvent, ProviderRouting, RoutingError},
    ids::{ContentId, LogAddress, PeerId},
    log::{EntryHash, LogEntry, LogError, LogEvent, LogStore, ReplicatedLog},
};

const EVENT_CAPACITY: usize = 256;

/// A shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: BTreeMap<PeerId, Node>,
    providers: BTreeMap<ContentId, BTreeSet<PeerId>>,
    logs: BTreeMap<LogAddress, BTreeMap<PeerId, Replica>>,
}

#[derive(Debug)]
struct Node {
    online: bool,
    protocols: BTreeSet<String>,
    connections: BTreeSet<PeerId>,
    tags: BTreeMap<PeerId, u32>,
    events: broadcast::Sender<PeerEvent>,
}

impl Node {
    fn new() -> Self {
        Self {
            online: true,
            protocols: Default::default(),
            connections: Default::default(),
            tags: Default::default(),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }
}

/// The local copy of a log on one node. Survives closing, like on-disk storage would.
#[derive(Debug)]
struct Replica {
    entries: Vec<LogEntry>,
    hashes: HashSet<EntryHash>,
    peers: BTreeSet<PeerId>,
    events: broadcast::Sender<LogEvent>,
    seq: u64,
    open: bool,
}

impl Replica {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            hashes: HashSet::new(),
            peers: BTreeSet::new(),
            events: broadcast::channel(EVENT_CAPACITY).0,
            seq: 0,
            open: false,
        }
    }

    fn push(&mut self, entry: LogEntry) -> bool {
        if self.hashes.insert(entry.hash) {
            self.entries.push(entry);
            true
        } else {
            false
        }
    }

    fn set_peers(&mut self, peers: BTreeSet<PeerId>) {
        for peer in peers.difference(&self.peers) {
            self.events.send(LogEvent::PeerJoined(*peer)).ok();
        }
        for peer in self.peers.difference(&peers) {
            self.events.send(LogEvent::PeerLeft(*peer)).ok();
        }
        self.peers = peers;
    }
}

impl NetworkState {
    fn is_online(&self, peer: &PeerId) -> bool {
        self.nodes.get(peer).is_some_and(|node| node.online)
    }

    fn node_mut(&mut self, peer: &PeerId) -> Result<&mut Node, RoutingError> {
        self.nodes
            .get_mut(peer)
            .ok_or(RoutingError::UnknownPeer { peer: *peer })
    }

    /// Exchanges entries between the open, connected replicas of `address`.
    fn replicate(&mut self, address: &LogAddress) {
        let Self { nodes, logs, .. } = self;
        let Some(replicas) = logs.get_mut(address) else {
            return;
        };
        let holders: BTreeSet<PeerId> = replicas
            .iter()
            .filter(|(peer, replica)| replica.open && nodes.get(*peer).is_some_and(|n| n.online))
            .map(|(peer, _)| *peer)
            .collect();
        let connections = |peer: &PeerId| -> BTreeSet<PeerId> {
            nodes
                .get(peer)
                .map(|node| node.connections.intersection(&holders).copied().collect())
                .unwrap_or_default()
        };

        for (peer, replica) in replicas.iter_mut() {
            if !holders.contains(peer) {
                replica.set_peers(BTreeSet::new());
            }
        }

        let mut seen = BTreeSet::new();
        for start in &holders {
            if !seen.insert(*start) {
                continue;
            }
            let mut component = vec![*start];
            let mut queue = vec![*start];
            while let Some(peer) = queue.pop() {
                for next in connections(&peer) {
                    if seen.insert(next) {
                        component.push(next);
                        queue.push(next);
                    }
                }
            }

            let mut union = Vec::new();
            let mut hashes = HashSet::new();
            for peer in &component {
                for entry in &replicas[peer].entries {
                    if hashes.insert(entry.hash) {
                        union.push(entry.clone());
                    }
                }
            }

            for peer in &component {
                let direct = connections(peer);
                let Some(replica) = replicas.get_mut(peer) else {
                    continue;
                };
                let mut last_new = None;
                for entry in &union {
                    if replica.push(entry.clone()) {
                        last_new = Some(entry.clone());
                    }
                }
                replica.set_peers(direct);
                if let Some(entry) = last_new {
                    trace!(peer = %peer.fmt_short(), address = %address.fmt_short(), "replica updated");
                    replica.events.send(LogEvent::EntryAppended(entry)).ok();
                }
            }
        }
    }

    fn replicate_all(&mut self) {
        let addresses: Vec<LogAddress> = self.logs.keys().copied().collect();
        for address in addresses {
            self.replicate(&address);
        }
    }

    fn disconnect_all(&mut self, peer: &PeerId) {
        let Some(node) = self.nodes.get_mut(peer) else {
            return;
        };
        let connections = std::mem::take(&mut node.connections);
        node.tags.clear();
        for other in connections {
            if let Some(node) = self.nodes.get_mut(peer) {
                node.events.send(PeerEvent::Disconnected(other)).ok();
            }
            if let Some(remote) = self.nodes.get_mut(&other) {
                remote.connections.remove(peer);
                remote.tags.remove(peer);
                remote.events.send(PeerEvent::Disconnected(*peer)).ok();
            }
        }
    }
}

impl MemNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the network, or returns handles to it if it already joined.
    pub fn join(&self, peer: PeerId) -> (MemLogStore, MemRouting) {
        let events = self
            .state
            .lock()
            .nodes
            .entry(peer)
            .or_insert_with(Node::new)
            .events
            .clone();
        (
            MemLogStore {
                network: self.clone(),
                peer,
            },
            MemRouting {
                network: self.clone(),
                peer,
                events,
            },
        )
    }

    /// Takes a node off the network or brings it back.
    ///
    /// Going offline drops all connections of the node.
    pub fn set_online(&self, peer: PeerId, online: bool) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(&peer) {
            node.online = online;
        }
        if !online {
            state.disconnect_all(&peer);
        }
        state.replicate_all();
    }

    /// The tag `of` put on its connection to `peer`.
    pub fn tag(&self, of: PeerId, peer: PeerId) -> Option<u32> {
        self.state
            .lock()
            .nodes
            .get(&of)
            .and_then(|node| node.tags.get(&peer).copied())
    }
}

/// The [`LogStore`] of one node of a [`MemNetwork`].
#[derive(Debug, Clone)]
pub struct MemLogStore {
    network: MemNetwork,
    peer: PeerId,
}

impl LogStore for MemLogStore {
    type Log = MemLog;

    async fn open(&self, name: &str) -> Result<MemLog, LogError> {
        self.open_address(&LogAddress::for_name(name)).await
    }

    async fn open_address(&self, address: &LogAddress) -> Result<MemLog, LogError> {
        let mut state = self.network.state.lock();
        let replica = state
            .logs
            .entry(*address)
            .or_default()
            .entry(self.peer)
            .or_insert_with(Replica::new);
        replica.open = true;
        let events = replica.events.clone();
        state.replicate(address);
        debug!(peer = %self.peer.fmt_short(), address = %address.fmt_short(), "opened log");
        Ok(MemLog {
            network: self.network.clone(),
            peer: self.peer,
            address: *address,
            events,
        })
    }
}

/// An open log of a [`MemLogStore`].
#[derive(derive_more::Debug, Clone)]
pub struct MemLog {
    #[debug(skip)]
    network: MemNetwork,
    peer: PeerId,
    address: LogAddress,
    #[debug(skip)]
    events: broadcast::Sender<LogEvent>,
}

impl MemLog {
    fn with_replica<T>(&self, f: impl FnOnce(&mut Replica) -> T) -> Result<T, LogError> {
        let mut state = self.network.state.lock();
        match state
            .logs
            .get_mut(&self.address)
            .and_then(|replicas| replicas.get_mut(&self.peer))
        {
            Some(replica) if replica.open => Ok(f(replica)),
            _ => Err(LogError::Closed {
                address: self.address,
            }),
        }
    }
}

impl ReplicatedLog for MemLog {
    fn address(&self) -> LogAddress {
        self.address
    }

    async fn append(&self, payload: Bytes) -> Result<LogEntry, LogError> {
        let entry = self.with_replica(|replica| {
            replica.seq += 1;
            let entry = LogEntry::new(self.peer, replica.seq, payload);
            replica.push(entry.clone());
            entry
        })?;
        self.network.state.lock().replicate(&self.address);
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<LogEntry>, LogError> {
        self.with_replica(|replica| replica.entries.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.with_replica(|replica| replica.peers.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<(), LogError> {
        let mut state = self.network.state.lock();
        if let Some(replica) = state
            .logs
            .get_mut(&self.address)
            .and_then(|replicas| replicas.get_mut(&self.peer))
        {
            replica.open = false;
        }
        state.replicate(&self.address);
        debug!(peer = %self.peer.fmt_short(), address = %self.address.fmt_short(), "closed log");
        Ok(())
    }
}

/// The [`ProviderRouting`] of one node of a [`MemNetwork`].
#[derive(derive_more::Debug, Clone)]
pub struct MemRouting {
    #[debug(skip)]
    network: MemNetwork,
    peer: PeerId,
    #[debug(skip)]
    events: broadcast::Sender<PeerEvent>,
}

impl MemRouting {
    fn ensure_online(&self, state: &NetworkState) -> Result<(), RoutingError> {
        if state.is_online(&self.peer) {
            Ok(())
        } else {
            Err(RoutingError::Offline {})
        }
    }
}

impl ProviderRouting for MemRouting {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    fn register_protocol(&self, protocol: &str) {
        if let Some(node) = self.network.state.lock().nodes.get_mut(&self.peer) {
            node.protocols.insert(protocol.to_string());
        }
    }

    async fn provide(&self, cid: ContentId) -> Result<(), RoutingError> {
        let mut state = self.network.state.lock();
        self.ensure_online(&state)?;
        state.providers.entry(cid).or_default().insert(self.peer);
        Ok(())
    }

    async fn find_providers(&self, cid: ContentId) -> Result<Vec<PeerId>, RoutingError> {
        let state = self.network.state.lock();
        self.ensure_online(&state)?;
        let providers = state
            .providers
            .get(&cid)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|peer| state.is_online(peer))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Ok(providers)
    }

    async fn dial(&self, peer: PeerId) -> Result<(), RoutingError> {
        let mut state = self.network.state.lock();
        self.ensure_online(&state)?;
        if peer == self.peer || !state.is_online(&peer) {
            return Err(RoutingError::DialFailed { peer });
        }
        let me = self.peer;
        let local = state.node_mut(&me)?;
        if !local.connections.insert(peer) {
            return Ok(());
        }
        local.events.send(PeerEvent::Connected(peer)).ok();
        let remote = state.node_mut(&peer)?;
        remote.connections.insert(me);
        remote.events.send(PeerEvent::Connected(me)).ok();
        state.replicate_all();
        Ok(())
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.network
            .state
            .lock()
            .nodes
            .get(&self.peer)
            .is_some_and(|node| node.connections.contains(&peer))
    }

    async fn peer_protocols(&self, peer: PeerId) -> Result<Vec<String>, RoutingError> {
        let mut state = self.network.state.lock();
        let node = state.node_mut(&peer)?;
        Ok(node.protocols.iter().cloned().collect())
    }

    fn tag_peer(&self, peer: PeerId, value: u32) {
        if let Some(node) = self.network.state.lock().nodes.get_mut(&self.peer) {
            node.tags.insert(peer, value);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}
