//! Finding and connecting to peers that hold a replicated log.
//!
//! The network stack is provided by an implementation of [`ProviderRouting`]. On top of it,
//! [`ProviderDiscovery`] runs two independent loops for one [`ContentId`]:
//!
//! - the *announce* loop advertises that this node provides the content, retrying failed
//!   announcements with a growing delay and re-announcing on a fixed interval afterwards;
//! - the *discover* loop periodically queries for providers of the content and dials every
//!   provider that is neither this node nor already connected.
//!
//! Separately, [`spawn_connection_watcher`] marks connections to peers speaking
//! [`WIKI_PROTOCOL`] as high priority, so the transport is less likely to prune them.

use std::{future::Future, sync::Arc, time::Duration};

use snafu::Snafu;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, error_span, info, trace, warn};

use crate::{
    ids::{ContentId, PeerId},
    metrics::Metrics,
};

/// The application protocol spoken by wiki nodes.
pub const WIKI_PROTOCOL: &str = "/astrawiki/1.0.0";

/// Connection tag value for peers speaking [`WIKI_PROTOCOL`].
pub const HIGH_PRIORITY: u32 = 100;

/// Errors reported by a routing implementation.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum RoutingError {
    #[snafu(display("Failed to dial peer {}", peer.fmt_short()))]
    DialFailed { peer: PeerId },
    #[snafu(display("Unknown peer {}", peer.fmt_short()))]
    UnknownPeer { peer: PeerId },
    #[snafu(display("Node is offline"))]
    Offline {},
    #[snafu(display("Routing implementation error"))]
    Other {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl RoutingError {
    /// Wraps an error from a routing implementation.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(source: T) -> Self {
        Self::Other {
            source: Box::new(source),
        }
    }
}

/// Connection events of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PeerEvent {
    /// A connection to the peer was established.
    Connected(PeerId),
    /// The connection to the peer was closed.
    Disconnected(PeerId),
}

/// Content routing and connectivity of the local node.
pub trait ProviderRouting: Clone + Send + Sync + 'static {
    /// The id of the local node.
    fn local_peer_id(&self) -> PeerId;

    /// Makes the local node speak `protocol`.
    fn register_protocol(&self, protocol: &str);

    /// Advertises the local node as a provider of `cid`.
    fn provide(&self, cid: ContentId) -> impl Future<Output = Result<(), RoutingError>> + Send;

    /// Queries the providers of `cid`. The result may include the local node.
    fn find_providers(
        &self,
        cid: ContentId,
    ) -> impl Future<Output = Result<Vec<PeerId>, RoutingError>> + Send;

    /// Connects to `peer`.
    fn dial(&self, peer: PeerId) -> impl Future<Output = Result<(), RoutingError>> + Send;

    /// Whether a connection to `peer` is open.
    fn is_connected(&self, peer: PeerId) -> bool;

    /// The protocols `peer` speaks.
    fn peer_protocols(
        &self,
        peer: PeerId,
    ) -> impl Future<Output = Result<Vec<String>, RoutingError>> + Send;

    /// Tags the connection to `peer` with a priority `value`.
    fn tag_peer(&self, peer: PeerId, value: u32);

    /// Subscribes to connection events of the local node.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

/// Options for the loops started by [`ProviderDiscovery::spawn`].
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    /// Whether to run the announce loop.
    pub announce: bool,
    /// Delay between successful announcements.
    pub announce_interval: Duration,
    /// Delay between provider queries.
    pub discovery_interval: Duration,
}

/// Announces and discovers the providers of one [`ContentId`].
#[derive(Debug, Clone)]
pub struct ProviderDiscovery<R> {
    routing: R,
    cid: ContentId,
    metrics: Arc<Metrics>,
}

impl<R: ProviderRouting> ProviderDiscovery<R> {
    /// Creates a discovery for `cid`.
    pub fn new(routing: R, cid: ContentId, metrics: Arc<Metrics>) -> Self {
        Self {
            routing,
            cid,
            metrics,
        }
    }

    /// The content id this discovery works on.
    pub fn content_id(&self) -> ContentId {
        self.cid
    }

    /// Advertises the local node as a provider once.
    pub async fn announce(&self) -> Result<(), RoutingError> {
        match self.routing.provide(self.cid).await {
            Ok(()) => {
                self.metrics.announces.inc();
                debug!(cid = %self.cid.fmt_short(), "announced");
                Ok(())
            }
            Err(err) => {
                self.metrics.announce_failures.inc();
                Err(err)
            }
        }
    }

    /// Queries the providers once and dials every new one.
    ///
    /// Dial failures are logged and do not stop the remaining providers from being dialed.
    /// Returns the number of providers that were connected.
    pub async fn discover_and_connect(&self) -> Result<usize, RoutingError> {
        let providers = self.routing.find_providers(self.cid).await?;
        let me = self.routing.local_peer_id();
        let mut connected = 0;
        for peer in providers {
            if peer == me || self.routing.is_connected(peer) {
                continue;
            }
            match self.routing.dial(peer).await {
                Ok(()) => {
                    info!(peer = %peer.fmt_short(), "connected to provider");
                    self.metrics.providers_dialed.inc();
                    connected += 1;
                }
                Err(err) => {
                    warn!(peer = %peer.fmt_short(), "failed to dial provider: {err:#}");
                    self.metrics.dial_failures.inc();
                }
            }
        }
        Ok(connected)
    }

    /// Starts the discovery loops, stopped when `cancel` or the returned tasks' own token is
    /// cancelled.
    pub fn spawn(self, opts: DiscoveryOptions, cancel: &CancellationToken) -> DiscoveryTasks {
        let cancel = cancel.child_token();
        let span = error_span!("discovery", cid = %self.cid.fmt_short());
        let mut tasks = Vec::new();
        if opts.announce {
            let this = self.clone();
            let cancel = cancel.child_token();
            let task = tokio::task::spawn(
                async move { this.announce_loop(opts.announce_interval, cancel).await }
                    .instrument(span.clone()),
            );
            tasks.push(AbortOnDropHandle::new(task));
        }
        let discover_cancel = cancel.child_token();
        let task = tokio::task::spawn(
            async move {
                self.discover_loop(opts.discovery_interval, discover_cancel)
                    .await
            }
            .instrument(span),
        );
        tasks.push(AbortOnDropHandle::new(task));
        DiscoveryTasks { cancel, tasks }
    }

    async fn announce_loop(self, interval: Duration, cancel: CancellationToken) {
        let mut failed_attempts = 0;
        loop {
            let delay = match self.announce().await {
                Ok(()) => {
                    failed_attempts = 0;
                    interval
                }
                Err(err) => {
                    failed_attempts += 1;
                    // Retry after increasing timeout
                    let retry_after = Duration::from_secs(failed_attempts).min(interval);
                    warn!(?retry_after, %failed_attempts, "failed to announce: {err:#}");
                    retry_after
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("announce loop stopped");
    }

    async fn discover_loop(self, interval: Duration, cancel: CancellationToken) {
        loop {
            match self.discover_and_connect().await {
                Ok(n) => trace!(connected = n, "discovery pass done"),
                Err(err) => warn!("failed to find providers: {err:#}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("discover loop stopped");
    }
}

/// Handles of the loops started by [`ProviderDiscovery::spawn`].
///
/// The loops are aborted when this is dropped.
#[derive(derive_more::Debug)]
pub struct DiscoveryTasks {
    cancel: CancellationToken,
    #[debug("{} tasks", tasks.len())]
    tasks: Vec<AbortOnDropHandle<()>>,
}

impl DiscoveryTasks {
    /// Cancels the loops and waits for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("discovery task failed: {err:#}");
                }
            }
        }
    }

    /// Whether the loops were cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Tags `peer` with [`HIGH_PRIORITY`] if it speaks [`WIKI_PROTOCOL`].
///
/// Returns whether the peer was tagged.
pub async fn on_peer_connected<R: ProviderRouting>(
    routing: &R,
    peer: PeerId,
    metrics: &Metrics,
) -> bool {
    match routing.peer_protocols(peer).await {
        Ok(protocols) if protocols.iter().any(|p| p == WIKI_PROTOCOL) => {
            routing.tag_peer(peer, HIGH_PRIORITY);
            metrics.peers_tagged.inc();
            debug!(peer = %peer.fmt_short(), "tagged wiki peer");
            true
        }
        Ok(_) => false,
        Err(err) => {
            debug!(peer = %peer.fmt_short(), "failed to get peer protocols: {err:#}");
            false
        }
    }
}

/// Runs [`on_peer_connected`] for every new connection until `cancel` is cancelled.
pub fn spawn_connection_watcher<R: ProviderRouting>(
    routing: R,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> AbortOnDropHandle<()> {
    let mut events = routing.subscribe();
    let span = error_span!("conn_watcher", me = %routing.local_peer_id().fmt_short());
    let task = tokio::task::spawn(
        async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(PeerEvent::Connected(peer)) => {
                        on_peer_connected(&routing, peer, &metrics).await;
                    }
                    Ok(PeerEvent::Disconnected(peer)) => {
                        trace!(peer = %peer.fmt_short(), "peer disconnected");
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("connection watcher lagged, missed {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        .instrument(span),
    );
    AbortOnDropHandle::new(task)
}

/// Dials each of `peers` once, logging failures.
///
/// Returns the number of successful dials.
pub async fn dial_bootstrap<R: ProviderRouting>(routing: &R, peers: &[PeerId]) -> usize {
    let mut connected = 0;
    for peer in peers {
        if *peer == routing.local_peer_id() {
            continue;
        }
        match routing.dial(*peer).await {
            Ok(()) => {
                info!(peer = %peer.fmt_short(), "connected to bootstrap peer");
                connected += 1;
            }
            Err(err) => warn!(peer = %peer.fmt_short(), "failed to dial bootstrap peer: {err:#}"),
        }
    }
    connected
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    };

    use parking_lot::Mutex;
    use tracing_test::traced_test;

    use super::*;
    use crate::{ids::LogAddress, mem::MemNetwork};

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn cid() -> ContentId {
        ContentId::from(&LogAddress::for_name("wiki"))
    }

    /// Routing that fails a configurable number of announcements and dials.
    #[derive(Debug, Clone, Default)]
    struct FlakyRouting {
        state: Arc<Mutex<FlakyState>>,
    }

    #[derive(Debug, Default)]
    struct FlakyState {
        provide_failures_left: usize,
        provide_calls: usize,
        providers: Vec<PeerId>,
        unreachable: BTreeSet<PeerId>,
        connected: BTreeSet<PeerId>,
        dialed: Vec<PeerId>,
        tags: BTreeMap<PeerId, u32>,
    }

    impl ProviderRouting for FlakyRouting {
        fn local_peer_id(&self) -> PeerId {
            peer(0)
        }

        fn register_protocol(&self, _protocol: &str) {}

        async fn provide(&self, _cid: ContentId) -> Result<(), RoutingError> {
            let mut state = self.state.lock();
            state.provide_calls += 1;
            if state.provide_failures_left > 0 {
                state.provide_failures_left -= 1;
                return Err(RoutingError::Offline {});
            }
            Ok(())
        }

        async fn find_providers(&self, _cid: ContentId) -> Result<Vec<PeerId>, RoutingError> {
            Ok(self.state.lock().providers.clone())
        }

        async fn dial(&self, peer: PeerId) -> Result<(), RoutingError> {
            let mut state = self.state.lock();
            state.dialed.push(peer);
            if state.unreachable.contains(&peer) {
                return Err(RoutingError::DialFailed { peer });
            }
            state.connected.insert(peer);
            Ok(())
        }

        fn is_connected(&self, peer: PeerId) -> bool {
            self.state.lock().connected.contains(&peer)
        }

        async fn peer_protocols(&self, id: PeerId) -> Result<Vec<String>, RoutingError> {
            if id == peer(9) {
                return Err(RoutingError::UnknownPeer { peer: id });
            }
            if id.as_bytes()[0] % 2 == 0 {
                Ok(vec![WIKI_PROTOCOL.to_string()])
            } else {
                Ok(vec!["/other/1".to_string()])
            }
        }

        fn tag_peer(&self, peer: PeerId, value: u32) {
            self.state.lock().tags.insert(peer, value);
        }

        fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
            broadcast::channel(1).1
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn discover_skips_self_and_connected_and_survives_failures() -> anyhow::Result<()> {
        let routing = FlakyRouting::default();
        {
            let mut state = routing.state.lock();
            state.providers = vec![peer(0), peer(1), peer(2), peer(3)];
            state.connected.insert(peer(1));
            state.unreachable.insert(peer(2));
        }
        let metrics = Arc::new(Metrics::default());
        let discovery = ProviderDiscovery::new(routing.clone(), cid(), metrics.clone());
        let connected = discovery.discover_and_connect().await?;
        assert_eq!(connected, 1);
        let state = routing.state.lock();
        assert_eq!(state.dialed, vec![peer(2), peer(3)]);
        assert!(state.connected.contains(&peer(3)));
        #[cfg(feature = "metrics")]
        {
            assert_eq!(metrics.providers_dialed.get(), 1);
            assert_eq!(metrics.dial_failures.get(), 1);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn announce_retries_until_success() {
        let routing = FlakyRouting::default();
        routing.state.lock().provide_failures_left = 3;
        let metrics = Arc::new(Metrics::default());
        let cancel = CancellationToken::new();
        let tasks = ProviderDiscovery::new(routing.clone(), cid(), metrics.clone()).spawn(
            DiscoveryOptions {
                announce: true,
                announce_interval: Duration::from_secs(60),
                discovery_interval: Duration::from_secs(60),
            },
            &cancel,
        );
        // retries after 1s, 2s and 3s
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(routing.state.lock().provide_calls, 4);
        #[cfg(feature = "metrics")]
        {
            assert_eq!(metrics.announce_failures.get(), 3);
            assert_eq!(metrics.announces.get(), 1);
        }

        // next announcement only after the full interval
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(routing.state.lock().provide_calls, 4);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(routing.state.lock().provide_calls, 5);

        cancel.cancel();
        assert!(tasks.is_cancelled());
        tasks.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn only_wiki_peers_are_tagged() {
        let routing = FlakyRouting::default();
        let metrics = Metrics::default();
        assert!(on_peer_connected(&routing, peer(2), &metrics).await);
        assert!(!on_peer_connected(&routing, peer(3), &metrics).await);
        assert!(!on_peer_connected(&routing, peer(9), &metrics).await);
        let tags = routing.state.lock().tags.clone();
        assert_eq!(tags, BTreeMap::from([(peer(2), HIGH_PRIORITY)]));
    }

    #[tokio::test]
    #[traced_test]
    async fn watcher_tags_connecting_wiki_peers() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let (_, a) = network.join(peer(1));
        let (_, b) = network.join(peer(2));
        let (_, _c) = network.join(peer(3));
        b.register_protocol(WIKI_PROTOCOL);

        let cancel = CancellationToken::new();
        let metrics = Arc::new(Metrics::default());
        let _watcher = spawn_connection_watcher(a.clone(), metrics.clone(), cancel.clone());

        a.dial(peer(2)).await?;
        a.dial(peer(3)).await?;
        let wait = async {
            while network.tag(peer(1), peer(2)).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait).await?;
        assert_eq!(network.tag(peer(1), peer(2)), Some(HIGH_PRIORITY));
        assert_eq!(network.tag(peer(1), peer(3)), None);
        cancel.cancel();
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn providers_found_over_mem_network() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let (_, a) = network.join(peer(1));
        let (_, b) = network.join(peer(2));
        let metrics = Arc::new(Metrics::default());

        ProviderDiscovery::new(a.clone(), cid(), metrics.clone())
            .announce()
            .await?;
        let discovery = ProviderDiscovery::new(b.clone(), cid(), metrics);
        assert_eq!(discovery.discover_and_connect().await?, 1);
        assert!(b.is_connected(peer(1)));
        assert!(a.is_connected(peer(2)));
        // already connected now
        assert_eq!(discovery.discover_and_connect().await?, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn bootstrap_dial_logs_failures() {
        let network = MemNetwork::new();
        let (_, a) = network.join(peer(1));
        let (_, _b) = network.join(peer(2));
        let connected = dial_bootstrap(&a, &[peer(1), peer(2), peer(7)]).await;
        assert_eq!(connected, 1);
        assert!(logs_contain("failed to dial bootstrap peer"));
    }
}
