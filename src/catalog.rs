//! The article catalog: the mapping of article names to their logs.
//!
//! The catalog itself is a replicated log named after the wiki. Every entry maps an article
//! name to the address of the article's own log (see [`entry`]). Remote entries reach a node
//! through two uncoordinated channels, a live [`LogEvent::EntryAppended`] notification and a
//! periodic full replay of the catalog log, and only the replay is guaranteed to see every
//! entry. Both feed [`ArticleCatalog`]'s single idempotent "new entry" handler.
//!
//! Collaborators eagerly open and sync the log of every article they learn about, which makes
//! them durable replicas of the wiki, and announce both the catalog and every article log on
//! the discovery mechanism. Readers open article logs lazily, when an article is read.

use std::{
    collections::{BTreeMap, HashMap, HashSet, hash_map},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::{OptionExt, Snafu, ensure};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinSet,
};
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::AbortOnDropHandle,
};
use tracing::{Instrument, debug, error_span, info, warn};

pub use self::entry::{CatalogEntry, DELIMITER, EntryError};
use crate::{
    article::{Article, ArticleError, VersionInfo},
    config::WikiConfig,
    discovery::{
        DiscoveryOptions, DiscoveryTasks, ProviderDiscovery, ProviderRouting, WIKI_PROTOCOL,
        dial_bootstrap, spawn_connection_watcher,
    },
    ids::{ContentId, LogAddress, PeerId},
    log::{
        LogError, LogEvent, LogHandle, LogStore, LogTarget, ReplicatedLog, SyncMode,
        open_and_maybe_sync,
    },
    metrics::Metrics,
    version::VersionId,
};

pub mod entry;

/// Errors of [`ArticleCatalog`] operations.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum CatalogError {
    #[snafu(display("Article not found: {name}"))]
    ArticleNotFound { name: String },
    #[snafu(display("Article already exists: {name}"))]
    ArticleAlreadyExists { name: String },
    #[snafu(display("Article {name} was not fetched by this node before editing"))]
    NotPreviouslyFetched { name: String },
    #[snafu(display("No providers found for wiki {wiki}"))]
    NoProvidersFound { wiki: String },
    #[snafu(display("Invalid article name {name:?}"))]
    InvalidArticleName { name: String },
    #[snafu(transparent)]
    Article { source: ArticleError },
    #[snafu(transparent)]
    Log { source: LogError },
}

/// An article as returned by [`ArticleCatalog::get_article`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleContent {
    /// The article name.
    pub name: String,
    /// The text at the requested version.
    pub content: String,
    /// Metadata of every known version, ordered by date.
    pub versions: Vec<VersionInfo>,
}

/// The wiki as seen from one node.
///
/// Background tasks are aborted when the catalog is dropped. Use [`Self::shutdown`] to also
/// close the open logs.
#[derive(derive_more::Debug)]
pub struct ArticleCatalog<S: LogStore, R> {
    inner: Arc<Inner<S, R>>,
    #[debug("{} tasks", tasks.len())]
    tasks: Vec<AbortOnDropHandle<()>>,
    wiki_discovery: Option<DiscoveryTasks>,
    #[debug(skip)]
    _drop_guard: DropGuard,
}

#[derive(derive_more::Debug)]
struct Inner<S: LogStore, R> {
    #[debug(skip)]
    store: S,
    #[debug(skip)]
    routing: R,
    config: WikiConfig,
    #[debug(skip)]
    catalog: LogHandle<S::Log>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    #[debug(skip)]
    state: Mutex<State<S::Log>>,
}

struct State<L> {
    addresses: BTreeMap<String, LogAddress>,
    articles: HashMap<String, Arc<Article<L>>>,
    discoveries: HashMap<String, DiscoveryTasks>,
    last_fetched: HashMap<String, VersionId>,
    creating: HashSet<String>,
    /// Names with a replication task in flight.
    replicating: HashSet<String>,
    replications: JoinSet<()>,
}

impl<L> Default for State<L> {
    fn default() -> Self {
        Self {
            addresses: Default::default(),
            articles: Default::default(),
            discoveries: Default::default(),
            last_fetched: Default::default(),
            creating: Default::default(),
            replicating: Default::default(),
            replications: JoinSet::new(),
        }
    }
}

fn discovery_options(config: &WikiConfig, announce: bool) -> DiscoveryOptions {
    DiscoveryOptions {
        announce,
        announce_interval: config.announce_interval(),
        discovery_interval: config.discovery_interval(),
    }
}

impl<S, R> ArticleCatalog<S, R>
where
    S: LogStore,
    R: ProviderRouting,
{
    /// Opens the catalog of the wiki named in `config` and starts the background tasks.
    ///
    /// Waits (bounded) for the catalog log to sync with a provider. A collaborator that finds
    /// no provider starts a new wiki, a reader fails with [`CatalogError::NoProvidersFound`].
    pub async fn init(store: S, routing: R, config: WikiConfig) -> Result<Self, CatalogError> {
        let metrics = Arc::new(Metrics::default());
        let cancel = CancellationToken::new();
        let me = routing.local_peer_id();
        let wiki_address = LogAddress::for_name(&config.wiki_name);
        let mut tasks = Vec::new();
        let mut wiki_discovery = None;

        if !config.offline {
            routing.register_protocol(WIKI_PROTOCOL);
            tasks.push(spawn_connection_watcher(
                routing.clone(),
                metrics.clone(),
                cancel.child_token(),
            ));
            dial_bootstrap(&routing, &config.bootstrap_peers).await;
            let discovery = ProviderDiscovery::new(
                routing.clone(),
                ContentId::from(&wiki_address),
                metrics.clone(),
            );
            wiki_discovery =
                Some(discovery.spawn(discovery_options(&config, config.collaborator), &cancel));
        }

        let mode = if config.offline {
            SyncMode::Create
        } else {
            SyncMode::WaitForSync(config.sync_options())
        };
        let (catalog, synced) =
            open_and_maybe_sync(&store, LogTarget::Name(&config.wiki_name), mode).await?;
        if !synced && !config.offline {
            if config.collaborator {
                info!(wiki = %config.wiki_name, "no providers found, starting a new wiki");
            } else {
                cancel.cancel();
                if let Err(err) = catalog.log().close().await {
                    warn!("failed to close catalog log: {err:#}");
                }
                return NoProvidersFoundSnafu {
                    wiki: config.wiki_name,
                }
                .fail();
            }
        }
        let events = catalog.log().subscribe();
        let drop_guard = cancel.clone().drop_guard();

        let span = error_span!("catalog", wiki = %config.wiki_name, me = %me.fmt_short());
        let inner = Arc::new(Inner {
            store,
            routing,
            config,
            catalog,
            cancel,
            metrics,
            state: Mutex::new(State::default()),
        });
        if let Err(err) = inner.reconcile().instrument(span.clone()).await {
            inner.metrics.reconcile_failures.inc();
            warn!("initial catalog scan failed: {err:#}");
        }
        tasks.push(AbortOnDropHandle::new(tokio::task::spawn(
            inner.clone().reconcile_loop().instrument(span.clone()),
        )));
        tasks.push(AbortOnDropHandle::new(tokio::task::spawn(
            inner.clone().listen(events).instrument(span),
        )));
        info!(
            wiki = %inner.config.wiki_name,
            address = %wiki_address,
            collaborator = inner.config.collaborator,
            "catalog opened"
        );
        Ok(Self {
            inner,
            tasks,
            wiki_discovery,
            _drop_guard: drop_guard,
        })
    }

    /// Reads an article, at `version` or at the tip of its main branch.
    ///
    /// Records the tip of the main branch as the version this node last fetched, which is what
    /// a later [`Self::edit_article`] builds on.
    pub async fn get_article(
        &self,
        name: &str,
        version: Option<VersionId>,
    ) -> Result<ArticleContent, CatalogError> {
        let address = self
            .inner
            .state
            .lock()
            .addresses
            .get(name)
            .copied()
            .context(ArticleNotFoundSnafu { name })?;
        let article = self.inner.open_article(name, &address).await?;
        article.refresh().await?;
        let current = article.current_version_id()?;
        let content = article.get_content(version.as_ref())?;
        let versions = article.get_versions()?;
        self.inner
            .state
            .lock()
            .last_fetched
            .insert(name.to_string(), current);
        self.inner.metrics.articles_fetched.inc();
        Ok(ArticleContent {
            name: name.to_string(),
            content,
            versions,
        })
    }

    /// Creates an article with `content` as its first version.
    pub async fn new_article(&self, name: &str, content: &str) -> Result<(), CatalogError> {
        ensure!(
            !name.is_empty() && !name.contains(DELIMITER),
            InvalidArticleNameSnafu { name }
        );
        {
            let mut state = self.inner.state.lock();
            ensure!(
                !state.addresses.contains_key(name) && !state.creating.contains(name),
                ArticleAlreadyExistsSnafu { name }
            );
            state.creating.insert(name.to_string());
        }
        let res = self.inner.create_article(name, content).await;
        self.inner.state.lock().creating.remove(name);
        res
    }

    /// Appends `content` as a new version of an article, derived from the version this node
    /// fetched last.
    pub async fn edit_article(&self, name: &str, content: &str) -> Result<(), CatalogError> {
        let (address, parent) = {
            let state = self.inner.state.lock();
            let address = state
                .addresses
                .get(name)
                .copied()
                .context(ArticleNotFoundSnafu { name })?;
            let parent = state
                .last_fetched
                .get(name)
                .copied()
                .context(NotPreviouslyFetchedSnafu { name })?;
            (address, parent)
        };
        let article = self.inner.open_article(name, &address).await?;
        article.refresh().await?;
        let id = article.new_content(content, Some(parent)).await?;
        self.inner
            .state
            .lock()
            .last_fetched
            .insert(name.to_string(), id);
        self.inner.metrics.articles_edited.inc();
        info!(article = %name, version = %id.fmt_short(), "article edited");
        Ok(())
    }

    /// Names of all known articles, sorted.
    pub fn get_article_list(&self) -> Vec<String> {
        self.inner.state.lock().addresses.keys().cloned().collect()
    }

    /// The log address registered for article `name`.
    pub fn article_address(&self, name: &str) -> Option<LogAddress> {
        self.inner.state.lock().addresses.get(name).copied()
    }

    /// Whether this node is a collaborator.
    pub fn is_collaborator(&self) -> bool {
        self.inner.config.collaborator
    }

    /// The address of the catalog log.
    pub fn wiki_address(&self) -> LogAddress {
        self.inner.catalog.address()
    }

    /// The id of the local node.
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.routing.local_peer_id()
    }

    /// Counters of this catalog.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Runs one full scan of the catalog log now, returning the number of new articles.
    pub async fn reconcile(&self) -> Result<usize, CatalogError> {
        self.inner.reconcile().await
    }

    /// Stops all background tasks, then closes every open log.
    pub async fn shutdown(self) -> Result<(), CatalogError> {
        let Self {
            inner,
            tasks,
            wiki_discovery,
            _drop_guard,
        } = self;
        inner.cancel.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("catalog task failed: {err:#}");
                }
            }
        }
        let mut replications = std::mem::take(&mut inner.state.lock().replications);
        replications.shutdown().await;
        if let Some(discovery) = wiki_discovery {
            discovery.shutdown().await;
        }
        let (articles, discoveries) = {
            let mut state = inner.state.lock();
            let articles: Vec<_> = state.articles.drain().map(|(_, a)| a).collect();
            let discoveries: Vec<_> = state.discoveries.drain().map(|(_, d)| d).collect();
            (articles, discoveries)
        };
        for discovery in discoveries {
            discovery.shutdown().await;
        }
        for article in articles {
            if let Err(err) = article.close().await {
                warn!(article = %article.name(), "failed to close article log: {err:#}");
            }
        }
        inner.catalog.log().close().await?;
        info!(wiki = %inner.config.wiki_name, "catalog shut down");
        Ok(())
    }
}

impl<S, R> Inner<S, R>
where
    S: LogStore,
    R: ProviderRouting,
{
    fn sync_mode(&self) -> SyncMode {
        if self.config.offline {
            SyncMode::Create
        } else {
            SyncMode::WaitForSync(self.config.sync_options())
        }
    }

    fn spawn_article_discovery(&self, address: &LogAddress) -> Option<DiscoveryTasks> {
        if self.config.offline || !self.config.collaborator {
            return None;
        }
        let discovery = ProviderDiscovery::new(
            self.routing.clone(),
            ContentId::from(address),
            self.metrics.clone(),
        );
        Some(discovery.spawn(discovery_options(&self.config, true), &self.cancel))
    }

    /// Scans the whole catalog log, handling every entry not known yet.
    ///
    /// On a collaborator this also retries the replication of every registered article whose
    /// log is not open yet.
    async fn reconcile(self: &Arc<Self>) -> Result<usize, CatalogError> {
        let entries = self.catalog.log().entries().await?;
        self.metrics.reconcile_passes.inc();
        let mut found = 0;
        for entry in entries {
            match CatalogEntry::from_bytes(&entry.payload) {
                Ok(entry) => {
                    if self.handle_new_entry(entry) {
                        found += 1;
                    }
                }
                Err(err) => warn!(hash = ?entry.hash, "skipping catalog entry: {err:#}"),
            }
        }
        if found > 0 {
            debug!(found, "catalog scan found new articles");
        }
        if self.config.collaborator {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            while let Some(res) = state.replications.try_join_next() {
                if let Err(err) = res {
                    if !err.is_cancelled() {
                        warn!("replication task failed: {err:#}");
                    }
                }
            }
            let missing: Vec<_> = state
                .addresses
                .iter()
                .filter(|(name, _)| !state.articles.contains_key(*name))
                .map(|(name, address)| (name.clone(), *address))
                .collect();
            for (name, address) in missing {
                self.schedule_replication(state, &name, address);
            }
        }
        Ok(found)
    }

    /// Registers a catalog entry. Returns whether it was new.
    ///
    /// Safe to call any number of times for the same entry. The first address registered for
    /// a name wins. Collaborators replicate new articles in the background.
    fn handle_new_entry(self: &Arc<Self>, entry: CatalogEntry) -> bool {
        let mut state = self.state.lock();
        match state.addresses.get(&entry.name) {
            Some(address) if *address == entry.address => return false,
            Some(address) => {
                warn!(
                    article = %entry.name,
                    known = %address,
                    ignored = %entry.address,
                    "conflicting catalog entry"
                );
                return false;
            }
            None => {
                state.addresses.insert(entry.name.clone(), entry.address);
            }
        }
        self.metrics.catalog_entries_registered.inc();
        info!(article = %entry.name, "new article found");
        if self.config.collaborator {
            self.schedule_replication(&mut state, &entry.name, entry.address);
        }
        true
    }

    /// Spawns the replication of an article unless its log is open or already being opened.
    fn schedule_replication(
        self: &Arc<Self>,
        state: &mut State<S::Log>,
        name: &str,
        address: LogAddress,
    ) {
        if state.articles.contains_key(name) || !state.replicating.insert(name.to_string()) {
            return;
        }
        let this = self.clone();
        let name = name.to_string();
        let span = error_span!("replicate", article = %name);
        state.replications.spawn(
            async move {
                tokio::select! {
                    _ = this.cancel.cancelled() => {}
                    res = this.replicate_article(&name, &address) => {
                        if let Err(err) = res {
                            warn!("failed to replicate article: {err:#}");
                        }
                    }
                }
                this.state.lock().replicating.remove(&name);
            }
            .instrument(span),
        );
    }

    /// Opens and syncs an article log to keep a durable replica of it.
    async fn replicate_article(&self, name: &str, address: &LogAddress) -> Result<(), CatalogError> {
        let opened = self.state.lock().articles.contains_key(name);
        if !opened {
            let article =
                Article::open_existing(&self.store, name, address, self.sync_mode()).await?;
            let mut state = self.state.lock();
            if let hash_map::Entry::Vacant(slot) = state.articles.entry(name.to_string()) {
                slot.insert(Arc::new(article));
                self.metrics.articles_replicated.inc();
                info!(article = %name, "article replicated");
            }
        }
        self.ensure_article_discovery(&mut self.state.lock(), name, address);
        Ok(())
    }

    /// Starts announcing and discovering an article log, once per article and only on a
    /// collaborator.
    fn ensure_article_discovery(
        &self,
        state: &mut State<S::Log>,
        name: &str,
        address: &LogAddress,
    ) {
        if state.discoveries.contains_key(name) {
            return;
        }
        if let Some(discovery) = self.spawn_article_discovery(address) {
            state.discoveries.insert(name.to_string(), discovery);
        }
    }

    /// Returns the open article, opening its log first if needed.
    async fn open_article(
        &self,
        name: &str,
        address: &LogAddress,
    ) -> Result<Arc<Article<S::Log>>, CatalogError> {
        let cached = self.state.lock().articles.get(name).cloned();
        if let Some(article) = cached {
            return Ok(article);
        }
        if !self.config.offline {
            let discovery = ProviderDiscovery::new(
                self.routing.clone(),
                ContentId::from(address),
                self.metrics.clone(),
            );
            if let Err(err) = discovery.discover_and_connect().await {
                warn!(article = %name, "failed to find article providers: {err:#}");
            }
        }
        let article = Article::open_existing(&self.store, name, address, self.sync_mode()).await?;
        let mut state = self.state.lock();
        let article = state
            .articles
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(article))
            .clone();
        self.ensure_article_discovery(&mut state, name, address);
        Ok(article)
    }

    async fn create_article(&self, name: &str, content: &str) -> Result<(), CatalogError> {
        let article = Article::create(&self.store, &self.config.wiki_name, name).await?;
        let version = article.new_content(content, None).await?;
        let address = article.address();
        let entry = CatalogEntry::new(name, address);
        self.catalog
            .log()
            .append(Bytes::from(entry.to_bytes()))
            .await?;

        let mut state = self.state.lock();
        state.addresses.entry(name.to_string()).or_insert(address);
        state
            .articles
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(article));
        state.last_fetched.insert(name.to_string(), version);
        self.ensure_article_discovery(&mut state, name, &address);
        self.metrics.articles_created.inc();
        info!(article = %name, address = %address, "article created");
        Ok(())
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let interval = self.config.reconcile_interval();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.reconcile() => {
                    if let Err(err) = res {
                        self.metrics.reconcile_failures.inc();
                        warn!("catalog scan failed: {err:#}");
                    }
                }
            }
        }
        debug!("reconcile loop stopped");
    }

    async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<LogEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(LogEvent::EntryAppended(entry)) => {
                    match CatalogEntry::from_bytes(&entry.payload) {
                        Ok(entry) => {
                            self.handle_new_entry(entry);
                        }
                        Err(err) => warn!(hash = ?entry.hash, "skipping catalog entry: {err:#}"),
                    }
                }
                Ok(LogEvent::PeerJoined(peer)) => {
                    debug!(peer = %peer.fmt_short(), "peer joined the catalog");
                }
                Ok(LogEvent::PeerLeft(peer)) => {
                    debug!(peer = %peer.fmt_short(), "peer left the catalog");
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("missed {n} catalog events, relying on the next scan");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("catalog listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::{Duration, Instant},
    };

    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        mem::{MemLog, MemLogStore, MemNetwork, MemRouting},
        version::VersionError,
    };

    type MemCatalog = ArticleCatalog<MemLogStore, MemRouting>;

    /// Fails the first open of one log address.
    #[derive(Debug, Clone)]
    struct FailOnceStore {
        inner: MemLogStore,
        address: LogAddress,
        failed: Arc<AtomicBool>,
    }

    impl LogStore for FailOnceStore {
        type Log = MemLog;

        async fn open(&self, name: &str) -> Result<MemLog, LogError> {
            self.inner.open(name).await
        }

        async fn open_address(&self, address: &LogAddress) -> Result<MemLog, LogError> {
            if *address == self.address && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(LogError::from_err(std::io::Error::other("disk full")));
            }
            self.inner.open_address(address).await
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
        let start = Instant::now();
        while !check() {
            anyhow::ensure!(start.elapsed() < Duration::from_secs(5), "timed out");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    /// Writes an article with one version directly to the log of `store`.
    async fn write_article(
        store: &MemLogStore,
        name: &str,
        content: &str,
    ) -> anyhow::Result<LogAddress> {
        let article = Article::create(store, "test-wiki", name).await?;
        article.new_content(content, None).await?;
        Ok(article.address())
    }

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn offline_config() -> WikiConfig {
        WikiConfig {
            wiki_name: "test-wiki".to_string(),
            offline: true,
            ..Default::default()
        }
    }

    async fn offline_node(network: &MemNetwork, n: u8) -> anyhow::Result<MemCatalog> {
        let (store, routing) = network.join(peer(n));
        Ok(ArticleCatalog::init(store, routing, offline_config()).await?)
    }

    #[tokio::test]
    #[traced_test]
    async fn local_article_lifecycle() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let node = offline_node(&network, 1).await?;

        node.new_article("intro", "hello").await?;
        assert_eq!(node.get_article_list(), vec!["intro".to_string()]);
        assert_eq!(
            node.article_address("intro"),
            Some(LogAddress::for_name("test-wiki::intro"))
        );

        // creating counts as having fetched
        node.edit_article("intro", "hello world").await?;
        node.edit_article("intro", "hello world!").await?;
        let article = node.get_article("intro", None).await?;
        assert_eq!(article.content, "hello world!");
        assert_eq!(article.versions.len(), 3);
        assert!(article.versions.iter().all(|v| v.main_branch));

        let first = article
            .versions
            .iter()
            .find(|v| v.parent.is_none())
            .map(|v| v.id);
        let old = node.get_article("intro", first).await?;
        assert_eq!(old.content, "hello");
        #[cfg(feature = "metrics")]
        {
            assert_eq!(node.metrics().articles_created.get(), 1);
            assert_eq!(node.metrics().articles_edited.get(), 2);
        }
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn operation_errors() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let node = offline_node(&network, 1).await?;
        node.new_article("intro", "hello").await?;

        assert!(matches!(
            node.new_article("intro", "again").await,
            Err(CatalogError::ArticleAlreadyExists { .. })
        ));
        assert!(matches!(
            node.get_article("missing", None).await,
            Err(CatalogError::ArticleNotFound { .. })
        ));
        assert!(matches!(
            node.edit_article("missing", "x").await,
            Err(CatalogError::ArticleNotFound { .. })
        ));
        for name in ["", "a::b"] {
            assert!(matches!(
                node.new_article(name, "x").await,
                Err(CatalogError::InvalidArticleName { .. })
            ));
        }
        assert_eq!(node.get_article_list(), vec!["intro".to_string()]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn edit_requires_prior_fetch() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let node = offline_node(&network, 1).await?;
        let address = LogAddress::for_name("test-wiki::remote");
        node.inner
            .handle_new_entry(CatalogEntry::new("remote", address));

        assert!(matches!(
            node.edit_article("remote", "x").await,
            Err(CatalogError::NotPreviouslyFetched { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_article_log_has_no_versions() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let node = offline_node(&network, 1).await?;
        node.inner
            .handle_new_entry(CatalogEntry::new(
                "empty",
                LogAddress::for_name("test-wiki::empty"),
            ));
        let err = node.get_article("empty", None).await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Article {
                source: ArticleError::Version {
                    source: VersionError::NoVersions {}
                }
            }
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn registration_is_idempotent() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let node = offline_node(&network, 1).await?;
        let entry = CatalogEntry::new("intro", LogAddress::for_name("test-wiki::intro"));
        node.inner
            .catalog
            .log()
            .append(Bytes::from(entry.to_bytes()))
            .await?;

        // live notification and replay both deliver the same entry
        let live = node.inner.handle_new_entry(entry.clone());
        let replay = node.reconcile().await?;
        assert_eq!(usize::from(live) + replay, 1);
        assert!(!node.inner.handle_new_entry(entry));
        assert_eq!(node.reconcile().await?, 0);
        assert_eq!(node.get_article_list(), vec!["intro".to_string()]);
        #[cfg(feature = "metrics")]
        assert_eq!(node.metrics().catalog_entries_registered.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn first_registration_wins_and_garbage_is_skipped() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let node = offline_node(&network, 1).await?;
        let first = LogAddress::for_name("first");
        let second = LogAddress::for_name("second");
        let log = node.inner.catalog.log();
        log.append(Bytes::from(CatalogEntry::new("intro", first).to_bytes()))
            .await?;
        log.append(Bytes::from_static(b"garbage")).await?;
        log.append(Bytes::from(CatalogEntry::new("intro", second).to_bytes()))
            .await?;

        assert_eq!(node.reconcile().await?, 1);
        assert_eq!(node.article_address("intro"), Some(first));
        assert!(logs_contain("skipping catalog entry"));
        assert!(logs_contain("conflicting catalog entry"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn reader_opens_article_logs_on_read() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let node = offline_node(&network, 1).await?;
        let address = write_article(&node.inner.store, "remote", "remote text").await?;

        assert!(
            node.inner
                .handle_new_entry(CatalogEntry::new("remote", address))
        );
        assert_eq!(node.get_article_list(), vec!["remote".to_string()]);
        {
            let state = node.inner.state.lock();
            assert!(state.articles.is_empty());
            assert!(state.replicating.is_empty());
        }
        #[cfg(feature = "metrics")]
        assert_eq!(node.metrics().articles_replicated.get(), 0);

        let article = node.get_article("remote", None).await?;
        assert_eq!(article.content, "remote text");
        assert!(node.inner.state.lock().articles.contains_key("remote"));
        #[cfg(feature = "metrics")]
        assert_eq!(node.metrics().articles_replicated.get(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_replication_is_retried() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let (store, routing) = network.join(peer(1));
        let address = write_article(&store, "flaky", "text").await?;
        let store = FailOnceStore {
            inner: store,
            address,
            failed: Arc::new(AtomicBool::new(false)),
        };
        let config = WikiConfig {
            collaborator: true,
            // keep the background scan out of the way
            reconcile_interval_ms: 3_600_000,
            ..offline_config()
        };
        let node = ArticleCatalog::init(store, routing, config).await?;

        assert!(
            node.inner
                .handle_new_entry(CatalogEntry::new("flaky", address))
        );
        wait_until(|| node.inner.state.lock().replicating.is_empty()).await?;
        assert!(logs_contain("failed to replicate article"));
        assert!(!node.inner.state.lock().articles.contains_key("flaky"));

        // the next scan tries again
        assert_eq!(node.reconcile().await?, 0);
        wait_until(|| node.inner.state.lock().articles.contains_key("flaky")).await?;
        #[cfg(feature = "metrics")]
        assert_eq!(node.metrics().articles_replicated.get(), 1);
        assert_eq!(node.get_article("flaky", None).await?.content, "text");
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn replication_after_read_keeps_discovery() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let (store, routing) = network.join(peer(1));
        let config = WikiConfig {
            wiki_name: "test-wiki".to_string(),
            collaborator: true,
            sync_poll_interval_ms: 5,
            sync_timeout_ms: 20,
            reconcile_interval_ms: 3_600_000,
            ..Default::default()
        };
        let address = write_article(&store, "intro", "hello").await?;
        let node = ArticleCatalog::init(store, routing, config).await?;

        // a read opened the log before replication got to it
        let article =
            Article::open_existing(&node.inner.store, "intro", &address, SyncMode::Create).await?;
        {
            let mut state = node.inner.state.lock();
            state.addresses.insert("intro".to_string(), address);
            state.articles.insert("intro".to_string(), Arc::new(article));
        }
        node.inner.replicate_article("intro", &address).await?;
        assert!(node.inner.state.lock().discoveries.contains_key("intro"));

        // scans neither reopen the log nor restart its discovery
        node.reconcile().await?;
        {
            let state = node.inner.state.lock();
            assert!(state.replicating.is_empty());
            assert_eq!(state.discoveries.len(), 1);
        }
        #[cfg(feature = "metrics")]
        assert_eq!(node.metrics().articles_replicated.get(), 0);
        tokio::time::timeout(Duration::from_secs(1), node.shutdown()).await??;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn reader_without_providers_fails() -> anyhow::Result<()> {
        let network = MemNetwork::new();
        let (store, routing) = network.join(peer(1));
        let config = WikiConfig {
            wiki_name: "test-wiki".to_string(),
            sync_poll_interval_ms: 5,
            sync_timeout_ms: 50,
            ..Default::default()
        };
        let res = ArticleCatalog::init(store.clone(), routing.clone(), config.clone()).await;
        assert!(matches!(res, Err(CatalogError::NoProvidersFound { .. })));

        // a collaborator starts a new wiki instead
        let config = WikiConfig {
            collaborator: true,
            ..config
        };
        let node = ArticleCatalog::init(store, routing, config).await?;
        assert!(node.is_collaborator());
        assert!(node.get_article_list().is_empty());
        tokio::time::timeout(Duration::from_secs(1), node.shutdown()).await??;
        Ok(())
    }
}
