//! Replication and version reconciliation for a peer-to-peer wiki.
//!
//! Articles are named documents whose history is a DAG of text patches ([`version`]). Every
//! article lives in its own replicated append-only [`log`], and a catalog log per wiki maps
//! article names to article logs ([`catalog`]). Nodes find each other through a content
//! routing mechanism ([`discovery`]).
//!
//! The replicated log and the network are provided by implementations of
//! [`LogStore`]/[`ReplicatedLog`] and [`ProviderRouting`]. The [`mem`] module implements both
//! in process.
//!
//! ```no_run
//! use astrawiki::{ArticleCatalog, PeerId, WikiConfig, mem::MemNetwork};
//!
//! # async fn run() -> Result<(), astrawiki::CatalogError> {
//! let network = MemNetwork::new();
//! let (store, routing) = network.join(PeerId::from_bytes([1; 32]));
//! let config = WikiConfig {
//!     collaborator: true,
//!     ..Default::default()
//! };
//! let wiki = ArticleCatalog::init(store, routing, config).await?;
//! wiki.new_article("intro", "hello").await?;
//! let article = wiki.get_article("intro", None).await?;
//! assert_eq!(article.content, "hello");
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod article;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod ids;
pub mod log;
pub mod mem;
pub mod metrics;
pub mod version;

pub use self::{
    article::{Article, ArticleError, VersionInfo},
    catalog::{ArticleCatalog, ArticleContent, CatalogError},
    config::{ConfigError, WikiConfig},
    discovery::{ProviderDiscovery, ProviderRouting, RoutingError},
    ids::{ContentId, LogAddress, ParseError, PeerId},
    log::{LogError, LogStore, ReplicatedLog},
    version::{Version, VersionError, VersionId, VersionManager},
};
