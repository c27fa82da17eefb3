//! Counters of a wiki node.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by an [`ArticleCatalog`](crate::ArticleCatalog) and its discovery tasks.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "astrawiki")]
#[non_exhaustive]
pub struct Metrics {
    /// Articles created on this node.
    pub articles_created: Counter,
    /// Successful article reads.
    pub articles_fetched: Counter,
    /// Edits appended by this node.
    pub articles_edited: Counter,
    /// Article logs opened and synced because this node is a collaborator.
    pub articles_replicated: Counter,
    /// Catalog entries added to the in-memory name mapping.
    pub catalog_entries_registered: Counter,

    /*
     * Reconciliation
     */
    /// Full scans of the catalog log.
    pub reconcile_passes: Counter,
    /// Catalog scans that failed.
    pub reconcile_failures: Counter,

    /*
     * Discovery
     */
    /// Successful announcements of a content id.
    pub announces: Counter,
    /// Failed announcements.
    pub announce_failures: Counter,
    /// Providers this node connected to.
    pub providers_dialed: Counter,
    /// Failed dials to providers.
    pub dial_failures: Counter,
    /// Connections marked high priority.
    pub peers_tagged: Counter,
}
