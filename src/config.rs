//! Tunables for the engine and the node service.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::core::{bucket::DEFAULT_BUCKET_CAPACITY, contact::PortOrder, id::NodeId};

/// Well known BitTorrent DHT routers.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Configuration of a DHT node.
///
/// Construct with struct update syntax over [`Config::default`]:
///
/// ```
/// use std::time::Duration;
///
/// use trackless::Config;
///
/// let config = Config {
///     request_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert_eq!(config.bucket_capacity, 8);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// The local identifier, random if `None`.
    pub node_id: Option<NodeId>,
    /// The UDP address the service binds to.
    pub listen_addr: SocketAddr,
    /// `host:port` strings resolved at startup.
    pub bootstrap_nodes: Vec<String>,
    /// The maximum number of contacts per bucket (k).
    pub bucket_capacity: usize,
    /// How long a query may stay unanswered before it resolves with a timeout.
    pub request_timeout: Duration,
    /// The maximum number of outstanding queries.
    pub max_pending: usize,
    /// How many of the contacts closest to the local id the fill lookup converges on.
    pub fill_width: usize,
    /// Don't run the fill lookup if more contacts than this were restored from a snapshot.
    pub fill_skip_threshold: usize,
    /// How often bootstrap is retried while no bootstrap node has answered.
    pub bootstrap_retry: Duration,
    /// The period of the service's maintenance timer.
    pub tick_interval: Duration,
    /// How often contacts are checked for liveness.
    pub liveness_interval: Duration,
    /// Contacts unconfirmed for longer than this are pinged.
    pub stale_after: Duration,
    /// Contacts unconfirmed for longer than this are probed for replacement.
    pub evict_after: Duration,
    /// Consecutive failed liveness pings after which a contact is evicted.
    pub max_failures: u8,
    /// Buckets idle for longer than this are refreshed with a lookup.
    pub bucket_refresh: Duration,
    /// Where the routing table is persisted, `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
    /// How often the routing table is persisted.
    pub persist_interval: Duration,
    /// Byte order of ports in compact node info.
    pub port_order: PortOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 6882)),
            bootstrap_nodes: BOOTSTRAP_NODES.iter().map(|node| node.to_string()).collect(),
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            request_timeout: Duration::from_secs(10),
            max_pending: 1024,
            fill_width: 40,
            fill_skip_threshold: 100,
            bootstrap_retry: Duration::from_secs(2),
            tick_interval: Duration::from_millis(500),
            liveness_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(15 * 60),
            evict_after: Duration::from_secs(20 * 60),
            max_failures: 3,
            bucket_refresh: Duration::from_secs(15 * 60),
            snapshot_path: None,
            persist_interval: Duration::from_secs(5 * 60),
            port_order: PortOrder::BigEndian,
        }
    }
}

impl Config {
    /// A configuration for local testing: binds to an ephemeral loopback port and knows no
    /// bootstrap nodes.
    pub fn local() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            bootstrap_nodes: Vec::new(),
            ..Default::default()
        }
    }
}
