use std::{path::PathBuf, time::Duration};

use rand::{thread_rng, Rng};
use trackless::{Config, DhtNode};
use tracing_subscriber::{fmt, EnvFilter};

#[allow(dead_code)]
pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// A loopback configuration with timers short enough for tests.
#[allow(dead_code)]
pub fn config() -> Config {
    Config {
        tick_interval: Duration::from_millis(50),
        bootstrap_retry: Duration::from_millis(200),
        request_timeout: Duration::from_secs(1),
        ..Config::local()
    }
}

#[allow(dead_code)]
pub fn bootstrapping_from(node: &DhtNode) -> Config {
    Config {
        bootstrap_nodes: vec![node.local_addr().to_string()],
        ..config()
    }
}

#[allow(dead_code)]
pub async fn spawn(config: Config) -> DhtNode {
    DhtNode::spawn(config).await.unwrap()
}

/// A snapshot path unique to the calling test.
#[allow(dead_code)]
pub fn snapshot_path() -> PathBuf {
    let suffix: u64 = thread_rng().gen();
    std::env::temp_dir().join(format!("trackless-{suffix:016x}.bencode"))
}
