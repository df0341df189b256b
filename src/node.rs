//! A DHT node running on a tokio UDP socket.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    core::{contact::Contact, id::NodeId},
    engine::{DhtEngine, PeersReply},
    error::DhtError,
};

// The largest UDP payload.
const MAX_DATAGRAM: usize = 65_535;
const COMMAND_QUEUE: usize = 64;

type Engine = DhtEngine<Arc<UdpSocket>>;

/// A point-in-time view of a node's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// The number of contacts in the routing table.
    pub contacts: usize,
    /// The number of outstanding queries.
    pub pending: usize,
    pub bootstrapped: bool,
    pub filled: bool,
}

impl NodeStats {
    fn of(engine: &Engine) -> Self {
        Self {
            contacts: engine.table().size(),
            pending: engine.pending(),
            bootstrapped: engine.is_bootstrapped(),
            filled: engine.is_filled(),
        }
    }
}

enum Command {
    Ping {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<NodeId, DhtError>>,
    },
    FindNode {
        addr: SocketAddr,
        target: NodeId,
        reply: oneshot::Sender<Result<Vec<Contact>, DhtError>>,
    },
    GetPeers {
        addr: SocketAddr,
        info_hash: NodeId,
        reply: oneshot::Sender<Result<PeersReply, DhtError>>,
    },
    AnnouncePeer {
        addr: SocketAddr,
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
        reply: oneshot::Sender<Result<NodeId, DhtError>>,
    },
    FindNearest {
        target: NodeId,
        quantity: usize,
        reply: oneshot::Sender<Vec<Contact>>,
    },
    Save {
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    Shutdown,
}

/// A handle to a running DHT node.
///
/// The node's state lives in a single task which serializes inbound datagrams, calls made through
/// this handle and the maintenance timer. Handles are cheap to clone.
#[derive(Clone)]
pub struct DhtNode {
    local_id: NodeId,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    stats: Arc<RwLock<NodeStats>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DhtNode {
    /// Binds the socket, resolves the bootstrap nodes, restores the snapshot if there is one and
    /// starts the node's task.
    pub async fn spawn(config: Config) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(config.listen_addr).await?);
        let local_addr = socket.local_addr()?;

        let mut engine = DhtEngine::new(config.clone(), socket.clone())?;
        for node in &config.bootstrap_nodes {
            // Literal addresses are picked up by the engine.
            if node.parse::<SocketAddr>().is_ok() {
                continue;
            }

            match lookup_host(node.as_str()).await {
                Ok(addrs) => addrs
                    .filter(SocketAddr::is_ipv4)
                    .for_each(|addr| engine.add_bootstrap_node(addr)),
                Err(e) => warn!("failed to resolve bootstrap node {node}: {e}"),
            }
        }

        if let Err(e) = engine.load() {
            warn!("failed to restore the routing table: {e}");
        }

        let local_id = engine.local_id();
        let stats = Arc::new(RwLock::new(NodeStats::of(&engine)));
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);

        let task = tokio::spawn(run(
            engine,
            socket,
            receiver,
            stats.clone(),
            config,
        ));

        info!("dht node {local_id} listening on {local_addr}");

        Ok(Self {
            local_id,
            local_addr,
            commands,
            stats,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the node's state as of the last event it processed.
    pub fn stats(&self) -> NodeStats {
        *self.stats.read()
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Ping { addr, reply }).await?;

        response.await.map_err(|_| DhtError::Shutdown)?
    }

    pub async fn find_node(
        &self,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<Vec<Contact>, DhtError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::FindNode {
            addr,
            target,
            reply,
        })
        .await?;

        response.await.map_err(|_| DhtError::Shutdown)?
    }

    pub async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: NodeId,
    ) -> Result<PeersReply, DhtError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::GetPeers {
            addr,
            info_hash,
            reply,
        })
        .await?;

        response.await.map_err(|_| DhtError::Shutdown)?
    }

    /// Announces the info hash to the node at `addr`, see [`DhtEngine::announce_peer`].
    pub async fn announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
    ) -> Result<NodeId, DhtError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::AnnouncePeer {
            addr,
            info_hash,
            port,
            implied_port,
            token,
            reply,
        })
        .await?;

        response.await.map_err(|_| DhtError::Shutdown)?
    }

    /// Returns up to `quantity` known contacts sorted by distance to the target.
    pub async fn find_nearest(
        &self,
        target: NodeId,
        quantity: usize,
    ) -> Result<Vec<Contact>, DhtError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::FindNearest {
            target,
            quantity,
            reply,
        })
        .await?;

        response.await.map_err(|_| DhtError::Shutdown)
    }

    /// Persists the routing table to the configured snapshot path.
    pub async fn save(&self) -> Result<(), DhtError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Save { reply }).await?;

        response.await.map_err(|_| DhtError::Shutdown)?
    }

    /// Stops the node's task, persisting the routing table first. Outstanding calls resolve with
    /// [`DhtError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("dht node task failed: {e}");
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), DhtError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DhtError::Shutdown)
    }
}

async fn run(
    mut engine: Engine,
    socket: Arc<UdpSocket>,
    mut commands: mpsc::Receiver<Command>,
    stats: Arc<RwLock<NodeStats>>,
    config: Config,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut ticker = interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    engine.handle_inbound_datagram(&buf[..len], from, OffsetDateTime::now_utc())
                }
                // ICMP errors surface here on some platforms, the socket is still usable.
                Err(e) => debug!("failed to receive a datagram: {e}"),
            },
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => execute(&mut engine, command),
            },
            _ = ticker.tick() => engine.tick(OffsetDateTime::now_utc()),
        }

        *stats.write() = NodeStats::of(&engine);
    }

    if let Err(e) = engine.save() {
        warn!("failed to persist the routing table: {e}");
    }

    info!("dht node {} stopped", engine.local_id());
}

fn execute(engine: &mut Engine, command: Command) {
    let now = OffsetDateTime::now_utc();

    // A dropped receiver means the caller lost interest, the result is discarded.
    match command {
        Command::Ping { addr, reply } => {
            engine.ping(
                addr,
                now,
                Box::new(move |result| {
                    let _ = reply.send(result);
                }),
            );
        }
        Command::FindNode {
            addr,
            target,
            reply,
        } => {
            engine.find_node(
                addr,
                target,
                now,
                Box::new(move |result| {
                    let _ = reply.send(result);
                }),
            );
        }
        Command::GetPeers {
            addr,
            info_hash,
            reply,
        } => {
            engine.get_peers(
                addr,
                info_hash,
                now,
                Box::new(move |result| {
                    let _ = reply.send(result);
                }),
            );
        }
        Command::AnnouncePeer {
            addr,
            info_hash,
            port,
            implied_port,
            token,
            reply,
        } => {
            engine.announce_peer(
                addr,
                info_hash,
                port,
                implied_port,
                token,
                now,
                Box::new(move |result| {
                    let _ = reply.send(result);
                }),
            );
        }
        Command::FindNearest {
            target,
            quantity,
            reply,
        } => {
            let _ = reply.send(engine.find_nearest(&target, quantity));
        }
        Command::Save { reply } => {
            let _ = reply.send(engine.save());
        }
        Command::Shutdown => {}
    }
}
