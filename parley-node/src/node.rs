//! libp2p transport node.
//!
//! Owns the persistent keypair, the TCP listener, the connection registry,
//! and the gossipsub pub/sub instance. The swarm runs on a dedicated task;
//! engines reach it through a bounded command channel (dial, publish,
//! subscribe) and through a cloned [`libp2p_stream::Control`] for opening
//! and accepting per-protocol bidirectional streams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::identity;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p::{gossipsub, identify, kad, mdns, noise, tcp, yamux};
use libp2p_stream as stream;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
type NResult<T> = std::result::Result<T, Error>;
use crate::event::{Event, EventBus};
use crate::store::Store;

const IDENTIFY_PROTOCOL: &str = "/parley/id/1";

/// How long to wait for the TCP listener before giving up on startup.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle connections stay open; a messaging node wants peers reachable for
/// acks and queued redelivery, not torn down between keystrokes.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Options for bringing up a transport node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Preferred TCP port. Falls back to an ephemeral port when taken.
    pub port: u16,
    /// Directory holding the identity key (and the store, by default).
    pub data_dir: PathBuf,
    /// Local-network peer discovery; discovered peers are auto-dialed.
    pub enable_mdns: bool,
}

/// A message delivered by a gossipsub subscription.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// The peer this node received the message from. Handlers compare this
    /// against the local peer id to suppress self-echoes.
    pub received_from: PeerId,
    /// The original author, when the substrate carried it.
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

/// Receiving side of one topic subscription.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<GossipMessage>,
}

impl Subscription {
    /// The next message delivered to this node, or `None` once the node
    /// unsubscribed from the topic or shut down.
    pub async fn next(&mut self) -> Option<GossipMessage> {
        self.rx.recv().await
    }
}

/// Handle to one pub/sub topic.
#[derive(Clone)]
pub struct Topic {
    name: String,
    node: Node,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, data: Vec<u8>) -> NResult<()> {
        self.node.publish(&self.name, data).await
    }

    pub async fn subscribe(&self) -> NResult<Subscription> {
        self.node.subscribe(&self.name).await
    }

    pub async fn leave(&self) -> NResult<()> {
        self.node.unsubscribe(&self.name).await
    }
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    streams: stream::Behaviour,
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    kademlia: kad::Behaviour<kad::store::MemoryStore>,
    mdns: Toggle<mdns::tokio::Behaviour>,
}

enum Command {
    Dial {
        addr: Multiaddr,
        peer: PeerId,
        reply: oneshot::Sender<NResult<()>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<NResult<mpsc::UnboundedReceiver<GossipMessage>>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<NResult<()>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<NResult<()>>,
    },
}

/// Cloneable handle to the transport node.
#[derive(Clone)]
pub struct Node {
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    control: stream::Control,
    connections: Arc<RwLock<HashMap<PeerId, u32>>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    shutdown: CancellationToken,
}

impl Node {
    /// Bring up the swarm: load or create the identity, probe the port,
    /// start listening, and spawn the event loop. Resolves once the TCP
    /// listener is live.
    pub async fn spawn(opts: NodeOptions, store: Store, events: EventBus) -> NResult<Self> {
        let keypair = load_or_create_keypair(&opts.data_dir, opts.port)?;
        let local_peer_id = keypair.public().to_peer_id();
        tracing::info!(peer_id = %local_peer_id, "local peer identity loaded");

        let port = probe_port(opts.port);
        let enable_mdns = opts.enable_mdns;

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| Error::Transport(format!("tcp transport: {e}")))?
            .with_behaviour(|key| {
                let peer_id = key.public().to_peer_id();
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .build()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;
                let identify = identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                ));
                let kademlia =
                    kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
                let mdns = if enable_mdns {
                    Some(mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?)
                } else {
                    None
                };
                Ok(Behaviour {
                    streams: stream::Behaviour::new(),
                    gossipsub,
                    identify,
                    kademlia,
                    mdns: mdns.into(),
                })
            })
            .map_err(|e| Error::Transport(format!("behaviour: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let control = swarm.behaviour().streams.new_control();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{port}")
            .parse()
            .expect("static multiaddr");
        swarm
            .listen_on(listen_addr)
            .map_err(|e| Error::Transport(format!("listen: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let connections = Arc::new(RwLock::new(HashMap::new()));
        let listen_addrs = Arc::new(RwLock::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let mut task = SwarmTask {
            swarm,
            cmd_rx,
            connections: connections.clone(),
            listen_addrs: listen_addrs.clone(),
            subscribers: HashMap::new(),
            pending_dials: HashMap::new(),
            store,
            events,
            shutdown: shutdown.clone(),
        };

        tokio::time::timeout(LISTEN_TIMEOUT, task.wait_for_listener())
            .await
            .map_err(|_| Error::Transport("listener did not come up".into()))?;
        tokio::spawn(task.run());

        Ok(Self {
            peer_id: local_peer_id,
            cmd_tx,
            control,
            connections,
            listen_addrs,
            shutdown,
        })
    }

    /// Stable for the process lifetime.
    pub fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Human-shareable addresses of the form `<multiaddr>/p2p/<peer-id>`.
    pub fn advertised_addresses(&self) -> Vec<String> {
        self.listen_addrs
            .read()
            .iter()
            .map(|a| a.clone().with(Protocol::P2p(self.peer_id)).to_string())
            .collect()
    }

    /// Dial a composite overlay address. The address must carry a `/p2p/`
    /// component naming the expected peer.
    pub async fn dial(&self, address: &str) -> NResult<()> {
        let addr: Multiaddr = address
            .parse()
            .map_err(|_| Error::InvalidAddress(address.to_string()))?;
        let peer = addr
            .iter()
            .find_map(|p| match p {
                Protocol::P2p(peer) => Some(peer),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidAddress(format!("{address} (missing /p2p/ suffix)")))?;

        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial { addr, peer, reply }).await?;
        rx.await.map_err(|_| Error::Transport("node task stopped".into()))?
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.read().contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    /// Open a bidirectional stream negotiated for `protocol`.
    pub async fn open_stream(&self, peer: PeerId, protocol: &'static str) -> NResult<libp2p::Stream> {
        if !self.is_connected(&peer) {
            return Err(Error::NotConnected(peer.to_base58()));
        }
        let mut control = self.control.clone();
        control
            .open_stream(peer, StreamProtocol::new(protocol))
            .await
            .map_err(|e| match e {
                stream::OpenStreamError::UnsupportedProtocol(_) => {
                    Error::ProtocolUnsupported(protocol.to_string())
                }
                other => Error::Transport(other.to_string()),
            })
    }

    /// Register as the handler for an inbound stream protocol. Can be
    /// called once per protocol; the returned stream of `(peer, stream)`
    /// pairs is driven by the caller, one task per stream.
    pub fn accept(&self, protocol: &'static str) -> NResult<stream::IncomingStreams> {
        self.control
            .clone()
            .accept(StreamProtocol::new(protocol))
            .map_err(|_| Error::Transport(format!("handler already registered for {protocol}")))
    }

    /// Obtain a handle to a pub/sub topic without subscribing.
    pub fn join_topic(&self, name: &str) -> Topic {
        Topic { name: name.to_string(), node: self.clone() }
    }

    pub async fn subscribe(&self, topic: &str) -> NResult<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { topic: topic.to_string(), reply }).await?;
        let inner = rx.await.map_err(|_| Error::Transport("node task stopped".into()))??;
        Ok(Subscription { rx: inner })
    }

    pub async fn unsubscribe(&self, topic: &str) -> NResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe { topic: topic.to_string(), reply }).await?;
        rx.await.map_err(|_| Error::Transport("node task stopped".into()))?
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> NResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish { topic: topic.to_string(), data, reply }).await?;
        rx.await.map_err(|_| Error::Transport("node task stopped".into()))?
    }

    /// User lookup over the DHT. The routing table is maintained, but the
    /// query side has never been wired up.
    pub fn lookup_user(&self, _username: &str) -> NResult<String> {
        Err(Error::NotImplemented)
    }

    /// Cancellation signal tied to process shutdown. Long-lived tasks
    /// (stream accept loops, conference listeners) select on this.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the swarm task and cancel every task holding the shutdown token.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn send(&self, cmd: Command) -> NResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Transport("node task stopped".into()))
    }
}

// ── Swarm task ─────────────────────────────────────────────────────────

struct SwarmTask {
    swarm: Swarm<Behaviour>,
    cmd_rx: mpsc::Receiver<Command>,
    connections: Arc<RwLock<HashMap<PeerId, u32>>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    subscribers: HashMap<gossipsub::TopicHash, Vec<mpsc::UnboundedSender<GossipMessage>>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<NResult<()>>>>,
    store: Store,
    events: EventBus,
    shutdown: CancellationToken,
}

impl SwarmTask {
    /// Drive the swarm until the first listener address is known.
    async fn wait_for_listener(&mut self) {
        loop {
            let event = self.swarm.select_next_some().await;
            let ready = matches!(event, SwarmEvent::NewListenAddr { .. });
            self.handle_event(event);
            if ready {
                return;
            }
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("swarm task shutting down");
                    break;
                }
                event = self.swarm.select_next_some() => self.handle_event(event),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { addr, peer, reply } => {
                if self.connections.read().contains_key(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                match self.swarm.dial(addr) {
                    Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(Error::Unreachable(e.to_string())));
                    }
                }
            }
            Command::Subscribe { topic, reply } => {
                let topic = gossipsub::IdentTopic::new(topic);
                match self.swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                    Ok(_) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        self.subscribers.entry(topic.hash()).or_default().push(tx);
                        let _ = reply.send(Ok(rx));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::Transport(e.to_string())));
                    }
                }
            }
            Command::Unsubscribe { topic, reply } => {
                let topic = gossipsub::IdentTopic::new(topic);
                let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
                self.subscribers.remove(&topic.hash());
                let _ = reply.send(Ok(()));
            }
            Command::Publish { topic, data, reply } => {
                let topic = gossipsub::IdentTopic::new(topic);
                let result = match self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
                    Ok(_) => Ok(()),
                    // Nobody else is subscribed yet. The caller persists
                    // locally either way, so this is not an error.
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        tracing::debug!("publish with no remote subscribers");
                        Ok(())
                    }
                    Err(e) => Err(Error::Transport(e.to_string())),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
                self.listen_addrs.write().push(address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                self.connections.write().insert(peer_id, num_established.get());
                if num_established.get() == 1 {
                    tracing::info!(peer = %peer_id, "peer connected");
                    self.events.emit(Event::PeerConnected { peer_id: peer_id.to_base58() });
                }
                let remote = endpoint.get_remote_address().clone();
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, remote.clone());
                if let Err(e) =
                    self.store
                        .upsert_known_peer(&peer_id.to_base58(), "", &[remote.to_string()])
                {
                    tracing::warn!("failed to cache known peer: {e}");
                }
                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    self.connections.write().remove(&peer_id);
                    tracing::info!(peer = %peer_id, "peer disconnected");
                    self.events.emit(Event::PeerDisconnected { peer_id: peer_id.to_base58() });
                } else {
                    self.connections.write().insert(peer_id, num_established);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer), error, .. } => {
                tracing::debug!(peer = %peer, "outgoing connection failed: {error}");
                if let Some(waiters) = self.pending_dials.remove(&peer) {
                    for reply in waiters {
                        let err = match &error {
                            DialError::WrongPeerId { .. } => {
                                Error::AuthenticationFailed(peer.to_base58())
                            }
                            other => Error::Unreachable(other.to_string()),
                        };
                        let _ = reply.send(Err(err));
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let gossip = GossipMessage {
                    received_from: propagation_source,
                    source: message.source,
                    data: message.data,
                };
                if let Some(subscribers) = self.subscribers.get_mut(&message.topic) {
                    subscribers.retain(|tx| tx.send(gossip.clone()).is_ok());
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer, addr) in peers {
                    tracing::debug!(peer = %peer, %addr, "mdns discovered peer");
                    self.swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
                    if let Err(e) = self.swarm.dial(addr) {
                        tracing::debug!(peer = %peer, "mdns auto-dial failed: {e}");
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                let addrs: Vec<String> =
                    info.listen_addrs.iter().map(|a| a.to_string()).collect();
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                if let Err(e) = self.store.upsert_known_peer(&peer_id.to_base58(), "", &addrs) {
                    tracing::warn!("failed to cache identified peer: {e}");
                }
            }
            _ => {}
        }
    }
}

// ── Identity & ports ───────────────────────────────────────────────────

/// Load the node keypair for this (data dir, port) pair, generating and
/// persisting one on first run.
fn load_or_create_keypair(data_dir: &Path, port: u16) -> NResult<identity::Keypair> {
    let path = data_dir.join(format!("identity_{port}.key"));
    if path.exists() {
        let bytes = std::fs::read(&path)?;
        identity::Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| Error::Transport(format!("corrupt identity key {}: {e}", path.display())))
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        let bytes = keypair
            .to_protobuf_encoding()
            .map_err(|e| Error::Transport(format!("encode identity key: {e}")))?;
        std::fs::write(&path, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        tracing::info!("generated new identity key at {}", path.display());
        Ok(keypair)
    }
}

/// Probe the requested port; fall back to an ephemeral one when taken.
fn probe_port(port: u16) -> u16 {
    if port == 0 {
        return 0;
    }
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            port
        }
        Err(_) => {
            tracing::warn!("port {port} is already bound, using an ephemeral port instead");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_keypair(dir.path(), 4001).unwrap();
        let second = load_or_create_keypair(dir.path(), 4001).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());

        // A different port gets its own identity.
        let other = load_or_create_keypair(dir.path(), 4002).unwrap();
        assert_ne!(first.public().to_peer_id(), other.public().to_peer_id());
    }

    #[test]
    fn probe_falls_back_when_bound() {
        let holder = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();
        assert_eq!(probe_port(taken), 0);
        drop(holder);
    }

    #[tokio::test]
    async fn node_starts_and_advertises() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_memory().unwrap();
        let (events, _rx) = EventBus::channel();
        let node = Node::spawn(
            NodeOptions { port: 0, data_dir: dir.path().to_path_buf(), enable_mdns: false },
            store,
            events,
        )
        .await
        .unwrap();

        let peer = node.local_peer_id().to_base58();
        let addrs = node.advertised_addresses();
        assert!(!addrs.is_empty());
        assert!(addrs[0].ends_with(&format!("/p2p/{peer}")));
        assert!(node.lookup_user("anyone").is_err());
        node.shutdown();
    }

    #[tokio::test]
    async fn dial_requires_peer_component() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_memory().unwrap();
        let (events, _rx) = EventBus::channel();
        let node = Node::spawn(
            NodeOptions { port: 0, data_dir: dir.path().to_path_buf(), enable_mdns: false },
            store,
            events,
        )
        .await
        .unwrap();

        let err = node.dial("/ip4/127.0.0.1/tcp/1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        let err = node.dial("not an address").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        node.shutdown();
    }
}
