//! Decentralized peer-to-peer messaging engine.
//!
//! Each node owns a cryptographic identity, keeps its users and social
//! graph in a local SQLite store, dials other nodes directly, and
//! exchanges friend requests, direct messages, and conference messages
//! without any central server. A shell or front-end drives the engines
//! through [`Messenger`] and consumes notifications from the event
//! channel.

pub mod conference;
pub mod config;
pub mod direct;
pub mod error;
pub mod event;
pub mod friends;
pub mod node;
pub mod proto;
pub mod session;
pub mod store;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use error::{Error, Result};
pub use event::Event;

/// The assembled engine: store, transport, session, and the three protocol
/// engines, with all inbound stream handlers running.
pub struct Messenger {
    pub store: store::Store,
    pub node: node::Node,
    pub session: Arc<session::Session>,
    pub friends: friends::FriendEngine,
    pub direct: direct::DirectEngine,
    pub conferences: conference::ConferenceEngine,
}

impl Messenger {
    /// Start a node from configuration: open the store in the data
    /// directory and bring up the transport.
    pub async fn start(
        config: &config::NodeConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let data_dir = config.ensure_data_dir()?;
        let store = store::Store::open(config.db_path())?;
        let options = node::NodeOptions {
            port: config.port,
            data_dir,
            enable_mdns: !config.no_mdns,
        };
        Self::with_store(store, options).await
    }

    /// Assemble the engines around an existing store (tests use an
    /// in-memory one).
    pub async fn with_store(
        store: store::Store,
        options: node::NodeOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let (events, rx) = event::EventBus::channel();
        let node = node::Node::spawn(options, store.clone(), events.clone()).await?;
        let session = Arc::new(session::Session::new(store.clone()));

        let friends = friends::FriendEngine::new(
            store.clone(),
            node.clone(),
            session.clone(),
            events.clone(),
        );
        let direct = direct::DirectEngine::new(
            store.clone(),
            node.clone(),
            session.clone(),
            events.clone(),
        );
        let conferences = conference::ConferenceEngine::new(
            store.clone(),
            node.clone(),
            session.clone(),
            events.clone(),
        );

        friends.spawn_handlers()?;
        direct.spawn_handlers()?;
        conferences.spawn_handlers()?;

        Ok((
            Self { store, node, session, friends, direct, conferences },
            rx,
        ))
    }

    /// Create a local account bound to this node's peer id.
    pub fn register(&self, username: &str, password: &str, full_name: &str) -> Result<store::User> {
        self.session
            .register(username, password, full_name, &self.node.local_peer_id())
    }

    /// Log in and kick off the login-time redelivery pass.
    pub async fn login(&self, username: &str, password: &str) -> Result<store::User> {
        let user = self
            .session
            .login(username, password, &self.node.local_peer_id())?;
        self.direct.retry_undelivered().await;
        Ok(user)
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    /// Stop the swarm and every background task.
    pub fn shutdown(&self) {
        self.node.shutdown();
    }
}
