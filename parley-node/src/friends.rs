//! Friend request state machine.
//!
//! A friendship is a directed edge; an accepted relationship is two rows,
//! one per direction. Requests move forward only:
//!
//! ```text
//!                 send_request                  accept
//!     absent ──────────────────▶ pending ─────────────────▶ accepted
//!                                   │
//!                                   │  reject
//!                                   ▼
//!                               rejected
//! ```
//!
//! A node may reach out to a peer it has never seen, so the target is
//! materialized as a placeholder user row first and upgraded in place when
//! the peer's real identity arrives in the first protocol message from it.

use std::sync::Arc;

use futures::StreamExt;
use libp2p::PeerId;

use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::node::Node;
use crate::proto::{self, FriendRequestMsg, FriendResponseMsg};
use crate::session::Session;
use crate::store::{
    Friendship, FriendshipStatus, NewFriendship, NewUser, REMOTE_PLACEHOLDER, Store, User,
};

#[derive(Clone)]
pub struct FriendEngine {
    store: Store,
    node: Node,
    session: Arc<Session>,
    events: EventBus,
}

impl FriendEngine {
    pub fn new(store: Store, node: Node, session: Arc<Session>, events: EventBus) -> Self {
        Self { store, node, session, events }
    }

    /// Register the three friend protocols and spawn their accept loops.
    pub fn spawn_handlers(&self) -> Result<()> {
        let mut requests = self.node.accept(proto::FRIEND_REQUEST_PROTOCOL)?;
        let mut accepts = self.node.accept(proto::FRIEND_ACCEPT_PROTOCOL)?;
        let mut rejects = self.node.accept(proto::FRIEND_REJECT_PROTOCOL)?;
        let shutdown = self.node.shutdown_token();

        let engine = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = requests.next() => {
                        let Some((peer, stream)) = next else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.handle_request(peer, stream).await });
                    }
                }
            }
        });

        let engine = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = accepts.next() => {
                        let Some((peer, stream)) = next else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.handle_accept(peer, stream).await });
                    }
                }
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = rejects.next() => {
                        let Some((peer, stream)) = next else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.handle_reject(peer, stream).await });
                    }
                }
            }
        });

        Ok(())
    }

    // ── Commands ───────────────────────────────────────────────────────

    /// Send a friend request to a peer by its id. The pending row is
    /// durable before any wire attempt; a failed stream send is retried
    /// implicitly by the user repeating the command.
    pub async fn send_request(&self, target_peer: &PeerId, message: &str) -> Result<()> {
        let me = self.session.current_user()?;
        let target_peer_id = target_peer.to_base58();
        if target_peer_id == self.node.local_peer_id().to_base58() || target_peer_id == me.peer_id
        {
            return Err(Error::CannotAddSelf);
        }

        let target = match self.store.user_by_peer_id(&target_peer_id)? {
            Some(user) => user,
            None => self.create_placeholder(&target_peer_id)?,
        };

        if let Some(existing) = self.store.friendship_between(me.id, target.id)? {
            return Err(match existing.status {
                FriendshipStatus::Accepted => Error::AlreadyFriends(target.username),
                FriendshipStatus::Pending => Error::DuplicateRequest(target.username),
                FriendshipStatus::Rejected => {
                    Error::WrongState(format!("{} rejected an earlier request", target.username))
                }
            });
        }

        self.store.create_friendship(&NewFriendship {
            owner_user_id: me.id,
            other_user_id: target.id,
            other_peer_id: target.peer_id.clone(),
            cached_username: target.username.clone(),
            cached_full_name: target.full_name.clone(),
            status: FriendshipStatus::Pending,
        })?;

        let msg = FriendRequestMsg {
            from_username: me.username.clone(),
            from_full_name: me.full_name.clone(),
            from_peer_id: me.peer_id.clone(),
            message: message.to_string(),
        };
        if let Err(e) = self.send_to_peer(target_peer, proto::FRIEND_REQUEST_PROTOCOL, &msg).await
        {
            tracing::warn!(peer = %target_peer, "friend request not delivered: {e}");
        }
        Ok(())
    }

    /// Accept a pending request from `from_username`.
    pub async fn accept(&self, from_username: &str, message: &str) -> Result<()> {
        let me = self.session.current_user()?;
        let sender = self
            .store
            .user_by_username(from_username)?
            .ok_or_else(|| Error::NotFound(format!("user {from_username}")))?;

        let mut row = self
            .store
            .friendship_between(sender.id, me.id)?
            .ok_or_else(|| Error::NotFound(format!("no request from {from_username}")))?;
        if row.status != FriendshipStatus::Pending {
            return Err(Error::WrongState(format!(
                "request from {from_username} is {}",
                row.status.as_str()
            )));
        }

        row.status = FriendshipStatus::Accepted;
        row.accepted_at = Some(proto::now_unix());
        self.store.update_friendship(&row)?;
        self.ensure_reciprocal_accepted(me.id, &sender)?;

        let response = FriendResponseMsg {
            accepted: true,
            username: me.username.clone(),
            full_name: me.full_name.clone(),
            peer_id: me.peer_id.clone(),
            message: message.to_string(),
        };
        if let Err(e) = self
            .send_to_peer_str(&sender.peer_id, proto::FRIEND_ACCEPT_PROTOCOL, &response)
            .await
        {
            tracing::warn!(peer = %sender.peer_id, "accept response not delivered: {e}");
        }
        Ok(())
    }

    /// Reject a pending request from `from_username`. The row is retained
    /// so a repeated request stays idempotent.
    pub async fn reject(&self, from_username: &str, message: &str) -> Result<()> {
        let me = self.session.current_user()?;
        let sender = self
            .store
            .user_by_username(from_username)?
            .ok_or_else(|| Error::NotFound(format!("user {from_username}")))?;

        let mut row = self
            .store
            .friendship_between(sender.id, me.id)?
            .ok_or_else(|| Error::NotFound(format!("no request from {from_username}")))?;
        if row.status != FriendshipStatus::Pending {
            return Err(Error::WrongState(format!(
                "request from {from_username} is {}",
                row.status.as_str()
            )));
        }

        row.status = FriendshipStatus::Rejected;
        self.store.update_friendship(&row)?;

        let response = FriendResponseMsg {
            accepted: false,
            username: me.username.clone(),
            full_name: me.full_name.clone(),
            peer_id: me.peer_id.clone(),
            message: message.to_string(),
        };
        if let Err(e) = self
            .send_to_peer_str(&sender.peer_id, proto::FRIEND_REJECT_PROTOCOL, &response)
            .await
        {
            tracing::debug!(peer = %sender.peer_id, "reject response not delivered: {e}");
        }
        Ok(())
    }

    /// Accepted friends of the logged-in user, with a live-connection flag.
    pub fn friends_with_presence(&self) -> Result<Vec<(Friendship, bool)>> {
        let me = self.session.require()?;
        let friends = self.store.friends_of(me)?;
        Ok(friends
            .into_iter()
            .map(|f| {
                let online = f
                    .other_peer_id
                    .parse::<PeerId>()
                    .map(|p| self.node.is_connected(&p))
                    .unwrap_or(false);
                (f, online)
            })
            .collect())
    }

    /// Incoming pending requests for the logged-in user.
    pub fn pending_requests(&self) -> Result<Vec<Friendship>> {
        let me = self.session.require()?;
        self.store.pending_requests_to(me)
    }

    // ── Stream handlers ────────────────────────────────────────────────

    async fn handle_request(&self, peer: PeerId, mut stream: libp2p::Stream) {
        match proto::recv_json::<FriendRequestMsg, _>(&mut stream).await {
            Ok(msg) => self.ingest_request(&peer.to_base58(), msg),
            Err(e) => tracing::warn!(peer = %peer, "bad friend request payload: {e}"),
        }
    }

    async fn handle_accept(&self, peer: PeerId, mut stream: libp2p::Stream) {
        match proto::recv_json::<FriendResponseMsg, _>(&mut stream).await {
            Ok(msg) => self.ingest_accept(&peer.to_base58(), msg),
            Err(e) => tracing::warn!(peer = %peer, "bad friend accept payload: {e}"),
        }
    }

    async fn handle_reject(&self, peer: PeerId, mut stream: libp2p::Stream) {
        match proto::recv_json::<FriendResponseMsg, _>(&mut stream).await {
            Ok(msg) => self.ingest_reject(&peer.to_base58(), msg),
            Err(e) => tracing::warn!(peer = %peer, "bad friend reject payload: {e}"),
        }
    }

    /// Inbound `/friend/request/1`. The sender row is upserted even when no
    /// user is logged in; the friendship row is only created for an active
    /// session.
    pub(crate) fn ingest_request(&self, peer_id: &str, msg: FriendRequestMsg) {
        let sender = match self.upsert_remote_user(&msg.from_username, &msg.from_full_name, peer_id)
        {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(peer = %peer_id, "failed to upsert request sender: {e}");
                return;
            }
        };
        if let Err(e) = self.store.upsert_known_peer(peer_id, &sender.username, &[]) {
            tracing::debug!("known-peer refresh failed: {e}");
        }

        let me = match self.session.require() {
            Ok(id) => id,
            Err(_) => {
                self.events.emit(Event::FriendRequestReceived {
                    from_username: sender.username,
                    from_full_name: sender.full_name,
                    from_peer_id: peer_id.to_string(),
                    message: msg.message,
                    stored: false,
                });
                return;
            }
        };

        match self.store.friendship_between(sender.id, me) {
            Ok(Some(_)) => {
                self.events
                    .emit(Event::DuplicateFriendRequest { from_username: sender.username });
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("friendship lookup failed: {e}");
                return;
            }
        }

        let created = self.store.create_friendship(&NewFriendship {
            owner_user_id: sender.id,
            other_user_id: me,
            other_peer_id: peer_id.to_string(),
            cached_username: sender.username.clone(),
            cached_full_name: sender.full_name.clone(),
            status: FriendshipStatus::Pending,
        });
        match created {
            Ok(_) | Err(Error::UniqueViolation) => {}
            Err(e) => {
                tracing::error!("failed to store friend request: {e}");
                return;
            }
        }

        self.events.emit(Event::FriendRequestReceived {
            from_username: sender.username,
            from_full_name: sender.full_name,
            from_peer_id: peer_id.to_string(),
            message: msg.message,
            stored: true,
        });
    }

    /// Inbound `/friend/accept/1`: reconcile the accepter's identity, flip
    /// our pending edge, and materialize the reciprocal edge.
    pub(crate) fn ingest_accept(&self, peer_id: &str, msg: FriendResponseMsg) {
        let accepter = match self.upsert_remote_user(&msg.username, &msg.full_name, peer_id) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(peer = %peer_id, "failed to upsert accepter: {e}");
                return;
            }
        };

        let Ok(me) = self.session.require() else {
            tracing::debug!("friend accept from {} with no active session", accepter.username);
            return;
        };

        match self.store.friendship_between(me, accepter.id) {
            Ok(Some(mut row)) if row.status == FriendshipStatus::Pending => {
                row.status = FriendshipStatus::Accepted;
                row.accepted_at = Some(proto::now_unix());
                row.cached_username = accepter.username.clone();
                row.cached_full_name = accepter.full_name.clone();
                if let Err(e) = self.store.update_friendship(&row) {
                    tracing::error!("failed to accept friendship: {e}");
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("friendship lookup failed: {e}");
                return;
            }
        }

        if let Err(e) = self.reciprocal_from(&accepter, me) {
            tracing::error!("failed to store reciprocal friendship: {e}");
            return;
        }

        self.events.emit(Event::FriendRequestAccepted { username: accepter.username });
    }

    /// Inbound `/friend/reject/1`: flip our pending edge to rejected. No
    /// reciprocal row is created; the payload carries nothing we keep.
    pub(crate) fn ingest_reject(&self, peer_id: &str, _msg: FriendResponseMsg) {
        let Ok(me) = self.session.require() else {
            return;
        };
        let sender = match self.store.user_by_peer_id(peer_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::debug!(peer = %peer_id, "reject from unknown peer ignored");
                return;
            }
            Err(e) => {
                tracing::error!("user lookup failed: {e}");
                return;
            }
        };

        match self.store.friendship_between(me, sender.id) {
            Ok(Some(mut row)) if row.status == FriendshipStatus::Pending => {
                row.status = FriendshipStatus::Rejected;
                if let Err(e) = self.store.update_friendship(&row) {
                    tracing::error!("failed to mark friendship rejected: {e}");
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("friendship lookup failed: {e}");
                return;
            }
        }
        self.events.emit(Event::FriendRequestRejected { username: sender.username });
    }

    // ── Internals ──────────────────────────────────────────────────────

    /// Resolve a remote identity to a local user row: by username, else by
    /// peer id (upgrading a placeholder in place), else insert.
    fn upsert_remote_user(&self, username: &str, full_name: &str, peer_id: &str) -> Result<User> {
        if let Some(mut user) = self.store.user_by_username(username)? {
            if user.peer_id != peer_id || user.full_name != full_name {
                user.peer_id = peer_id.to_string();
                user.full_name = full_name.to_string();
                match self.store.update_user(&user) {
                    Ok(()) | Err(Error::UniqueViolation) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(user);
        }

        if let Some(mut user) = self.store.user_by_peer_id(peer_id)? {
            user.username = username.to_string();
            user.full_name = full_name.to_string();
            match self.store.update_user(&user) {
                Ok(()) => {}
                // The claimed username is taken locally; keep the
                // placeholder name rather than clobbering another row.
                Err(Error::UniqueViolation) => {
                    tracing::warn!(username, "username taken; keeping placeholder identity");
                    return self
                        .store
                        .user_by_peer_id(peer_id)?
                        .ok_or_else(|| Error::NotFound(format!("peer {peer_id}")));
                }
                Err(e) => return Err(e),
            }
            return Ok(user);
        }

        match self.store.create_user(&NewUser {
            username: username.to_string(),
            password_hash: REMOTE_PLACEHOLDER.to_string(),
            full_name: full_name.to_string(),
            peer_id: peer_id.to_string(),
        }) {
            Ok(user) => Ok(user),
            // Lost a race with another handler; the row is there now.
            Err(Error::UniqueViolation) => self
                .store
                .user_by_peer_id(peer_id)?
                .ok_or_else(|| Error::NotFound(format!("peer {peer_id}"))),
            Err(e) => Err(e),
        }
    }

    /// Placeholder for a peer we only know by id; upgraded later by
    /// [`Self::upsert_remote_user`].
    fn create_placeholder(&self, peer_id: &str) -> Result<User> {
        let suffix: String = peer_id
            .chars()
            .rev()
            .take(8)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        match self.store.create_user(&NewUser {
            username: format!("peer-{suffix}"),
            password_hash: REMOTE_PLACEHOLDER.to_string(),
            full_name: String::new(),
            peer_id: peer_id.to_string(),
        }) {
            Ok(user) => Ok(user),
            Err(Error::UniqueViolation) => self
                .store
                .user_by_peer_id(peer_id)?
                .ok_or_else(|| Error::NotFound(format!("peer {peer_id}"))),
            Err(e) => Err(e),
        }
    }

    /// Make sure the (me → other) accepted edge exists.
    fn ensure_reciprocal_accepted(&self, me: i64, other: &User) -> Result<()> {
        if self.store.friendship_between(me, other.id)?.is_some() {
            return Ok(());
        }
        match self.store.create_friendship(&NewFriendship {
            owner_user_id: me,
            other_user_id: other.id,
            other_peer_id: other.peer_id.clone(),
            cached_username: other.username.clone(),
            cached_full_name: other.full_name.clone(),
            status: FriendshipStatus::Accepted,
        }) {
            Ok(_) | Err(Error::UniqueViolation) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Make sure the (other → me) accepted edge exists.
    fn reciprocal_from(&self, other: &User, me: i64) -> Result<()> {
        if self.store.friendship_between(other.id, me)?.is_some() {
            return Ok(());
        }
        let my_user = self.store.user_by_id(me)?.ok_or(Error::NoSession)?;
        match self.store.create_friendship(&NewFriendship {
            owner_user_id: other.id,
            other_user_id: me,
            other_peer_id: my_user.peer_id,
            cached_username: my_user.username,
            cached_full_name: my_user.full_name,
            status: FriendshipStatus::Accepted,
        }) {
            Ok(_) | Err(Error::UniqueViolation) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_to_peer<T: serde::Serialize>(
        &self,
        peer: &PeerId,
        protocol: &'static str,
        msg: &T,
    ) -> Result<()> {
        let mut stream = self.node.open_stream(*peer, protocol).await?;
        proto::send_json(&mut stream, msg).await
    }

    async fn send_to_peer_str<T: serde::Serialize>(
        &self,
        peer_id: &str,
        protocol: &'static str,
        msg: &T,
    ) -> Result<()> {
        let peer: PeerId = peer_id
            .parse()
            .map_err(|_| Error::InvalidAddress(peer_id.to_string()))?;
        self.send_to_peer(&peer, protocol, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeOptions;

    async fn engine() -> (FriendEngine, Store, Arc<Session>, Node) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_memory().unwrap();
        let (events, _rx) = EventBus::channel();
        let node = Node::spawn(
            NodeOptions {
                port: 0,
                data_dir: dir.path().to_path_buf(),
                enable_mdns: false,
            },
            store.clone(),
            events.clone(),
        )
        .await
        .unwrap();
        // Leak the tempdir so the identity key outlives this scope.
        std::mem::forget(dir);
        let session = Arc::new(Session::new(store.clone()));
        let engine = FriendEngine::new(store.clone(), node.clone(), session.clone(), events);
        (engine, store, session, node)
    }

    fn login(session: &Session, node: &Node, name: &str) -> User {
        session
            .register(name, "correct horse", &format!("{name} full"), &node.local_peer_id())
            .unwrap();
        session
            .login(name, "correct horse", &node.local_peer_id())
            .unwrap()
    }

    #[tokio::test]
    async fn requires_session() {
        let (engine, _store, _session, node) = engine().await;
        let err = engine.send_request(&PeerId::random(), "hi").await.unwrap_err();
        assert!(matches!(err, Error::NoSession));
        node.shutdown();
    }

    #[tokio::test]
    async fn self_request_rejected() {
        let (engine, store, session, node) = engine().await;
        login(&session, &node, "alice");
        let err = engine
            .send_request(&node.local_peer_id(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CannotAddSelf));
        node.shutdown();
    }

    #[tokio::test]
    async fn send_creates_placeholder_and_is_idempotent() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");
        let target = PeerId::random();

        // The peer is offline; the wire send fails but the row remains.
        engine.send_request(&target, "hello").await.unwrap();

        let placeholder = store.user_by_peer_id(&target.to_base58()).unwrap().unwrap();
        assert!(placeholder.is_placeholder());
        assert!(placeholder.username.starts_with("peer-"));

        let row = store.friendship_between(me.id, placeholder.id).unwrap().unwrap();
        assert_eq!(row.status, FriendshipStatus::Pending);

        let err = engine.send_request(&target, "hello again").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateRequest(_)));
        // Row count did not grow.
        assert!(store.friendship_between(me.id, placeholder.id).unwrap().is_some());
        node.shutdown();
    }

    #[tokio::test]
    async fn inbound_request_then_accept_materializes_both_edges() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");

        let bob_peer = PeerId::random().to_base58();
        engine.ingest_request(
            &bob_peer,
            FriendRequestMsg {
                from_username: "bob".into(),
                from_full_name: "Bob B".into(),
                from_peer_id: bob_peer.clone(),
                message: "hi".into(),
            },
        );

        let bob = store.user_by_username("bob").unwrap().unwrap();
        assert!(bob.is_placeholder());
        let pending = store.friendship_between(bob.id, me.id).unwrap().unwrap();
        assert_eq!(pending.status, FriendshipStatus::Pending);

        // Accept: bob is offline, so the response send fails best-effort.
        engine.accept("bob", "welcome").await.unwrap();

        let forward = store.friendship_between(bob.id, me.id).unwrap().unwrap();
        let reverse = store.friendship_between(me.id, bob.id).unwrap().unwrap();
        assert_eq!(forward.status, FriendshipStatus::Accepted);
        assert_eq!(reverse.status, FriendshipStatus::Accepted);
        assert!(forward.accepted_at.is_some());
        assert!(reverse.accepted_at.is_some());

        // Accepting twice is a state error, not a duplicate row.
        let err = engine.accept("bob", "again").await.unwrap_err();
        assert!(matches!(err, Error::WrongState(_)));
        node.shutdown();
    }

    #[tokio::test]
    async fn accept_upgrades_placeholder_without_duplicates() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");
        let target = PeerId::random();
        let target58 = target.to_base58();

        engine.send_request(&target, "hello").await.unwrap();
        let placeholder = store.user_by_peer_id(&target58).unwrap().unwrap();

        engine.ingest_accept(
            &target58,
            FriendResponseMsg {
                accepted: true,
                username: "carol".into(),
                full_name: "Carol C".into(),
                peer_id: target58.clone(),
                message: String::new(),
            },
        );

        // Upgraded in place: same row id, real identity, no extra rows.
        let upgraded = store.user_by_peer_id(&target58).unwrap().unwrap();
        assert_eq!(upgraded.id, placeholder.id);
        assert_eq!(upgraded.username, "carol");
        assert_eq!(upgraded.full_name, "Carol C");
        assert!(store.user_by_username(&placeholder.username).unwrap().is_none());

        let forward = store.friendship_between(me.id, upgraded.id).unwrap().unwrap();
        let reverse = store.friendship_between(upgraded.id, me.id).unwrap().unwrap();
        assert_eq!(forward.status, FriendshipStatus::Accepted);
        assert_eq!(reverse.status, FriendshipStatus::Accepted);
        node.shutdown();
    }

    #[tokio::test]
    async fn reject_flips_pending_and_creates_no_reciprocal() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");
        let target = PeerId::random();
        let target58 = target.to_base58();

        engine.send_request(&target, "hello").await.unwrap();
        let placeholder = store.user_by_peer_id(&target58).unwrap().unwrap();

        engine.ingest_reject(
            &target58,
            FriendResponseMsg {
                accepted: false,
                username: "carol".into(),
                full_name: String::new(),
                peer_id: target58.clone(),
                message: "no thanks".into(),
            },
        );

        let row = store.friendship_between(me.id, placeholder.id).unwrap().unwrap();
        assert_eq!(row.status, FriendshipStatus::Rejected);
        assert!(store.friendship_between(placeholder.id, me.id).unwrap().is_none());
        node.shutdown();
    }

    #[tokio::test]
    async fn request_without_session_is_notification_only() {
        let (engine, store, _session, node) = engine().await;
        let bob_peer = PeerId::random().to_base58();
        engine.ingest_request(
            &bob_peer,
            FriendRequestMsg {
                from_username: "bob".into(),
                from_full_name: String::new(),
                from_peer_id: bob_peer.clone(),
                message: String::new(),
            },
        );
        // Sender row is upserted, but no friendship row exists for anyone.
        let bob = store.user_by_username("bob").unwrap().unwrap();
        assert!(store.pending_requests_to(bob.id).unwrap().is_empty());
        node.shutdown();
    }

    #[tokio::test]
    async fn accept_without_request_is_not_found() {
        let (engine, store, session, node) = engine().await;
        login(&session, &node, "alice");
        let err = engine.accept("stranger", "").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        node.shutdown();
    }
}
