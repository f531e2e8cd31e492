//! Conferences: multi-party group chat on per-conference gossip topics.
//!
//! Each conference maps to the gossipsub topic `/conf/<id>`. Conference ids
//! are local to the creating node, so invitees must join with the id
//! carried in the invite. Every active subscription runs a listener task
//! holding a per-conference cancellation token (a child of the process
//! shutdown token); Leave cancels it and removes the engine's map entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::node::{Node, Subscription, Topic};
use crate::proto::{self, ConferenceGossipMsg, ConferenceInviteMsg};
use crate::session::Session;
use crate::store::{Conference, ConferenceMessage, FriendshipStatus, Participant, Store};

/// How long Leave waits for the listener task to wind down.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveConference {
    topic: Topic,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ConferenceEngine {
    store: Store,
    node: Node,
    session: Arc<Session>,
    events: EventBus,
    /// conference id → live pub/sub state. Held only for map updates.
    active: Arc<Mutex<HashMap<i64, ActiveConference>>>,
}

impl ConferenceEngine {
    pub fn new(store: Store, node: Node, session: Arc<Session>, events: EventBus) -> Self {
        Self {
            store,
            node,
            session,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the invite protocol handler.
    pub fn spawn_handlers(&self) -> Result<()> {
        let mut invites = self.node.accept(proto::CONFERENCE_INVITE_PROTOCOL)?;
        let shutdown = self.node.shutdown_token();
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = invites.next() => {
                        let Some((peer, stream)) = next else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.handle_invite(peer, stream).await });
                    }
                }
            }
        });
        Ok(())
    }

    // ── Commands ───────────────────────────────────────────────────────

    /// Create a conference, enroll the creator, and subscribe its topic.
    pub async fn create(&self, name: &str) -> Result<Conference> {
        let me = self.session.current_user()?;
        let conference = self.store.create_conference(name, me.id)?;
        self.store
            .add_participant(conference.id, me.id, &me.peer_id, &me.username)?;
        self.subscribe(conference.id).await?;
        tracing::info!(conference = conference.id, name, "conference created");
        Ok(conference)
    }

    /// Invite an online friend. Requires the caller to be an active
    /// participant and the friend to be connected right now.
    pub async fn invite(
        &self,
        conference_id: i64,
        friend_username: &str,
        message: &str,
    ) -> Result<()> {
        let me = self.session.current_user()?;
        if !self.is_active_participant(conference_id, me.id)? {
            return Err(Error::WrongState(format!(
                "not a participant of conference {conference_id}"
            )));
        }

        let friend = self
            .store
            .user_by_username(friend_username)?
            .ok_or_else(|| Error::NotFound(format!("user {friend_username}")))?;
        if !self.is_accepted_friend(me.id, friend.id)? {
            return Err(Error::NotFriends(friend_username.to_string()));
        }
        if self.is_active_participant(conference_id, friend.id)? {
            return Err(Error::AlreadyIn(conference_id));
        }

        let friend_peer: PeerId = friend
            .peer_id
            .parse()
            .map_err(|_| Error::InvalidAddress(friend.peer_id.clone()))?;
        if !self.node.is_connected(&friend_peer) {
            return Err(Error::NotOnline(friend_username.to_string()));
        }

        let conference = self
            .store
            .conference_by_id(conference_id)?
            .ok_or_else(|| Error::NotFound(format!("conference {conference_id}")))?;

        let invite = ConferenceInviteMsg {
            conference_id,
            conference_name: conference.name,
            from_username: me.username.clone(),
            from_full_name: me.full_name.clone(),
            from_peer_id: me.peer_id.clone(),
            message: message.to_string(),
        };
        let mut stream = self
            .node
            .open_stream(friend_peer, proto::CONFERENCE_INVITE_PROTOCOL)
            .await?;
        proto::send_json(&mut stream, &invite).await
    }

    /// Join a conference by the id carried in an invite. The local store
    /// must already hold the conference metadata.
    pub async fn join(&self, conference_id: i64) -> Result<()> {
        let me = self.session.current_user()?;
        self.store
            .conference_by_id(conference_id)?
            .ok_or_else(|| Error::NotFound(format!("conference {conference_id}")))?;

        match self.store.participant(conference_id, me.id)? {
            Some(p) if p.active => return Err(Error::AlreadyIn(conference_id)),
            Some(p) => self.store.reactivate_participant(p.id)?,
            None => {
                self.store
                    .add_participant(conference_id, me.id, &me.peer_id, &me.username)?;
            }
        }
        self.subscribe(conference_id).await
    }

    /// Idempotent: subscribe the node to the conference topic and start a
    /// listener task if one is not already running.
    pub async fn subscribe(&self, conference_id: i64) -> Result<()> {
        if self.active.lock().contains_key(&conference_id) {
            return Ok(());
        }

        let topic = self.node.join_topic(&proto::conference_topic(conference_id));
        let subscription = topic.subscribe().await?;
        let cancel = self.node.shutdown_token().child_token();

        let mut map = self.active.lock();
        if map.contains_key(&conference_id) {
            // Lost a race with a concurrent Subscribe; dropping our
            // subscription is enough, the winner's listener stays.
            return Ok(());
        }
        let listener = tokio::spawn(self.clone().run_listener(
            conference_id,
            subscription,
            cancel.clone(),
        ));
        map.insert(conference_id, ActiveConference { topic, cancel, listener });
        Ok(())
    }

    /// Publish a message to the conference and persist it locally. The
    /// publish precedes the persist; a persist failure does not undo it.
    pub async fn send_message(&self, conference_id: i64, content: &str) -> Result<()> {
        let me = self.session.current_user()?;
        if !self.is_active_participant(conference_id, me.id)? {
            return Err(Error::WrongState(format!(
                "not a participant of conference {conference_id}"
            )));
        }

        let topic = {
            let map = self.active.lock();
            match map.get(&conference_id) {
                Some(entry) => entry.topic.clone(),
                None => return Err(Error::NotSubscribed(conference_id)),
            }
        };

        let msg = ConferenceGossipMsg {
            conference_id,
            from_username: me.username.clone(),
            from_full_name: me.full_name.clone(),
            from_peer_id: me.peer_id.clone(),
            content: content.to_string(),
            timestamp: proto::now_unix(),
        };
        topic.publish(serde_json::to_vec(&msg)?).await?;

        if let Err(e) = self.store.save_conference_message(
            conference_id,
            me.id,
            &me.peer_id,
            content,
            msg.timestamp,
        ) {
            tracing::error!(conference = conference_id, "failed to persist own message: {e}");
        }
        Ok(())
    }

    /// Leave: mark the participant inactive, stop the listener, drop the
    /// topic subscription, and clear the engine maps.
    pub async fn leave(&self, conference_id: i64) -> Result<()> {
        let me = self.session.current_user()?;
        if let Some(p) = self.store.participant(conference_id, me.id)? {
            if p.active {
                self.store.deactivate_participant(p.id)?;
            }
        }

        let entry = self.active.lock().remove(&conference_id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            if tokio::time::timeout(LISTENER_STOP_TIMEOUT, entry.listener)
                .await
                .is_err()
            {
                tracing::warn!(conference = conference_id, "listener did not stop in time");
            }
            entry.topic.leave().await?;
        }
        tracing::info!(conference = conference_id, "left conference");
        Ok(())
    }

    /// Conferences the logged-in user actively participates in.
    pub fn list(&self) -> Result<Vec<Conference>> {
        let me = self.session.require()?;
        self.store.conferences_for(me)
    }

    /// The most recent `limit` messages, oldest first.
    pub fn history(&self, conference_id: i64, limit: usize) -> Result<Vec<ConferenceMessage>> {
        self.store.conference_history(conference_id, limit)
    }

    pub fn participants(&self, conference_id: i64) -> Result<Vec<Participant>> {
        self.store.participants_of(conference_id)
    }

    /// Whether the engine currently holds pub/sub state for a conference.
    pub fn is_subscribed(&self, conference_id: i64) -> bool {
        self.active.lock().contains_key(&conference_id)
    }

    // ── Gossip listener ────────────────────────────────────────────────

    async fn run_listener(
        self,
        conference_id: i64,
        mut subscription: Subscription,
        cancel: CancellationToken,
    ) {
        tracing::debug!(conference = conference_id, "conference listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = subscription.next() => {
                    let Some(gossip) = next else { break };
                    if gossip.received_from == self.node.local_peer_id() {
                        continue;
                    }
                    match serde_json::from_slice::<ConferenceGossipMsg>(&gossip.data) {
                        Ok(msg) => self.ingest_gossip(conference_id, msg),
                        Err(e) => {
                            tracing::debug!(
                                conference = conference_id,
                                "skipping undecodable gossip message: {e}"
                            );
                        }
                    }
                }
            }
        }
        tracing::debug!(conference = conference_id, "conference listener stopped");
    }

    /// Persist one inbound gossip message and notify. The sender resolves
    /// to a local user id when known, else 0.
    pub(crate) fn ingest_gossip(&self, conference_id: i64, msg: ConferenceGossipMsg) {
        let from_user_id = match self.store.user_by_peer_id(&msg.from_peer_id) {
            Ok(Some(user)) => user.id,
            Ok(None) => 0,
            Err(e) => {
                tracing::error!("sender lookup failed: {e}");
                0
            }
        };

        if let Err(e) = self.store.save_conference_message(
            conference_id,
            from_user_id,
            &msg.from_peer_id,
            &msg.content,
            msg.timestamp,
        ) {
            tracing::error!(conference = conference_id, "failed to persist gossip message: {e}");
            return;
        }

        self.events.emit(Event::ConferenceMessageReceived {
            conference_id,
            from_username: msg.from_username,
            content: msg.content,
        });
    }

    // ── Stream handlers ────────────────────────────────────────────────

    /// Inbound `/conference/invite/1`: notification only, never auto-join.
    async fn handle_invite(&self, peer: PeerId, mut stream: libp2p::Stream) {
        match proto::recv_json::<ConferenceInviteMsg, _>(&mut stream).await {
            Ok(msg) => {
                tracing::info!(
                    conference = msg.conference_id,
                    from = %msg.from_username,
                    "conference invite received"
                );
                self.events.emit(Event::ConferenceInviteReceived {
                    conference_id: msg.conference_id,
                    conference_name: msg.conference_name,
                    from_username: msg.from_username,
                    message: msg.message,
                });
            }
            Err(e) => tracing::warn!(peer = %peer, "bad conference invite payload: {e}"),
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn is_active_participant(&self, conference_id: i64, user_id: i64) -> Result<bool> {
        Ok(self
            .store
            .participant(conference_id, user_id)?
            .map(|p| p.active)
            .unwrap_or(false))
    }

    fn is_accepted_friend(&self, a: i64, b: i64) -> Result<bool> {
        for (owner, other) in [(a, b), (b, a)] {
            if let Some(row) = self.store.friendship_between(owner, other)? {
                if row.status == FriendshipStatus::Accepted {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeOptions;
    use crate::store::{NewFriendship, NewUser, REMOTE_PLACEHOLDER, User};

    async fn engine() -> (ConferenceEngine, Store, Arc<Session>, Node) {
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
        std::mem::forget(dir);
        let session = Arc::new(Session::new(store.clone()));
        let engine = ConferenceEngine::new(store.clone(), node.clone(), session.clone(), events);
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

    fn remote_user(store: &Store, name: &str) -> User {
        store
            .create_user(&NewUser {
                username: name.to_string(),
                password_hash: REMOTE_PLACEHOLDER.to_string(),
                full_name: String::new(),
                peer_id: PeerId::random().to_base58(),
            })
            .unwrap()
    }

    fn befriend(store: &Store, a: &User, b: &User) {
        for (x, y) in [(a, b), (b, a)] {
            store
                .create_friendship(&NewFriendship {
                    owner_user_id: x.id,
                    other_user_id: y.id,
                    other_peer_id: y.peer_id.clone(),
                    cached_username: y.username.clone(),
                    cached_full_name: String::new(),
                    status: FriendshipStatus::Accepted,
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn create_enrolls_creator_and_subscribes() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");

        let conference = engine.create("study").await.unwrap();
        assert!(engine.is_subscribed(conference.id));

        let p = store.participant(conference.id, me.id).unwrap().unwrap();
        assert!(p.active);

        // Subscribe is idempotent.
        engine.subscribe(conference.id).await.unwrap();
        assert!(engine.is_subscribed(conference.id));
        node.shutdown();
    }

    #[tokio::test]
    async fn send_persists_own_message() {
        let (engine, _store, session, node) = engine().await;
        login(&session, &node, "alice");
        let conference = engine.create("study").await.unwrap();

        engine.send_message(conference.id, "hello all").await.unwrap();

        let history = engine.history(conference.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello all");
        assert!(history[0].from_user_id != 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn send_without_subscription_fails() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");
        // Conference exists and user participates, but Subscribe was never
        // called (e.g. after a restart).
        let conference = store.create_conference("study", me.id).unwrap();
        store
            .add_participant(conference.id, me.id, &me.peer_id, &me.username)
            .unwrap();

        let err = engine.send_message(conference.id, "hi").await.unwrap_err();
        assert!(matches!(err, Error::NotSubscribed(_)));
        node.shutdown();
    }

    #[tokio::test]
    async fn join_unknown_conference_not_found() {
        let (engine, _store, session, node) = engine().await;
        login(&session, &node, "alice");
        let err = engine.join(999).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        node.shutdown();
    }

    #[tokio::test]
    async fn join_twice_fails_then_rejoin_after_leave() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");
        let conference = engine.create("study").await.unwrap();

        let err = engine.join(conference.id).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyIn(_)));

        engine.leave(conference.id).await.unwrap();
        let p = store.participant(conference.id, me.id).unwrap().unwrap();
        assert!(!p.active);
        assert!(p.left_at.is_some());

        engine.join(conference.id).await.unwrap();
        let p = store.participant(conference.id, me.id).unwrap().unwrap();
        assert!(p.active);
        assert!(p.left_at.is_none());
        node.shutdown();
    }

    #[tokio::test]
    async fn invite_gatekeeping() {
        let (engine, store, session, node) = engine().await;
        let me = login(&session, &node, "alice");
        let conference = engine.create("study").await.unwrap();

        // Unknown user.
        let err = engine.invite(conference.id, "ghost", "").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Known but not a friend.
        let bob = remote_user(&store, "bob");
        let err = engine.invite(conference.id, "bob", "").await.unwrap_err();
        assert!(matches!(err, Error::NotFriends(_)));

        // Friend but offline.
        befriend(&store, &me, &bob);
        let err = engine.invite(conference.id, "bob", "").await.unwrap_err();
        assert!(matches!(err, Error::NotOnline(_)));

        // Non-participant caller.
        let other = store.create_conference("other", bob.id).unwrap();
        let err = engine.invite(other.id, "bob", "").await.unwrap_err();
        assert!(matches!(err, Error::WrongState(_)));
        node.shutdown();
    }

    #[tokio::test]
    async fn leave_releases_resources_and_keeps_others() {
        let (engine, _store, session, node) = engine().await;
        login(&session, &node, "alice");
        let c1 = engine.create("one").await.unwrap();
        let c2 = engine.create("two").await.unwrap();
        assert!(engine.is_subscribed(c1.id));
        assert!(engine.is_subscribed(c2.id));

        engine.leave(c1.id).await.unwrap();
        assert!(!engine.is_subscribed(c1.id));
        assert!(engine.is_subscribed(c2.id));

        // Leaving again is harmless: the participant is already inactive
        // and no pub/sub state remains.
        engine.leave(c1.id).await.unwrap();
        node.shutdown();
    }

    #[tokio::test]
    async fn gossip_ingestion_resolves_sender_or_zero() {
        let (engine, store, session, node) = engine().await;
        login(&session, &node, "alice");
        let conference = engine.create("study").await.unwrap();

        let bob = remote_user(&store, "bob");
        engine.ingest_gossip(
            conference.id,
            ConferenceGossipMsg {
                conference_id: conference.id,
                from_username: "bob".into(),
                from_full_name: String::new(),
                from_peer_id: bob.peer_id.clone(),
                content: "known sender".into(),
                timestamp: 1_700_000_123,
            },
        );
        engine.ingest_gossip(
            conference.id,
            ConferenceGossipMsg {
                conference_id: conference.id,
                from_username: "mystery".into(),
                from_full_name: String::new(),
                from_peer_id: PeerId::random().to_base58(),
                content: "unknown sender".into(),
                timestamp: 1_700_000_124,
            },
        );

        let history = engine.history(conference.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_user_id, bob.id);
        assert_eq!(history[0].created_at, 1_700_000_123);
        assert_eq!(history[1].from_user_id, 0);
        node.shutdown();
    }
}
