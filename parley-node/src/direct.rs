//! Direct messages: friend-gated 1-to-1 delivery with offline queueing and
//! delivery/read acknowledgements.
//!
//! A message is persisted before any wire attempt, so a crash never loses
//! outbound intent. The delivered flag is only flipped by the recipient's
//! ack; a send that reaches the wire but never gets acked stays queued.

use std::sync::Arc;

use futures::StreamExt;
use libp2p::PeerId;

use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::node::Node;
use crate::proto::{self, DirectMessageMsg, ReceiptMsg};
use crate::session::Session;
use crate::store::{DirectMessage, FriendshipStatus, NewDirectMessage, Store};

/// How many recent messages the mark-as-read sweep inspects.
const READ_SWEEP_LIMIT: usize = 100;

#[derive(Clone)]
pub struct DirectEngine {
    store: Store,
    node: Node,
    session: Arc<Session>,
    events: EventBus,
}

impl DirectEngine {
    pub fn new(store: Store, node: Node, session: Arc<Session>, events: EventBus) -> Self {
        Self { store, node, session, events }
    }

    /// Register the message, ack, and read protocols and their accept loops.
    pub fn spawn_handlers(&self) -> Result<()> {
        let mut messages = self.node.accept(proto::DIRECT_MESSAGE_PROTOCOL)?;
        let mut acks = self.node.accept(proto::MESSAGE_ACK_PROTOCOL)?;
        let mut reads = self.node.accept(proto::MESSAGE_READ_PROTOCOL)?;
        let shutdown = self.node.shutdown_token();

        let engine = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = messages.next() => {
                        let Some((peer, stream)) = next else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.handle_direct(peer, stream).await });
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
                    next = acks.next() => {
                        let Some((peer, stream)) = next else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.handle_ack(peer, stream).await });
                    }
                }
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = reads.next() => {
                        let Some((peer, stream)) = next else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.handle_read(peer, stream).await });
                    }
                }
            }
        });

        Ok(())
    }

    // ── Commands ───────────────────────────────────────────────────────

    /// Send a message to an accepted friend. Returns the persisted row;
    /// `delivered` flips asynchronously when the recipient acks.
    pub async fn send(&self, to_username: &str, content: &str) -> Result<DirectMessage> {
        let me = self.session.current_user()?;
        let recipient = self
            .store
            .user_by_username(to_username)?
            .ok_or_else(|| Error::NotFound(format!("user {to_username}")))?;
        if !self.is_accepted_friend(me.id, recipient.id)? {
            return Err(Error::NotFriends(to_username.to_string()));
        }

        let row = self.store.save_direct_message(&NewDirectMessage {
            from_user_id: me.id,
            to_user_id: recipient.id,
            from_peer_id: me.peer_id.clone(),
            to_peer_id: recipient.peer_id.clone(),
            content: content.to_string(),
            delivered: false,
            created_at: proto::now_unix(),
            remote_id: None,
        })?;

        let msg = DirectMessageMsg {
            message_id: row.id,
            from_username: me.username.clone(),
            from_full_name: me.full_name.clone(),
            from_peer_id: me.peer_id.clone(),
            to_username: recipient.username.clone(),
            content: content.to_string(),
            timestamp: row.created_at,
        };

        match self.try_deliver(&recipient.peer_id, &msg).await {
            // Delivered to the wire; the ack will mark it delivered.
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(to = %to_username, "message queued: {e}");
                self.events.emit(Event::DirectMessageQueued {
                    to_username: to_username.to_string(),
                    message_id: row.id,
                });
            }
        }
        Ok(row)
    }

    /// Open a conversation: run the mark-as-read sweep over recent inbound
    /// messages, then return the most recent `limit` messages newest first.
    pub async fn open_conversation(
        &self,
        with_username: &str,
        limit: usize,
    ) -> Result<Vec<DirectMessage>> {
        let me = self.session.current_user()?;
        let other = self
            .store
            .user_by_username(with_username)?
            .ok_or_else(|| Error::NotFound(format!("user {with_username}")))?;

        let recent = self.store.conversation(me.id, other.id, READ_SWEEP_LIMIT)?;
        for msg in recent.iter().filter(|m| m.from_user_id == other.id && !m.read) {
            self.store.mark_read(msg.id)?;
            let receipt = ReceiptMsg {
                message_id: msg.remote_id.unwrap_or(msg.id),
                from_peer: me.peer_id.clone(),
                to_peer: other.peer_id.clone(),
                timestamp: proto::now_unix(),
            };
            if let Err(e) = self
                .send_receipt(&other.peer_id, proto::MESSAGE_READ_PROTOCOL, &receipt)
                .await
            {
                tracing::debug!(peer = %other.peer_id, "read receipt not delivered: {e}");
            }
        }

        self.store.conversation(me.id, other.id, limit)
    }

    /// Unread inbound message count for the logged-in user.
    pub fn unread_count(&self) -> Result<i64> {
        let me = self.session.require()?;
        self.store.unread_count(me)
    }

    /// Login-time retry: walk the undelivered queue addressed to the
    /// session user and re-send each message whose counterpart peer is
    /// currently connected.
    pub async fn retry_undelivered(&self) {
        let Ok(me) = self.session.require() else { return };
        let queued = match self.store.undelivered_to(me) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("failed to enumerate undelivered messages: {e}");
                return;
            }
        };
        if queued.is_empty() {
            return;
        }
        tracing::info!(count = queued.len(), "retrying undelivered messages");

        for row in queued {
            let Ok(peer) = row.from_peer_id.parse::<PeerId>() else {
                continue;
            };
            if !self.node.is_connected(&peer) {
                continue;
            }
            let (from, to) = match (
                self.store.user_by_id(row.from_user_id),
                self.store.user_by_id(row.to_user_id),
            ) {
                (Ok(Some(from)), Ok(Some(to))) => (from, to),
                _ => continue,
            };
            let msg = DirectMessageMsg {
                message_id: row.id,
                from_username: from.username,
                from_full_name: from.full_name,
                from_peer_id: row.from_peer_id.clone(),
                to_username: to.username,
                content: row.content.clone(),
                timestamp: row.created_at,
            };
            if let Err(e) = self.try_deliver(&row.from_peer_id, &msg).await {
                tracing::debug!(message = row.id, "redelivery failed: {e}");
            }
        }
    }

    // ── Stream handlers ────────────────────────────────────────────────

    async fn handle_direct(&self, peer: PeerId, mut stream: libp2p::Stream) {
        match proto::recv_json::<DirectMessageMsg, _>(&mut stream).await {
            Ok(msg) => self.ingest_direct(peer, msg).await,
            Err(e) => tracing::warn!(peer = %peer, "bad direct message payload: {e}"),
        }
    }

    async fn handle_ack(&self, peer: PeerId, mut stream: libp2p::Stream) {
        match proto::recv_json::<ReceiptMsg, _>(&mut stream).await {
            Ok(msg) => {
                if let Err(e) = self.store.mark_delivered(msg.message_id) {
                    tracing::error!("failed to mark message delivered: {e}");
                }
            }
            Err(e) => tracing::warn!(peer = %peer, "bad ack payload: {e}"),
        }
    }

    async fn handle_read(&self, peer: PeerId, mut stream: libp2p::Stream) {
        match proto::recv_json::<ReceiptMsg, _>(&mut stream).await {
            Ok(msg) => {
                if let Err(e) = self.store.mark_read(msg.message_id) {
                    tracing::error!("failed to mark message read: {e}");
                }
            }
            Err(e) => tracing::warn!(peer = %peer, "bad read receipt payload: {e}"),
        }
    }

    /// Inbound `/message/direct/1`: persist as delivered, ack best-effort,
    /// notify. Messages from peers with no local user row are dropped.
    pub(crate) async fn ingest_direct(&self, peer: PeerId, msg: DirectMessageMsg) {
        let peer58 = peer.to_base58();
        let sender = match self.resolve_sender(&peer58, &msg) {
            Some(user) => user,
            None => {
                tracing::warn!(peer = %peer58, "dropping message from unknown sender");
                return;
            }
        };
        let recipient = match self.store.user_by_username(&msg.to_username) {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(to = %msg.to_username, "dropping message for unknown recipient");
                return;
            }
            Err(e) => {
                tracing::error!("recipient lookup failed: {e}");
                return;
            }
        };

        if let Err(e) = self.store.save_direct_message(&NewDirectMessage {
            from_user_id: sender.id,
            to_user_id: recipient.id,
            from_peer_id: peer58.clone(),
            to_peer_id: recipient.peer_id.clone(),
            content: msg.content.clone(),
            delivered: true,
            created_at: msg.timestamp,
            remote_id: Some(msg.message_id),
        }) {
            tracing::error!("failed to persist inbound message: {e}");
            return;
        }

        let ack = ReceiptMsg {
            message_id: msg.message_id,
            from_peer: self.node.local_peer_id().to_base58(),
            to_peer: peer58.clone(),
            timestamp: proto::now_unix(),
        };
        if let Err(e) = self.send_receipt(&peer58, proto::MESSAGE_ACK_PROTOCOL, &ack).await {
            tracing::debug!(peer = %peer58, "ack not delivered: {e}");
        }

        self.events.emit(Event::DirectMessageReceived {
            from_username: sender.username,
            content: msg.content,
        });
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn resolve_sender(&self, peer58: &str, msg: &DirectMessageMsg) -> Option<crate::store::User> {
        if let Ok(Some(user)) = self.store.user_by_peer_id(peer58) {
            return Some(user);
        }
        if let Ok(Some(user)) = self.store.user_by_username(&msg.from_username) {
            return Some(user);
        }
        None
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

    async fn try_deliver(&self, peer_id: &str, msg: &DirectMessageMsg) -> Result<()> {
        let peer: PeerId = peer_id
            .parse()
            .map_err(|_| Error::InvalidAddress(peer_id.to_string()))?;
        if !self.node.is_connected(&peer) {
            return Err(Error::NotConnected(peer_id.to_string()));
        }
        let mut stream = self.node.open_stream(peer, proto::DIRECT_MESSAGE_PROTOCOL).await?;
        proto::send_json(&mut stream, msg).await
    }

    async fn send_receipt(
        &self,
        peer_id: &str,
        protocol: &'static str,
        receipt: &ReceiptMsg,
    ) -> Result<()> {
        let peer: PeerId = peer_id
            .parse()
            .map_err(|_| Error::InvalidAddress(peer_id.to_string()))?;
        let mut stream = self.node.open_stream(peer, protocol).await?;
        proto::send_json(&mut stream, receipt).await
    }
}
