//! Events emitted by the engines for a shell or front-end to consume.

use tokio::sync::mpsc;

/// Asynchronous, user-visible notifications. Delivered on an unbounded
/// channel; engine methods never block on a slow consumer.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection to a peer was established.
    PeerConnected { peer_id: String },

    /// The last connection to a peer closed.
    PeerDisconnected { peer_id: String },

    /// An inbound friend request. `stored` is false when no user was logged
    /// in and the request was notification-only.
    FriendRequestReceived {
        from_username: String,
        from_full_name: String,
        from_peer_id: String,
        message: String,
        stored: bool,
    },

    /// A friend request arrived from someone who already has an edge here.
    DuplicateFriendRequest { from_username: String },

    FriendRequestAccepted { username: String },
    FriendRequestRejected { username: String },

    DirectMessageReceived {
        from_username: String,
        content: String,
    },

    /// The recipient was offline or the send failed; the message is durable
    /// locally and will be retried.
    DirectMessageQueued {
        to_username: String,
        message_id: i64,
    },

    ConferenceInviteReceived {
        conference_id: i64,
        conference_name: String,
        from_username: String,
        message: String,
    },

    ConferenceMessageReceived {
        conference_id: i64,
        from_username: String,
        content: String,
    },
}

/// Cloneable sender side of the notification channel.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. A missing consumer is not an error; the engines keep
    /// running headless.
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::debug!("no event consumer attached; notification dropped");
        }
    }
}
