//! Two-node wire tests: friendship establishment, direct message delivery
//! with acks and read receipts, and conference gossip, over real TCP
//! connections on localhost.

use std::time::Duration;

use parley_node::node::NodeOptions;
use parley_node::store::{FriendshipStatus, Store};
use parley_node::{Event, Messenger};
use tokio::sync::mpsc::UnboundedReceiver;

async fn spawn_node() -> (Messenger, UnboundedReceiver<Event>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_memory().unwrap();
    let (messenger, events) = Messenger::with_store(
        store,
        NodeOptions {
            port: 0,
            data_dir: dir.path().to_path_buf(),
            enable_mdns: false,
        },
    )
    .await
    .unwrap();
    // Keep the identity key directory alive for the test duration.
    std::mem::forget(dir);
    (messenger, events)
}

fn loopback_addr(messenger: &Messenger) -> String {
    let addrs = messenger.node.advertised_addresses();
    addrs
        .iter()
        .find(|a| a.contains("/ip4/127."))
        .unwrap_or(&addrs[0])
        .clone()
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn friendship_and_direct_messages_end_to_end() {
    let (a, _a_events) = spawn_node().await;
    let (b, _b_events) = spawn_node().await;

    a.register("alice", "correct horse", "Alice A").unwrap();
    a.login("alice", "correct horse").await.unwrap();
    b.register("bob", "battery staple", "Bob B").unwrap();
    b.login("bob", "battery staple").await.unwrap();

    let a_peer = a.node.local_peer_id();
    let b_peer = b.node.local_peer_id();

    // B dials A; both sides register the connection.
    b.node.dial(&loopback_addr(&a)).await.unwrap();
    wait_for("a sees b connected", || a.node.is_connected(&b_peer)).await;
    assert!(b.node.is_connected(&a_peer));

    // ── Friend request B → A ───────────────────────────────────────────
    b.friends.send_request(&a_peer, "hi alice").await.unwrap();
    wait_for("pending request lands on a", || {
        let bob = a.store.user_by_username("bob").ok().flatten();
        let alice = a.store.user_by_username("alice").ok().flatten();
        match (bob, alice) {
            (Some(bob), Some(alice)) => a
                .store
                .friendship_between(bob.id, alice.id)
                .ok()
                .flatten()
                .map(|f| f.status == FriendshipStatus::Pending)
                .unwrap_or(false),
            _ => false,
        }
    })
    .await;

    // ── Accept on A ────────────────────────────────────────────────────
    a.friends.accept("bob", "welcome").await.unwrap();

    let a_bob = a.store.user_by_username("bob").unwrap().unwrap();
    let a_alice = a.store.user_by_username("alice").unwrap().unwrap();
    for (x, y) in [(a_bob.id, a_alice.id), (a_alice.id, a_bob.id)] {
        let row = a.store.friendship_between(x, y).unwrap().unwrap();
        assert_eq!(row.status, FriendshipStatus::Accepted);
        assert!(row.accepted_at.is_some());
    }

    // B's placeholder for A is upgraded to the real identity, and both
    // directed rows exist on B as well.
    wait_for("b records accepted friendship", || {
        let alice = match b.store.user_by_peer_id(&a_peer.to_base58()) {
            Ok(Some(u)) => u,
            _ => return false,
        };
        if alice.username != "alice" {
            return false;
        }
        let bob = match b.store.user_by_username("bob") {
            Ok(Some(u)) => u,
            _ => return false,
        };
        let fwd = b.store.friendship_between(bob.id, alice.id).ok().flatten();
        let rev = b.store.friendship_between(alice.id, bob.id).ok().flatten();
        matches!(
            (fwd, rev),
            (Some(f), Some(r))
                if f.status == FriendshipStatus::Accepted
                    && r.status == FriendshipStatus::Accepted
        )
    })
    .await;
    let b_alice = b.store.user_by_peer_id(&a_peer.to_base58()).unwrap().unwrap();
    assert_eq!(b_alice.full_name, "Alice A");

    // ── Direct message B → A, delivered and acked ──────────────────────
    let sent = b.direct.send("alice", "hello from bob").await.unwrap();
    assert!(!sent.delivered);

    wait_for("message lands on a", || {
        a.store
            .conversation(a_alice.id, a_bob.id, 10)
            .map(|c| c.iter().any(|m| m.content == "hello from bob" && m.delivered))
            .unwrap_or(false)
    })
    .await;
    wait_for("ack flips delivered on b", || {
        b.store
            .direct_message_by_id(sent.id)
            .ok()
            .flatten()
            .map(|m| m.delivered && m.delivered_at.is_some())
            .unwrap_or(false)
    })
    .await;

    // ── Read receipt A → B ─────────────────────────────────────────────
    let convo = a.direct.open_conversation("bob", 10).await.unwrap();
    assert!(!convo.is_empty());
    wait_for("read receipt flips read on b", || {
        b.store
            .direct_message_by_id(sent.id)
            .ok()
            .flatten()
            .map(|m| m.read && m.read_at.is_some())
            .unwrap_or(false)
    })
    .await;

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn conference_gossip_reaches_both_nodes() {
    let (a, _a_events) = spawn_node().await;
    let (b, mut b_events) = spawn_node().await;

    a.register("alice", "correct horse", "Alice A").unwrap();
    a.login("alice", "correct horse").await.unwrap();
    b.register("bob", "battery staple", "Bob B").unwrap();
    b.login("bob", "battery staple").await.unwrap();

    let a_peer = a.node.local_peer_id();
    let b_peer = b.node.local_peer_id();
    b.node.dial(&loopback_addr(&a)).await.unwrap();
    wait_for("connected", || a.node.is_connected(&b_peer)).await;

    // Befriend over the wire so the invite gate passes.
    b.friends.send_request(&a_peer, "hi").await.unwrap();
    wait_for("request arrives", || {
        matches!(a.store.user_by_username("bob"), Ok(Some(bob))
            if matches!(a.store.pending_requests_to(
                a.store.user_by_username("alice").unwrap().unwrap().id
            ), Ok(reqs) if reqs.iter().any(|r| r.owner_user_id == bob.id)))
    })
    .await;
    a.friends.accept("bob", "").await.unwrap();
    wait_for("friendship on b", || {
        matches!(b.store.user_by_peer_id(&a_peer.to_base58()), Ok(Some(u)) if u.username == "alice")
    })
    .await;

    // A creates the conference and invites bob; the invite is only a
    // notification on B.
    let conference = a.conferences.create("study").await.unwrap();
    a.conferences.invite(conference.id, "bob", "join us").await.unwrap();

    let invite_id = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match b_events.recv().await {
                Some(Event::ConferenceInviteReceived { conference_id, conference_name, .. }) => {
                    assert_eq!(conference_name, "study");
                    return conference_id;
                }
                Some(_) => continue,
                None => panic!("event channel closed before invite arrived"),
            }
        }
    })
    .await
    .expect("invite never arrived");
    assert_eq!(invite_id, conference.id);

    // Conference ids are node-local: the invitee has no metadata row, so a
    // bare join fails. B materializes its own row (fresh store, same first
    // id) and joins the topic carried by the invite.
    assert!(b.conferences.join(invite_id).await.is_err());
    let b_conf = b.store.create_conference("study", 0).unwrap();
    assert_eq!(b_conf.id, invite_id);
    b.conferences.join(invite_id).await.unwrap();

    // Give the gossip mesh a couple of heartbeats to form.
    tokio::time::sleep(Duration::from_secs(3)).await;

    a.conferences.send_message(conference.id, "hello from alice").await.unwrap();
    b.conferences.send_message(invite_id, "hello from bob").await.unwrap();

    // Each node ends with both messages, its own plus exactly one gossip
    // copy of the other's.
    wait_for("a has both messages", || {
        a.conferences
            .history(conference.id, 10)
            .map(|h| {
                h.iter().any(|m| m.content == "hello from alice")
                    && h.iter().any(|m| m.content == "hello from bob")
            })
            .unwrap_or(false)
    })
    .await;
    wait_for("b has both messages", || {
        b.conferences
            .history(invite_id, 10)
            .map(|h| {
                h.iter().any(|m| m.content == "hello from alice")
                    && h.iter().any(|m| m.content == "hello from bob")
            })
            .unwrap_or(false)
    })
    .await;

    let a_history = a.conferences.history(conference.id, 10).unwrap();
    let b_history = b.conferences.history(invite_id, 10).unwrap();
    assert_eq!(a_history.len(), 2);
    assert_eq!(b_history.len(), 2);

    // Leave releases the listener and pub/sub state on B only.
    b.conferences.leave(invite_id).await.unwrap();
    assert!(!b.conferences.is_subscribed(invite_id));
    assert!(a.conferences.is_subscribed(conference.id));

    a.shutdown();
    b.shutdown();
}
