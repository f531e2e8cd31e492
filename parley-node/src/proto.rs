//! Wire protocol: stream protocol identifiers, message payloads, and the
//! line-delimited JSON codec.
//!
//! Every stream protocol carries exactly one JSON object terminated by a
//! newline, then the stream is closed. Gossip payloads are one JSON object
//! per publish; the pub/sub substrate preserves message boundaries.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const FRIEND_REQUEST_PROTOCOL: &str = "/friend/request/1";
pub const FRIEND_ACCEPT_PROTOCOL: &str = "/friend/accept/1";
pub const FRIEND_REJECT_PROTOCOL: &str = "/friend/reject/1";
pub const DIRECT_MESSAGE_PROTOCOL: &str = "/message/direct/1";
pub const MESSAGE_ACK_PROTOCOL: &str = "/message/ack/1";
pub const MESSAGE_READ_PROTOCOL: &str = "/message/read/1";
pub const CONFERENCE_INVITE_PROTOCOL: &str = "/conference/invite/1";

/// Gossipsub topic for a conference. Ids are node-local, so invitees must
/// derive the topic from the id carried in the invite.
pub fn conference_topic(conference_id: i64) -> String {
    format!("/conf/{conference_id}")
}

/// Upper bound on a single wire message. Anything larger is dropped.
const MAX_WIRE_MSG: usize = 64 * 1024;

/// Current time as unix seconds, used for all wire timestamps.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── Payloads ───────────────────────────────────────────────────────────

/// `/friend/request/1`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestMsg {
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    pub message: String,
}

/// `/friend/accept/1` and `/friend/reject/1` share one shape; `accepted`
/// distinguishes them for consumers that log the raw payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendResponseMsg {
    pub accepted: bool,
    pub username: String,
    pub full_name: String,
    pub peer_id: String,
    pub message: String,
}

/// `/message/direct/1`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessageMsg {
    /// The sender's local row id; echoed back in acks and read receipts.
    pub message_id: i64,
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    pub to_username: String,
    pub content: String,
    pub timestamp: i64,
}

/// `/message/ack/1` and `/message/read/1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptMsg {
    pub message_id: i64,
    pub from_peer: String,
    pub to_peer: String,
    pub timestamp: i64,
}

/// `/conference/invite/1`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceInviteMsg {
    /// The conference id on the inviter's node. Join must use this value.
    pub conference_id: i64,
    pub conference_name: String,
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    pub message: String,
}

/// Gossip payload published to `/conf/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceGossipMsg {
    pub conference_id: i64,
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    pub content: String,
    pub timestamp: i64,
}

// ── Codec ──────────────────────────────────────────────────────────────

/// Write one JSON object plus a trailing newline, then close the stream.
pub async fn send_json<T, W>(io: &mut W, msg: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    io.write_all(&buf).await?;
    io.close().await?;
    Ok(())
}

/// Read one newline-terminated JSON object. Tolerates a peer that closes
/// the stream without the trailing newline.
pub async fn recv_json<T, R>(io: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_WIRE_MSG {
            return Err(Error::Transport("oversized wire message".into()));
        }
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }
    let line = buf.split(|b| *b == b'\n').next().unwrap_or_default();
    Ok(serde_json::from_slice(line)?)
}
