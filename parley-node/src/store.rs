//! SQLite persistence layer.
//!
//! Stores users, the social graph, direct and conference message history,
//! and the known-peer cache. Uses WAL mode for concurrent reads during
//! writes. The handle is cheap to clone; every operation takes the
//! connection mutex briefly, so stream-handler tasks and interactive
//! commands can write concurrently without holding locks across awaits.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};

/// Sentinel password hash marking a user row that represents a remote peer
/// not registered on this node. Such rows can never be used for local login
/// and are upgraded in place once the peer's real identity arrives.
pub const REMOTE_PLACEHOLDER: &str = "REMOTE_PLACEHOLDER";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── Row types ──────────────────────────────────────────────────────────

/// A local account or a placeholder for a remote user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub full_name: String,
    pub peer_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    /// Placeholder rows stand in for remote peers and may not log in.
    pub fn is_placeholder(&self) -> bool {
        self.password_hash == REMOTE_PLACEHOLDER
    }
}

/// Fields required to insert a user row.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub full_name: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendshipStatus::Pending => "pending",
            FriendshipStatus::Accepted => "accepted",
            FriendshipStatus::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FriendshipStatus::Pending),
            "accepted" => Some(FriendshipStatus::Accepted),
            "rejected" => Some(FriendshipStatus::Rejected),
            _ => None,
        }
    }
}

/// A directed edge in the social graph. An accepted friendship is two rows,
/// one per direction; a pending request is a single row owned by the
/// requester.
#[derive(Debug, Clone)]
pub struct Friendship {
    pub id: i64,
    pub owner_user_id: i64,
    pub other_user_id: i64,
    pub other_peer_id: String,
    pub cached_username: String,
    pub cached_full_name: String,
    pub status: FriendshipStatus,
    pub created_at: i64,
    pub accepted_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewFriendship {
    pub owner_user_id: i64,
    pub other_user_id: i64,
    pub other_peer_id: String,
    pub cached_username: String,
    pub cached_full_name: String,
    pub status: FriendshipStatus,
}

/// A 1-to-1 message, stored on both sender and receiver. Ids are local to
/// each node.
#[derive(Debug, Clone)]
pub struct DirectMessage {
    pub id: i64,
    pub from_user_id: i64,
    pub to_user_id: i64,
    pub from_peer_id: String,
    pub to_peer_id: String,
    pub content: String,
    pub delivered: bool,
    pub read: bool,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
    /// For inbound messages, the sender's row id as carried on the wire.
    /// Read receipts echo this id so the sender can resolve its own row.
    pub remote_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewDirectMessage {
    pub from_user_id: i64,
    pub to_user_id: i64,
    pub from_peer_id: String,
    pub to_peer_id: String,
    pub content: String,
    pub delivered: bool,
    pub created_at: i64,
    pub remote_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Conference {
    pub id: i64,
    pub name: String,
    pub creator_user_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: i64,
    pub conference_id: i64,
    pub user_id: i64,
    pub peer_id: String,
    pub cached_username: String,
    pub joined_at: i64,
    pub left_at: Option<i64>,
    pub active: bool,
}

/// A conference message persisted on every participant that received it.
/// `created_at` is the sender's timestamp, trusted for ordering only.
#[derive(Debug, Clone)]
pub struct ConferenceMessage {
    pub id: i64,
    pub conference_id: i64,
    /// 0 when the sender could not be resolved to a local user row.
    pub from_user_id: i64,
    pub from_peer_id: String,
    pub content: String,
    pub created_at: i64,
}

/// Cached addresses of a previously seen peer, for rediscovery.
#[derive(Debug, Clone)]
pub struct KnownPeer {
    pub id: i64,
    pub peer_id: String,
    pub username: String,
    pub addrs: Vec<String>,
    pub last_seen: i64,
    pub created_at: i64,
}

// ── Store ──────────────────────────────────────────────────────────────

/// Database handle wrapping a SQLite connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                username      TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                full_name     TEXT NOT NULL DEFAULT '',
                peer_id       TEXT NOT NULL UNIQUE,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS friendships (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_user_id    INTEGER NOT NULL,
                other_user_id    INTEGER NOT NULL,
                other_peer_id    TEXT NOT NULL,
                cached_username  TEXT NOT NULL,
                cached_full_name TEXT NOT NULL DEFAULT '',
                status           TEXT NOT NULL,
                created_at       INTEGER NOT NULL,
                accepted_at      INTEGER,
                UNIQUE(owner_user_id, other_user_id)
            );

            CREATE TABLE IF NOT EXISTS direct_messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                from_user_id INTEGER NOT NULL,
                to_user_id   INTEGER NOT NULL,
                from_peer_id TEXT NOT NULL,
                to_peer_id   TEXT NOT NULL,
                content      TEXT NOT NULL,
                delivered    INTEGER NOT NULL DEFAULT 0,
                read         INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                delivered_at INTEGER,
                read_at      INTEGER,
                remote_id    INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_dm_conversation
                ON direct_messages(from_user_id, to_user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_dm_undelivered
                ON direct_messages(to_user_id, delivered);

            CREATE TABLE IF NOT EXISTS conferences (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL,
                creator_user_id INTEGER NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS participants (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conference_id   INTEGER NOT NULL,
                user_id         INTEGER NOT NULL,
                peer_id         TEXT NOT NULL,
                cached_username TEXT NOT NULL,
                joined_at       INTEGER NOT NULL,
                left_at         INTEGER,
                active          INTEGER NOT NULL DEFAULT 1,
                UNIQUE(conference_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS conference_messages (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                conference_id INTEGER NOT NULL,
                from_user_id  INTEGER NOT NULL DEFAULT 0,
                from_peer_id  TEXT NOT NULL,
                content       TEXT NOT NULL,
                created_at    INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conf_messages
                ON conference_messages(conference_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS known_peers (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_id    TEXT NOT NULL UNIQUE,
                username   TEXT NOT NULL DEFAULT '',
                addrs      TEXT NOT NULL DEFAULT '[]',
                last_seen  INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Insert a user row. Fails with [`Error::UniqueViolation`] if the
    /// username or peer id collides.
    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let conn = self.conn.lock();
        let ts = now();
        conn.execute(
            "INSERT INTO users (username, password_hash, full_name, peer_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![new.username, new.password_hash, new.full_name, new.peer_id, ts],
        )
        .map_err(Error::from_sqlite)?;
        let id = conn.last_insert_rowid();
        Ok(User {
            id,
            username: new.username.clone(),
            password_hash: new.password_hash.clone(),
            full_name: new.full_name.clone(),
            peer_id: new.peer_id.clone(),
            created_at: ts,
            updated_at: ts,
        })
    }

    /// Overwrite a user row by id. Used to rotate the password hash, to
    /// refresh the peer id on login, and to upgrade placeholder rows.
    pub fn update_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET username = ?1, password_hash = ?2, full_name = ?3,
                              peer_id = ?4, updated_at = ?5
             WHERE id = ?6",
            params![user.username, user.password_hash, user.full_name, user.peer_id, now(), user.id],
        )
        .map_err(Error::from_sqlite)?;
        Ok(())
    }

    pub fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, full_name, peer_id, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![id],
                map_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, full_name, peer_id, created_at, updated_at
                 FROM users WHERE username = ?1",
                params![username],
                map_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn user_by_peer_id(&self, peer_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, full_name, peer_id, created_at, updated_at
                 FROM users WHERE peer_id = ?1",
                params![peer_id],
                map_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Case-insensitive substring match on full name. SQLite LIKE folds
    /// ASCII case by default.
    pub fn search_users_by_fullname(&self, query: &str) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, password_hash, full_name, peer_id, created_at, updated_at
             FROM users
             WHERE full_name LIKE '%' || ?1 || '%'
             ORDER BY username",
        )?;
        let rows = stmt.query_map(params![query], map_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Friendships ────────────────────────────────────────────────────

    /// Insert a directed friendship edge. Fails with
    /// [`Error::UniqueViolation`] on a duplicate (owner, other) pair.
    pub fn create_friendship(&self, new: &NewFriendship) -> Result<Friendship> {
        let conn = self.conn.lock();
        let ts = now();
        let accepted_at = match new.status {
            FriendshipStatus::Accepted => Some(ts),
            _ => None,
        };
        conn.execute(
            "INSERT INTO friendships
                 (owner_user_id, other_user_id, other_peer_id, cached_username,
                  cached_full_name, status, created_at, accepted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.owner_user_id,
                new.other_user_id,
                new.other_peer_id,
                new.cached_username,
                new.cached_full_name,
                new.status.as_str(),
                ts,
                accepted_at,
            ],
        )
        .map_err(Error::from_sqlite)?;
        let id = conn.last_insert_rowid();
        Ok(Friendship {
            id,
            owner_user_id: new.owner_user_id,
            other_user_id: new.other_user_id,
            other_peer_id: new.other_peer_id.clone(),
            cached_username: new.cached_username.clone(),
            cached_full_name: new.cached_full_name.clone(),
            status: new.status,
            created_at: ts,
            accepted_at,
        })
    }

    /// Overwrite status, cached names, and accepted_at by id.
    pub fn update_friendship(&self, row: &Friendship) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE friendships
             SET status = ?1, accepted_at = ?2, cached_username = ?3, cached_full_name = ?4
             WHERE id = ?5",
            params![
                row.status.as_str(),
                row.accepted_at,
                row.cached_username,
                row.cached_full_name,
                row.id
            ],
        )?;
        Ok(())
    }

    pub fn friendship_between(&self, owner: i64, other: i64) -> Result<Option<Friendship>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, owner_user_id, other_user_id, other_peer_id, cached_username,
                        cached_full_name, status, created_at, accepted_at
                 FROM friendships WHERE owner_user_id = ?1 AND other_user_id = ?2",
                params![owner, other],
                map_friendship,
            )
            .optional()?;
        Ok(row)
    }

    /// Accepted edges owned by `owner`, i.e. the user's friend list.
    pub fn friends_of(&self, owner: i64) -> Result<Vec<Friendship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner_user_id, other_user_id, other_peer_id, cached_username,
                    cached_full_name, status, created_at, accepted_at
             FROM friendships
             WHERE owner_user_id = ?1 AND status = 'accepted'
             ORDER BY cached_username",
        )?;
        let rows = stmt.query_map(params![owner], map_friendship)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Incoming pending requests: rows owned by the requester that point at
    /// `user`.
    pub fn pending_requests_to(&self, user: i64) -> Result<Vec<Friendship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner_user_id, other_user_id, other_peer_id, cached_username,
                    cached_full_name, status, created_at, accepted_at
             FROM friendships
             WHERE other_user_id = ?1 AND status = 'pending'
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user], map_friendship)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Direct messages ────────────────────────────────────────────────

    /// Append-only insert. When the row is born delivered (inbound
    /// messages), delivered_at is filled in the same statement.
    pub fn save_direct_message(&self, new: &NewDirectMessage) -> Result<DirectMessage> {
        let conn = self.conn.lock();
        let delivered_at = if new.delivered { Some(now()) } else { None };
        conn.execute(
            "INSERT INTO direct_messages
                 (from_user_id, to_user_id, from_peer_id, to_peer_id, content,
                  delivered, read, created_at, delivered_at, remote_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9)",
            params![
                new.from_user_id,
                new.to_user_id,
                new.from_peer_id,
                new.to_peer_id,
                new.content,
                new.delivered as i32,
                new.created_at,
                delivered_at,
                new.remote_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(DirectMessage {
            id,
            from_user_id: new.from_user_id,
            to_user_id: new.to_user_id,
            from_peer_id: new.from_peer_id.clone(),
            to_peer_id: new.to_peer_id.clone(),
            content: new.content.clone(),
            delivered: new.delivered,
            read: false,
            created_at: new.created_at,
            delivered_at,
            read_at: None,
            remote_id: new.remote_id,
        })
    }

    pub fn direct_message_by_id(&self, id: i64) -> Result<Option<DirectMessage>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, from_user_id, to_user_id, from_peer_id, to_peer_id, content,
                        delivered, read, created_at, delivered_at, read_at, remote_id
                 FROM direct_messages WHERE id = ?1",
                params![id],
                map_direct_message,
            )
            .optional()?;
        Ok(row)
    }

    /// The most recent `limit` messages between `a` and `b`, newest first.
    pub fn conversation(&self, a: i64, b: i64, limit: usize) -> Result<Vec<DirectMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, from_user_id, to_user_id, from_peer_id, to_peer_id, content,
                    delivered, read, created_at, delivered_at, read_at, remote_id
             FROM direct_messages
             WHERE (from_user_id = ?1 AND to_user_id = ?2)
                OR (from_user_id = ?2 AND to_user_id = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![a, b, limit as i64], map_direct_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All undelivered messages addressed to `owner`, oldest first.
    pub fn undelivered_to(&self, owner: i64) -> Result<Vec<DirectMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, from_user_id, to_user_id, from_peer_id, to_peer_id, content,
                    delivered, read, created_at, delivered_at, read_at, remote_id
             FROM direct_messages
             WHERE to_user_id = ?1 AND delivered = 0
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![owner], map_direct_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Idempotent: sets the flag and fills delivered_at only if still null,
    /// in one statement.
    pub fn mark_delivered(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE direct_messages
             SET delivered = 1, delivered_at = COALESCE(delivered_at, ?1)
             WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(())
    }

    /// Idempotent: sets the flag and fills read_at only if still null.
    pub fn mark_read(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE direct_messages
             SET read = 1, read_at = COALESCE(read_at, ?1)
             WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(())
    }

    /// Count of unread messages addressed to `owner`.
    pub fn unread_count(&self, owner: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM direct_messages WHERE to_user_id = ?1 AND read = 0",
            params![owner],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Conferences ────────────────────────────────────────────────────

    pub fn create_conference(&self, name: &str, creator_user_id: i64) -> Result<Conference> {
        let conn = self.conn.lock();
        let ts = now();
        conn.execute(
            "INSERT INTO conferences (name, creator_user_id, created_at) VALUES (?1, ?2, ?3)",
            params![name, creator_user_id, ts],
        )?;
        Ok(Conference {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            creator_user_id,
            created_at: ts,
        })
    }

    pub fn conference_by_id(&self, id: i64) -> Result<Option<Conference>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, creator_user_id, created_at FROM conferences WHERE id = ?1",
                params![id],
                map_conference,
            )
            .optional()?;
        Ok(row)
    }

    /// Conferences the user is an active participant of.
    pub fn conferences_for(&self, user_id: i64) -> Result<Vec<Conference>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.creator_user_id, c.created_at
             FROM conferences c
             JOIN participants p ON p.conference_id = c.id
             WHERE p.user_id = ?1 AND p.active = 1
             ORDER BY c.id",
        )?;
        let rows = stmt.query_map(params![user_id], map_conference)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn add_participant(
        &self,
        conference_id: i64,
        user_id: i64,
        peer_id: &str,
        cached_username: &str,
    ) -> Result<Participant> {
        let conn = self.conn.lock();
        let ts = now();
        conn.execute(
            "INSERT INTO participants (conference_id, user_id, peer_id, cached_username, joined_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![conference_id, user_id, peer_id, cached_username, ts],
        )
        .map_err(Error::from_sqlite)?;
        Ok(Participant {
            id: conn.last_insert_rowid(),
            conference_id,
            user_id,
            peer_id: peer_id.to_string(),
            cached_username: cached_username.to_string(),
            joined_at: ts,
            left_at: None,
            active: true,
        })
    }

    pub fn participant(&self, conference_id: i64, user_id: i64) -> Result<Option<Participant>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, conference_id, user_id, peer_id, cached_username, joined_at, left_at, active
                 FROM participants WHERE conference_id = ?1 AND user_id = ?2",
                params![conference_id, user_id],
                map_participant,
            )
            .optional()?;
        Ok(row)
    }

    pub fn participants_of(&self, conference_id: i64) -> Result<Vec<Participant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conference_id, user_id, peer_id, cached_username, joined_at, left_at, active
             FROM participants WHERE conference_id = ?1 ORDER BY joined_at, id",
        )?;
        let rows = stmt.query_map(params![conference_id], map_participant)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Rejoin after a leave: clears left_at and refreshes joined_at.
    pub fn reactivate_participant(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE participants SET active = 1, left_at = NULL, joined_at = ?1 WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(())
    }

    /// Mark left; history is retained.
    pub fn deactivate_participant(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE participants SET active = 0, left_at = ?1 WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(())
    }

    pub fn save_conference_message(
        &self,
        conference_id: i64,
        from_user_id: i64,
        from_peer_id: &str,
        content: &str,
        created_at: i64,
    ) -> Result<ConferenceMessage> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conference_messages (conference_id, from_user_id, from_peer_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conference_id, from_user_id, from_peer_id, content, created_at],
        )?;
        Ok(ConferenceMessage {
            id: conn.last_insert_rowid(),
            conference_id,
            from_user_id,
            from_peer_id: from_peer_id.to_string(),
            content: content.to_string(),
            created_at,
        })
    }

    /// The most recent `limit` messages for a conference, oldest first.
    pub fn conference_history(&self, conference_id: i64, limit: usize) -> Result<Vec<ConferenceMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conference_id, from_user_id, from_peer_id, content, created_at
             FROM conference_messages
             WHERE conference_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![conference_id, limit as i64], map_conference_message)?;
        let mut result = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        result.reverse();
        Ok(result)
    }

    // ── Known peers ────────────────────────────────────────────────────

    /// Record a peer sighting. An empty username or address list never
    /// overwrites cached values.
    pub fn upsert_known_peer(&self, peer_id: &str, username: &str, addrs: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        let addrs_json = serde_json::to_string(addrs).unwrap_or_else(|_| "[]".to_string());
        let ts = now();
        conn.execute(
            "INSERT INTO known_peers (peer_id, username, addrs, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(peer_id) DO UPDATE SET
                username = CASE WHEN excluded.username = '' THEN known_peers.username
                                ELSE excluded.username END,
                addrs = CASE WHEN excluded.addrs = '[]' THEN known_peers.addrs
                             ELSE excluded.addrs END,
                last_seen = excluded.last_seen",
            params![peer_id, username, addrs_json, ts],
        )?;
        Ok(())
    }

    pub fn known_peers(&self) -> Result<Vec<KnownPeer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, peer_id, username, addrs, last_seen, created_at
             FROM known_peers ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], map_known_peer)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ── Row mappers ────────────────────────────────────────────────────────

fn map_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        full_name: row.get(3)?,
        peer_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_friendship(row: &rusqlite::Row) -> rusqlite::Result<Friendship> {
    let status_str: String = row.get(6)?;
    let status = FriendshipStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown friendship status {status_str:?}").into(),
        )
    })?;
    Ok(Friendship {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        other_user_id: row.get(2)?,
        other_peer_id: row.get(3)?,
        cached_username: row.get(4)?,
        cached_full_name: row.get(5)?,
        status,
        created_at: row.get(7)?,
        accepted_at: row.get(8)?,
    })
}

fn map_direct_message(row: &rusqlite::Row) -> rusqlite::Result<DirectMessage> {
    Ok(DirectMessage {
        id: row.get(0)?,
        from_user_id: row.get(1)?,
        to_user_id: row.get(2)?,
        from_peer_id: row.get(3)?,
        to_peer_id: row.get(4)?,
        content: row.get(5)?,
        delivered: row.get::<_, i32>(6)? != 0,
        read: row.get::<_, i32>(7)? != 0,
        created_at: row.get(8)?,
        delivered_at: row.get(9)?,
        read_at: row.get(10)?,
        remote_id: row.get(11)?,
    })
}

fn map_conference_message(row: &rusqlite::Row) -> rusqlite::Result<ConferenceMessage> {
    Ok(ConferenceMessage {
        id: row.get(0)?,
        conference_id: row.get(1)?,
        from_user_id: row.get(2)?,
        from_peer_id: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_conference(row: &rusqlite::Row) -> rusqlite::Result<Conference> {
    Ok(Conference {
        id: row.get(0)?,
        name: row.get(1)?,
        creator_user_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn map_participant(row: &rusqlite::Row) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: row.get(0)?,
        conference_id: row.get(1)?,
        user_id: row.get(2)?,
        peer_id: row.get(3)?,
        cached_username: row.get(4)?,
        joined_at: row.get(5)?,
        left_at: row.get(6)?,
        active: row.get::<_, i32>(7)? != 0,
    })
}

fn map_known_peer(row: &rusqlite::Row) -> rusqlite::Result<KnownPeer> {
    let addrs_json: String = row.get(3)?;
    let addrs: Vec<String> = serde_json::from_str(&addrs_json).unwrap_or_default();
    Ok(KnownPeer {
        id: row.get(0)?,
        peer_id: row.get(1)?,
        username: row.get(2)?,
        addrs,
        last_seen: row.get(4)?,
        created_at: row.get(5)?,
    })
}
