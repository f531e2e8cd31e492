//! Error taxonomy for the messaging engine.
//!
//! Engine methods invoked by a shell return these directly; stream handlers
//! never propagate them — they log and close the stream. Input errors map
//! to a single-line diagnostic via `Display`.

use thiserror::Error;

/// Errors surfaced by the store, transport, and engines.
#[derive(Debug, Error)]
pub enum Error {
    // ── Input errors (user-visible, recoverable) ───────────────────────
    /// The overlay address could not be parsed or is missing its peer id.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The named user, friendship, message, or conference does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not valid in the record's current state.
    #[error("wrong state: {0}")]
    WrongState(String),

    #[error("already friends with {0}")]
    AlreadyFriends(String),

    #[error("a friend request to {0} is already pending")]
    DuplicateRequest(String),

    #[error("{0} is not a friend")]
    NotFriends(String),

    #[error("{0} is not online")]
    NotOnline(String),

    #[error("already a participant of conference {0}")]
    AlreadyIn(i64),

    #[error("not subscribed to conference {0}")]
    NotSubscribed(i64),

    #[error("cannot send a friend request to yourself")]
    CannotAddSelf,

    #[error("password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("invalid username or password")]
    InvalidCredentials,

    /// Unique-constraint violation (username, peer id, or friendship edge).
    #[error("record already exists")]
    UniqueViolation,

    #[error("no user is logged in")]
    NoSession,

    // ── Transport errors ───────────────────────────────────────────────
    #[error("no open connection to peer {0}")]
    NotConnected(String),

    #[error("peer does not support protocol {0}")]
    ProtocolUnsupported(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The dialed endpoint did not prove ownership of the expected peer id.
    #[error("authentication failed for peer {0}")]
    AuthenticationFailed(String),

    /// DHT user lookup is wired up but not implemented.
    #[error("distributed user lookup is not implemented")]
    NotImplemented,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("password hashing error: {0}")]
    PasswordHash(String),

    // ── Storage / codec errors ─────────────────────────────────────────
    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Collapse a rusqlite constraint failure into [`Error::UniqueViolation`]
    /// so callers can branch on duplicate rows (placeholder create races,
    /// repeated friend requests) without string matching.
    pub(crate) fn from_sqlite(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return Error::UniqueViolation;
            }
        }
        Error::Store(err)
    }
}
