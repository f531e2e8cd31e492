//! Login session and local password authentication.
//!
//! A single writable cell holds the current logged-in user id (0 = none).
//! The engines consult it to know whose inbox a stream handler's work
//! belongs to. Passwords are hashed with argon2; placeholder rows for
//! remote peers carry a sentinel instead of a hash and can never log in.

use std::sync::atomic::{AtomicI64, Ordering};

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use libp2p::PeerId;

use crate::error::{Error, Result};
use crate::store::{NewUser, Store, User};

/// Minimum accepted password length for register and change-password.
pub const MIN_PASSWORD_LEN: usize = 8;

pub struct Session {
    store: Store,
    current: AtomicI64,
}

impl Session {
    pub fn new(store: Store) -> Self {
        Self { store, current: AtomicI64::new(0) }
    }

    /// Id of the logged-in user, or 0.
    pub fn current_user_id(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.current_user_id() != 0
    }

    /// The logged-in user id, or [`Error::NoSession`].
    pub fn require(&self) -> Result<i64> {
        match self.current_user_id() {
            0 => Err(Error::NoSession),
            id => Ok(id),
        }
    }

    pub fn current_user(&self) -> Result<User> {
        let id = self.require()?;
        self.store
            .user_by_id(id)?
            .ok_or_else(|| Error::NotFound("session user".into()))
    }

    /// Create a local account bound to this node's peer id.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        full_name: &str,
        peer_id: &PeerId,
    ) -> Result<User> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(Error::WeakPassword(MIN_PASSWORD_LEN));
        }
        self.store.create_user(&NewUser {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            full_name: full_name.to_string(),
            peer_id: peer_id.to_base58(),
        })
    }

    /// Verify the password and activate the session. The account's stored
    /// peer id is refreshed to the node's current one, since identities may
    /// have rotated since the last run.
    pub fn login(&self, username: &str, password: &str, peer_id: &PeerId) -> Result<User> {
        let mut user = self
            .store
            .user_by_username(username)?
            .ok_or(Error::InvalidCredentials)?;
        if user.is_placeholder() {
            return Err(Error::InvalidCredentials);
        }
        if !verify_password(password, &user.password_hash) {
            return Err(Error::InvalidCredentials);
        }

        let current_peer = peer_id.to_base58();
        if user.peer_id != current_peer {
            user.peer_id = current_peer;
            match self.store.update_user(&user) {
                Ok(()) => {}
                // Another local account already claimed this node's peer id.
                Err(Error::UniqueViolation) => {
                    tracing::warn!(
                        username,
                        "peer id already bound to another local account; keeping stored peer id"
                    );
                    user = self
                        .store
                        .user_by_username(username)?
                        .ok_or(Error::InvalidCredentials)?;
                }
                Err(e) => return Err(e),
            }
        }

        self.current.store(user.id, Ordering::SeqCst);
        tracing::info!(username, user_id = user.id, "logged in");
        Ok(user)
    }

    pub fn logout(&self) {
        self.current.store(0, Ordering::SeqCst);
    }

    /// Rotate the logged-in user's password hash.
    pub fn change_password(&self, old: &str, new: &str) -> Result<()> {
        let mut user = self.current_user()?;
        if !verify_password(old, &user.password_hash) {
            return Err(Error::InvalidCredentials);
        }
        if new.len() < MIN_PASSWORD_LEN {
            return Err(Error::WeakPassword(MIN_PASSWORD_LEN));
        }
        user.password_hash = hash_password(new)?;
        self.store.update_user(&user)
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::PasswordHash(e.to_string()))
}

fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        // Placeholder sentinel or legacy garbage: never verifies.
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::REMOTE_PLACEHOLDER;

    #[test]
    fn register_then_login_roundtrip() {
        let store = Store::open_memory().unwrap();
        let session = Session::new(store.clone());
        let peer = PeerId::random();

        let user = session.register("alice", "correct horse", "Alice A", &peer).unwrap();
        assert!(!user.is_placeholder());
        assert!(!session.is_active());

        let logged_in = session.login("alice", "correct horse", &peer).unwrap();
        assert_eq!(logged_in.username, "alice");
        assert_eq!(logged_in.full_name, "Alice A");
        assert_eq!(logged_in.peer_id, peer.to_base58());
        assert_eq!(session.current_user_id(), logged_in.id);

        session.logout();
        assert!(session.require().is_err());
    }

    #[test]
    fn wrong_password_rejected() {
        let store = Store::open_memory().unwrap();
        let session = Session::new(store);
        let peer = PeerId::random();
        session.register("alice", "correct horse", "", &peer).unwrap();

        let err = session.login("alice", "battery staple", &peer).unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
        let err = session.login("nobody", "correct horse", &peer).unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
        assert!(!session.is_active());
    }

    #[test]
    fn weak_password_rejected() {
        let store = Store::open_memory().unwrap();
        let session = Session::new(store);
        let err = session
            .register("alice", "short", "", &PeerId::random())
            .unwrap_err();
        assert!(matches!(err, Error::WeakPassword(_)));
    }

    #[test]
    fn placeholder_rows_cannot_log_in() {
        let store = Store::open_memory().unwrap();
        store
            .create_user(&NewUser {
                username: "peer-remote".into(),
                password_hash: REMOTE_PLACEHOLDER.into(),
                full_name: String::new(),
                peer_id: "remote-peer".into(),
            })
            .unwrap();
        let session = Session::new(store);

        let err = session
            .login("peer-remote", REMOTE_PLACEHOLDER, &PeerId::random())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn login_refreshes_rotated_peer_id() {
        let store = Store::open_memory().unwrap();
        let session = Session::new(store.clone());
        let old_peer = PeerId::random();
        session.register("alice", "correct horse", "", &old_peer).unwrap();

        let new_peer = PeerId::random();
        let user = session.login("alice", "correct horse", &new_peer).unwrap();
        assert_eq!(user.peer_id, new_peer.to_base58());
        let stored = store.user_by_username("alice").unwrap().unwrap();
        assert_eq!(stored.peer_id, new_peer.to_base58());
    }

    #[test]
    fn change_password_requires_current() {
        let store = Store::open_memory().unwrap();
        let session = Session::new(store);
        let peer = PeerId::random();
        session.register("alice", "correct horse", "", &peer).unwrap();
        session.login("alice", "correct horse", &peer).unwrap();

        let err = session.change_password("wrong", "battery staple").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
        let err = session.change_password("correct horse", "tiny").unwrap_err();
        assert!(matches!(err, Error::WeakPassword(_)));

        session.change_password("correct horse", "battery staple").unwrap();
        session.logout();
        session.login("alice", "battery staple", &peer).unwrap();
    }
}
