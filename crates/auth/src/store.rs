//! Auth state persistence: sessions, recovery tokens, user links.
//!
//! Same JSON-file discipline as the other stores: one state object,
//! mutex-serialized read-modify-write, temp-file + rename commit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::recovery::RecoveryToken;
use crate::session::{AuthError, AuthSession};

const STATE_VERSION: u32 = 1;

/// A verified session bound to an opaque user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLink {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthState {
    version: u32,
    sessions: Vec<AuthSession>,
    recovery_tokens: Vec<RecoveryToken>,
    links: Vec<UserLink>,
}

impl Default for AuthState {
    fn default() -> Self {
        AuthState {
            version: STATE_VERSION,
            sessions: Vec::new(),
            recovery_tokens: Vec::new(),
            links: Vec::new(),
        }
    }
}

pub trait AuthStore: Send + Sync {
    fn insert_session(&self, session: AuthSession) -> Result<(), AuthError>;
    /// Replace by id; absent ids are inserted.
    fn update_session(&self, session: AuthSession) -> Result<(), AuthError>;
    fn get_session(&self, session_id: &str) -> Result<Option<AuthSession>, AuthError>;
    fn sessions(&self) -> Result<Vec<AuthSession>, AuthError>;

    fn insert_token(&self, token: RecoveryToken) -> Result<(), AuthError>;
    fn update_token(&self, token: RecoveryToken) -> Result<(), AuthError>;
    fn tokens(&self) -> Result<Vec<RecoveryToken>, AuthError>;

    /// Bind `user_id` to a session; an existing link for the same user is
    /// overwritten.
    fn upsert_link(&self, link: UserLink) -> Result<(), AuthError>;
    fn get_link(&self, user_id: &str) -> Result<Option<UserLink>, AuthError>;
}

fn update_session_in(state: &mut AuthState, session: AuthSession) {
    match state.sessions.iter_mut().find(|s| s.id == session.id) {
        Some(slot) => *slot = session,
        None => state.sessions.push(session),
    }
}

fn update_token_in(state: &mut AuthState, token: RecoveryToken) {
    match state.recovery_tokens.iter_mut().find(|t| t.id == token.id) {
        Some(slot) => *slot = token,
        None => state.recovery_tokens.push(token),
    }
}

fn upsert_link_in(state: &mut AuthState, link: UserLink) {
    match state.links.iter_mut().find(|l| l.user_id == link.user_id) {
        Some(slot) => *slot = link,
        None => state.links.push(link),
    }
}

// ── JSON-file store ─────────────────────────────────────────────────────

pub struct JsonAuthStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonAuthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<AuthState, AuthError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AuthError::Store(format!("corrupt auth state: {}", e))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AuthState::default()),
            Err(err) => Err(AuthError::Store(err.to_string())),
        }
    }

    fn persist(&self, state: &AuthState) -> Result<(), AuthError> {
        let json =
            serde_json::to_vec_pretty(state).map_err(|e| AuthError::Store(e.to_string()))?;
        persist_atomically(&self.path, &json).map_err(|e| AuthError::Store(e.to_string()))
    }

    fn mutate(&self, apply: impl FnOnce(&mut AuthState)) -> Result<(), AuthError> {
        let _guard = self.write_lock.lock();
        let mut state = self.load()?;
        apply(&mut state);
        self.persist(&state)
    }
}

fn persist_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

impl AuthStore for JsonAuthStore {
    fn insert_session(&self, session: AuthSession) -> Result<(), AuthError> {
        self.mutate(|state| state.sessions.push(session))
    }

    fn update_session(&self, session: AuthSession) -> Result<(), AuthError> {
        self.mutate(|state| update_session_in(state, session))
    }

    fn get_session(&self, session_id: &str) -> Result<Option<AuthSession>, AuthError> {
        Ok(self
            .load()?
            .sessions
            .into_iter()
            .find(|s| s.id == session_id))
    }

    fn sessions(&self) -> Result<Vec<AuthSession>, AuthError> {
        Ok(self.load()?.sessions)
    }

    fn insert_token(&self, token: RecoveryToken) -> Result<(), AuthError> {
        self.mutate(|state| state.recovery_tokens.push(token))
    }

    fn update_token(&self, token: RecoveryToken) -> Result<(), AuthError> {
        self.mutate(|state| update_token_in(state, token))
    }

    fn tokens(&self) -> Result<Vec<RecoveryToken>, AuthError> {
        Ok(self.load()?.recovery_tokens)
    }

    fn upsert_link(&self, link: UserLink) -> Result<(), AuthError> {
        self.mutate(|state| upsert_link_in(state, link))
    }

    fn get_link(&self, user_id: &str) -> Result<Option<UserLink>, AuthError> {
        Ok(self.load()?.links.into_iter().find(|l| l.user_id == user_id))
    }
}

// ── In-memory store ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAuthStore {
    state: Mutex<AuthState>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthStore for MemoryAuthStore {
    fn insert_session(&self, session: AuthSession) -> Result<(), AuthError> {
        self.state.lock().sessions.push(session);
        Ok(())
    }

    fn update_session(&self, session: AuthSession) -> Result<(), AuthError> {
        update_session_in(&mut self.state.lock(), session);
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<AuthSession>, AuthError> {
        Ok(self
            .state
            .lock()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned())
    }

    fn sessions(&self) -> Result<Vec<AuthSession>, AuthError> {
        Ok(self.state.lock().sessions.clone())
    }

    fn insert_token(&self, token: RecoveryToken) -> Result<(), AuthError> {
        self.state.lock().recovery_tokens.push(token);
        Ok(())
    }

    fn update_token(&self, token: RecoveryToken) -> Result<(), AuthError> {
        update_token_in(&mut self.state.lock(), token);
        Ok(())
    }

    fn tokens(&self) -> Result<Vec<RecoveryToken>, AuthError> {
        Ok(self.state.lock().recovery_tokens.clone())
    }

    fn upsert_link(&self, link: UserLink) -> Result<(), AuthError> {
        upsert_link_in(&mut self.state.lock(), link);
        Ok(())
    }

    fn get_link(&self, user_id: &str) -> Result<Option<UserLink>, AuthError> {
        Ok(self
            .state
            .lock()
            .links
            .iter()
            .find(|l| l.user_id == user_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::session::{AuthMethod, SessionStatus};

    fn session(id: &str) -> AuthSession {
        AuthSession {
            id: id.to_string(),
            method: AuthMethod::Email,
            status: SessionStatus::Pending,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
            verified_at: None,
            beneficiary_name: Some("Ada".to_string()),
            beneficiary_email: Some("ada@example.org".to_string()),
            auth_provider: None,
            auth_subject: None,
            email_code_hash: Some("ab".repeat(32)),
            oauth_state_token: None,
            verification_attempts: 0,
            max_verification_attempts: 5,
        }
    }

    #[test]
    fn json_store_round_trips_sessions_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        {
            let store = JsonAuthStore::new(&path);
            store.insert_session(session("s-1")).unwrap();
            let mut verified = session("s-1");
            verified.status = SessionStatus::Verified;
            verified.verified_at = Some(Utc::now());
            store.update_session(verified).unwrap();
            store
                .upsert_link(UserLink {
                    user_id: "user-1".to_string(),
                    session_id: "s-1".to_string(),
                })
                .unwrap();
        }

        let store = JsonAuthStore::new(&path);
        let loaded = store.get_session("s-1").unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Verified);
        assert_eq!(loaded.email_code_hash.as_deref(), Some("ab".repeat(32).as_str()));
        assert_eq!(
            store.get_link("user-1").unwrap().unwrap().session_id,
            "s-1"
        );
        assert!(store.get_session("ghost").unwrap().is_none());
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonAuthStore::new(dir.path().join("absent.json"));
        assert!(store.sessions().unwrap().is_empty());
        assert!(store.tokens().unwrap().is_empty());
    }

    #[test]
    fn link_upsert_overwrites_same_user() {
        let store = MemoryAuthStore::new();
        store
            .upsert_link(UserLink {
                user_id: "u".to_string(),
                session_id: "a".to_string(),
            })
            .unwrap();
        store
            .upsert_link(UserLink {
                user_id: "u".to_string(),
                session_id: "b".to_string(),
            })
            .unwrap();
        assert_eq!(store.get_link("u").unwrap().unwrap().session_id, "b");
    }
}
