//! # Session Recovery
//!
//! Time-limited, single-use recovery tokens. `start_recovery` finds the
//! most recent verified session for an email, mints
//! `recover_{64 hex chars}` and stores only `sha256(secret:token)`.
//! `recover_with_token` burns the token (sets `consumed_at`) and creates
//! a fresh verified session inheriting the source identity; a second
//! presentation of the same token always fails.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::session::{constant_time_eq, AuthError, AuthService, AuthSession, SessionStatus};
use crate::store::AuthStore;

const TOKEN_PREFIX: &str = "recover_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryToken {
    pub id: String,
    /// Salted SHA-256 of the plaintext token.
    pub token_hash: String,
    /// Session whose identity the recovery inherits.
    pub session_id: String,
    pub beneficiary_email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set exactly once; a consumed token is permanently dead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl AuthService {
    /// Mint a recovery token for the most recent verified session of
    /// `email`. Returns the record and the plaintext token for delivery.
    pub fn start_recovery(&self, email: &str) -> Result<(RecoveryToken, String), AuthError> {
        let email = email.trim().to_lowercase();
        let source = self
            .store
            .sessions()?
            .into_iter()
            .filter(|s| {
                s.status == SessionStatus::Verified
                    && s.beneficiary_email.as_deref() == Some(email.as_str())
            })
            .max_by_key(|s| s.verified_at)
            .ok_or_else(|| AuthError::NoVerifiedSession(email.clone()))?;

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = format!("{}{}", TOKEN_PREFIX, hex::encode(bytes));

        let now = Utc::now();
        let record = RecoveryToken {
            id: Uuid::new_v4().to_string(),
            token_hash: self.token_hash(&token),
            session_id: source.id.clone(),
            beneficiary_email: email,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.config.recovery_ttl).unwrap_or_default(),
            consumed_at: None,
        };
        self.store.insert_token(record.clone())?;
        info!(token_id = %record.id, session = %source.id, "recovery token minted");
        Ok((record, token))
    }

    /// Consume a recovery token and mint a new verified session carrying
    /// the source session's identity fields.
    pub fn recover_with_token(&self, token: &str) -> Result<AuthSession, AuthError> {
        let presented_hash = self.token_hash(token.trim());
        let mut record = self
            .store
            .tokens()?
            .into_iter()
            .find(|t| constant_time_eq(t.token_hash.as_bytes(), presented_hash.as_bytes()))
            .ok_or(AuthError::InvalidRecoveryToken)?;

        if record.consumed_at.is_some() || record.expires_at <= Utc::now() {
            return Err(AuthError::InvalidRecoveryToken);
        }

        let source = self
            .store
            .get_session(&record.session_id)?
            .ok_or(AuthError::InvalidRecoveryToken)?;

        record.consumed_at = Some(Utc::now());
        self.store.update_token(record.clone())?;

        let now = Utc::now();
        let session = AuthSession {
            id: Uuid::new_v4().to_string(),
            method: source.method,
            status: SessionStatus::Verified,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.config.session_ttl).unwrap_or_default(),
            verified_at: Some(now),
            beneficiary_name: source.beneficiary_name.clone(),
            beneficiary_email: source.beneficiary_email.clone(),
            auth_provider: source.auth_provider.clone(),
            auth_subject: source.auth_subject.clone(),
            email_code_hash: None,
            oauth_state_token: None,
            verification_attempts: 0,
            max_verification_attempts: source.max_verification_attempts,
        };
        self.store.insert_session(session.clone())?;
        info!(token_id = %record.id, new_session = %session.id, "session recovered");
        Ok(session)
    }

    fn token_hash(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.config.secret.as_bytes());
        hasher.update(b":");
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}
