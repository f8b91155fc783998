//! # Auth Sessions
//!
//! Challenge/verify sessions with two verification methods.
//!
//! ## Email
//!
//! `start_email_auth` mints a 6-digit code and stores only
//! `sha256(secret:code:email)`. `verify_email_auth` compares in constant
//! time; every miss increments the attempt counter, and exhausting
//! `max_verification_attempts` locks the session permanently.
//!
//! ## OAuth
//!
//! `start_oauth_auth` issues a signed state token
//! `base64url({sid, exp}) "." hex(hmac_sha256(secret, payload))`.
//! `verify_oauth_auth` requires the session's provider, an intact HMAC
//! (constant-time) and an unexpired `exp` before persisting the subject.
//!
//! ## Status Machine
//!
//! `pending → {verified | expired | locked}`; once a session leaves
//! `pending` it never returns. Expiry is derived from wall clock and
//! materialized (persisted) on every read.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use verdant_common::attribution::is_valid_email;
use verdant_common::config::AuthConfig;

use crate::store::{AuthStore, UserLink};

type HmacSha256 = Hmac<Sha256>;

// ════════════════════════════════════════════════════════════════════════════════
// MODEL
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Email,
    Oauth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Verified,
    Expired,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub id: String,
    pub method: AuthMethod,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beneficiary_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beneficiary_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_code_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_state_token: Option<String>,
    pub verification_attempts: u32,
    pub max_verification_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid auth input: {0}")]
    InvalidInput(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("oauth provider not allowed: {0}")]
    InvalidProvider(String),
    #[error("session is {status:?}, expected pending")]
    SessionNotPending { status: SessionStatus },
    #[error("verification failed: {attempts_used}/{max_attempts} attempts used, locked: {locked}")]
    VerificationFailed {
        attempts_used: u32,
        max_attempts: u32,
        locked: bool,
    },
    #[error("recovery token is invalid, expired or already used")]
    InvalidRecoveryToken,
    #[error("no verified session found for {0}")]
    NoVerifiedSession(String),
    #[error("auth store failure: {0}")]
    Store(String),
}

// ── Requests ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StartEmailAuth {
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyEmailAuth {
    pub session_id: String,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct StartOAuthAuth {
    pub provider: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyOAuthAuth {
    pub session_id: String,
    pub oauth_state_token: String,
    pub provider: String,
    pub subject: String,
    pub email: Option<String>,
}

// ════════════════════════════════════════════════════════════════════════════════
// SERVICE
// ════════════════════════════════════════════════════════════════════════════════

pub struct AuthService {
    pub(crate) store: std::sync::Arc<dyn AuthStore>,
    pub(crate) config: AuthConfig,
}

impl AuthService {
    pub fn new(store: std::sync::Arc<dyn AuthStore>, config: AuthConfig) -> Self {
        Self { store, config }
    }

    /// Start an email challenge. Returns the session and the plaintext
    /// 6-digit code for out-of-band delivery; only its hash is stored.
    pub fn start_email_auth(
        &self,
        request: &StartEmailAuth,
    ) -> Result<(AuthSession, String), AuthError> {
        let email = request.email.trim().to_lowercase();
        if !is_valid_email(&email) {
            return Err(AuthError::InvalidInput(format!(
                "invalid email address: {:?}",
                request.email
            )));
        }

        let code = generate_code();
        let now = Utc::now();
        let session = AuthSession {
            id: Uuid::new_v4().to_string(),
            method: AuthMethod::Email,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.config.session_ttl).unwrap_or_default(),
            verified_at: None,
            beneficiary_name: trimmed(&request.name),
            beneficiary_email: Some(email.clone()),
            auth_provider: None,
            auth_subject: None,
            email_code_hash: Some(self.code_hash(&code, &email)),
            oauth_state_token: None,
            verification_attempts: 0,
            max_verification_attempts: self.config.max_verification_attempts,
        };
        self.store.insert_session(session.clone())?;
        info!(session = %session.id, "email auth session started");
        Ok((session, code))
    }

    /// Verify an email code. Wrong codes mutate state (attempt counter,
    /// lock) even though the call errors.
    pub fn verify_email_auth(&self, request: &VerifyEmailAuth) -> Result<AuthSession, AuthError> {
        let mut session = self.load_pending(&request.session_id, AuthMethod::Email)?;

        let email = session.beneficiary_email.clone().unwrap_or_default();
        let expected = session.email_code_hash.clone().unwrap_or_default();
        let presented = self.code_hash(request.code.trim(), &email);

        if constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
            session.status = SessionStatus::Verified;
            session.verified_at = Some(Utc::now());
            self.store.update_session(session.clone())?;
            info!(session = %session.id, "email auth verified");
            return Ok(session);
        }

        session.verification_attempts += 1;
        let locked = session.verification_attempts >= session.max_verification_attempts;
        if locked {
            session.status = SessionStatus::Locked;
            warn!(session = %session.id, "session locked after too many attempts");
        }
        let failure = AuthError::VerificationFailed {
            attempts_used: session.verification_attempts,
            max_attempts: session.max_verification_attempts,
            locked,
        };
        self.store.update_session(session)?;
        Err(failure)
    }

    /// Start an oauth flow: allowlist the provider and issue the signed
    /// state token the callback must echo.
    pub fn start_oauth_auth(&self, request: &StartOAuthAuth) -> Result<AuthSession, AuthError> {
        let provider = request.provider.trim().to_lowercase();
        if !self.config.oauth_providers.contains(&provider) {
            return Err(AuthError::InvalidProvider(request.provider.clone()));
        }
        let email = match &request.email {
            Some(email) => {
                let lowered = email.trim().to_lowercase();
                if !is_valid_email(&lowered) {
                    return Err(AuthError::InvalidInput(format!(
                        "invalid email address: {:?}",
                        email
                    )));
                }
                Some(lowered)
            }
            None => None,
        };

        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(self.config.session_ttl).unwrap_or_default();
        let id = Uuid::new_v4().to_string();
        let state_token = self.make_state_token(&id, expires_at.timestamp());

        let session = AuthSession {
            id,
            method: AuthMethod::Oauth,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at,
            verified_at: None,
            beneficiary_name: trimmed(&request.name),
            beneficiary_email: email,
            auth_provider: Some(provider),
            auth_subject: None,
            email_code_hash: None,
            oauth_state_token: Some(state_token),
            verification_attempts: 0,
            max_verification_attempts: self.config.max_verification_attempts,
        };
        self.store.insert_session(session.clone())?;
        info!(session = %session.id, "oauth session started");
        Ok(session)
    }

    /// Complete the oauth dance: provider match, HMAC-intact state,
    /// unexpired `exp`, then persist the subject.
    pub fn verify_oauth_auth(&self, request: &VerifyOAuthAuth) -> Result<AuthSession, AuthError> {
        let mut session = self.load_pending(&request.session_id, AuthMethod::Oauth)?;

        if session.auth_provider.as_deref() != Some(request.provider.trim().to_lowercase().as_str())
        {
            return Err(AuthError::InvalidInput(
                "provider does not match the session".to_string(),
            ));
        }
        self.check_state_token(&request.oauth_state_token, &session.id)?;

        let subject = request.subject.trim();
        if subject.is_empty() {
            return Err(AuthError::InvalidInput("subject is required".to_string()));
        }
        if let Some(email) = &request.email {
            let lowered = email.trim().to_lowercase();
            if !is_valid_email(&lowered) {
                return Err(AuthError::InvalidInput(format!(
                    "invalid email address: {:?}",
                    email
                )));
            }
            session.beneficiary_email = Some(lowered);
        }

        session.auth_subject = Some(subject.to_string());
        session.status = SessionStatus::Verified;
        session.verified_at = Some(Utc::now());
        self.store.update_session(session.clone())?;
        info!(session = %session.id, "oauth auth verified");
        Ok(session)
    }

    /// Read a session, materializing a derived expiry transition.
    pub fn get_session(&self, session_id: &str) -> Result<AuthSession, AuthError> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| AuthError::UnknownSession(session_id.to_string()))?;
        self.materialize_expiry(session)
    }

    /// Bind a verified session's identity to an opaque user id. Re-links
    /// for the same user overwrite the previous binding.
    pub fn link_session_to_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<(), AuthError> {
        let session = self.get_session(session_id)?;
        if session.status != SessionStatus::Verified {
            return Err(AuthError::SessionNotPending {
                status: session.status,
            });
        }
        self.store.upsert_link(UserLink {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        })
    }

    pub fn linked_session(&self, user_id: &str) -> Result<Option<AuthSession>, AuthError> {
        match self.store.get_link(user_id)? {
            Some(link) => Ok(self.store.get_session(&link.session_id)?),
            None => Ok(None),
        }
    }

    // ── internals ───────────────────────────────────────────────────────

    fn load_pending(
        &self,
        session_id: &str,
        method: AuthMethod,
    ) -> Result<AuthSession, AuthError> {
        let session = self.get_session(session_id)?;
        if session.method != method {
            return Err(AuthError::InvalidInput(
                "verification method does not match the session".to_string(),
            ));
        }
        if session.status != SessionStatus::Pending {
            return Err(AuthError::SessionNotPending {
                status: session.status,
            });
        }
        Ok(session)
    }

    /// `pending` + past due → `expired`, persisted. Verified sessions
    /// never expire.
    fn materialize_expiry(&self, mut session: AuthSession) -> Result<AuthSession, AuthError> {
        if session.status == SessionStatus::Pending && session.expires_at <= Utc::now() {
            session.status = SessionStatus::Expired;
            self.store.update_session(session.clone())?;
        }
        Ok(session)
    }

    pub(crate) fn code_hash(&self, code: &str, email: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.config.secret.as_bytes());
        hasher.update(b":");
        hasher.update(code.as_bytes());
        hasher.update(b":");
        hasher.update(email.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn make_state_token(&self, session_id: &str, exp_unix: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::json!({ "sid": session_id, "exp": exp_unix }).to_string(),
        );
        format!("{}.{}", payload, self.state_signature(&payload))
    }

    fn state_signature(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn check_state_token(&self, token: &str, session_id: &str) -> Result<(), AuthError> {
        let bad = || AuthError::InvalidInput("oauth state token is invalid".to_string());
        let (payload, signature) = token.split_once('.').ok_or_else(bad)?;
        let expected = self.state_signature(payload);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(bad());
        }

        #[derive(Deserialize)]
        struct StatePayload {
            sid: String,
            exp: i64,
        }
        let decoded = URL_SAFE_NO_PAD.decode(payload).map_err(|_| bad())?;
        let state: StatePayload = serde_json::from_slice(&decoded).map_err(|_| bad())?;
        if state.sid != session_id {
            return Err(bad());
        }
        if state.exp <= Utc::now().timestamp() {
            return Err(AuthError::InvalidInput(
                "oauth state token has expired".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}

fn generate_code() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    format!("{:06}", u32::from_be_bytes(bytes) % 1_000_000)
}
