//! # Verdant Auth Crate
//!
//! Short-lived challenge/verify sessions binding a beneficiary identity
//! (email code or oauth subject) to retirements, plus time-limited
//! single-use recovery tokens and session↔user linking.
//!
//! ## Modules
//! - `session`: Session model, email/oauth verification flows, linking
//! - `recovery`: Recovery token mint/consume
//! - `store`: [`AuthStore`] trait, JSON-file and in-memory stores
//!
//! ## Secret Handling
//!
//! Codes and tokens are stored only as salted SHA-256 hashes; comparisons
//! are constant-time. Plaintext codes/tokens exist once, in the return
//! value of the mint call, for out-of-band delivery.

pub mod recovery;
pub mod session;
pub mod store;

pub use recovery::RecoveryToken;
pub use session::{
    AuthError, AuthMethod, AuthService, AuthSession, SessionStatus, StartEmailAuth,
    StartOAuthAuth, VerifyEmailAuth, VerifyOAuthAuth,
};
pub use store::{AuthStore, JsonAuthStore, MemoryAuthStore};
