//! # Signing Wallet
//!
//! Deterministic Ed25519 wallet derived from a BIP-39 mnemonic and a
//! hardened derivation path.
//!
//! ```text
//! 24 words ──BIP39──▶ 64-byte seed ──HMAC-SHA512(seed, path)──▶ signing key
//!                                                │
//!                                                ▼
//!                          address = "verdant1" + hex(sha256(pubkey)[..20])
//! ```
//!
//! The same `(mnemonic, path)` pair always reconstructs the same key and
//! address. The secret key is never logged, displayed in `Debug`, or
//! included in error messages.

use bip39::{Language, Mnemonic};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

type HmacSha512 = Hmac<Sha512>;

/// Human-readable address prefix.
const ADDRESS_PREFIX: &str = "verdant1";

/// Errors from wallet construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Phrase failed BIP-39 parsing (word list, checksum, length).
    InvalidMnemonic(String),
    /// Derivation path is not of the form `m/44'/118'/0'/0/0`.
    InvalidPath(String),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::InvalidMnemonic(msg) => write!(f, "invalid mnemonic: {}", msg),
            WalletError::InvalidPath(path) => write!(f, "invalid derivation path: {:?}", path),
        }
    }
}

impl std::error::Error for WalletError {}

/// A single signing handle. Clone-free on purpose: the ledger requires
/// sequential use of one account sequence, so the client wraps this in a
/// lock rather than copying keys around.
pub struct Wallet {
    signing_key: SigningKey,
    address: String,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl Wallet {
    /// Derive a wallet from a mnemonic phrase and derivation path.
    pub fn from_mnemonic(phrase: &str, path: &str) -> Result<Self, WalletError> {
        validate_path(path)?;

        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase.trim())
            .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
        let seed = mnemonic.to_seed("");

        // HMAC(seed, path) pins the key to the path without implementing
        // the full per-segment SLIP-10 tree; hardened-only paths derive a
        // single deterministic leaf.
        let mut mac = HmacSha512::new_from_slice(&seed)
            .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
        mac.update(path.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&digest[..32]);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let address = derive_address(&signing_key.verifying_key());

        Ok(Wallet {
            signing_key,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign arbitrary bytes; Ed25519, 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

fn derive_address(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    format!("{}{}", ADDRESS_PREFIX, hex::encode(&digest[..20]))
}

/// Accepts `m` followed by `/n` or `/n'` segments, digits only.
fn validate_path(path: &str) -> Result<(), WalletError> {
    let mut segments = path.split('/');
    if segments.next() != Some("m") {
        return Err(WalletError::InvalidPath(path.to_string()));
    }
    let mut seen = 0usize;
    for segment in segments {
        let digits = segment.strip_suffix('\'').unwrap_or(segment);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(WalletError::InvalidPath(path.to_string()));
        }
        seen += 1;
    }
    if seen == 0 {
        return Err(WalletError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fixed valid 12-word test vector (bip39 English).
    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const PATH: &str = "m/44'/118'/0'/0/0";

    #[test]
    fn derivation_is_deterministic() {
        let a = Wallet::from_mnemonic(PHRASE, PATH).unwrap();
        let b = Wallet::from_mnemonic(PHRASE, PATH).unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"hello"), b.sign(b"hello"));
    }

    #[test]
    fn different_paths_derive_different_keys() {
        let a = Wallet::from_mnemonic(PHRASE, "m/44'/118'/0'/0/0").unwrap();
        let b = Wallet::from_mnemonic(PHRASE, "m/44'/118'/0'/0/1").unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn address_has_prefix_and_hex_body() {
        let wallet = Wallet::from_mnemonic(PHRASE, PATH).unwrap();
        let addr = wallet.address();
        assert!(addr.starts_with(ADDRESS_PREFIX));
        let body = &addr[ADDRESS_PREFIX.len()..];
        assert_eq!(body.len(), 40);
        assert!(body.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_bad_mnemonics() {
        assert!(Wallet::from_mnemonic("one two three", PATH).is_err());
        assert!(Wallet::from_mnemonic("", PATH).is_err());
    }

    #[test]
    fn rejects_bad_paths() {
        for bad in ["", "44'/118'", "m", "m/", "m/x", "m/44''"] {
            assert!(
                Wallet::from_mnemonic(PHRASE, bad).is_err(),
                "accepted path {:?}",
                bad
            );
        }
    }

    #[test]
    fn debug_redacts_secret() {
        let wallet = Wallet::from_mnemonic(PHRASE, PATH).unwrap();
        let debug = format!("{:?}", wallet);
        assert!(debug.contains("<redacted>"));
    }
}
