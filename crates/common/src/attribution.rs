//! # Beneficiary Identity Attribution
//!
//! Binds a verified beneficiary identity to an on-chain retirement reason
//! without trusting the chain to store identity structurally.
//!
//! ## Encoding
//!
//! ```text
//! append:  "{base reason} [identity:{base64url(json {v:1, method, ...})}]"
//! parse:   strip trailing "[identity:…]" tag → decode → validate → renormalize
//! ```
//!
//! A later indexer read can therefore reconstruct who funded a retirement
//! from nothing but the reason string.
//!
//! ## Contract
//!
//! - `parse(append(r, i)) == (r, i)` for every valid `(r, i)`.
//! - Malformed or forged tags never error: the raw reason is returned with
//!   no identity attached.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Tag format version accepted by the parser.
const TAG_VERSION: u8 = 1;

const TAG_PREFIX: &str = "[identity:";

/// Verified beneficiary identity, ordered by trust.
///
/// Precedence when capturing from mixed input: oauth > email > manual >
/// none. The variant dictates which fields are guaranteed present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityAttribution {
    /// No identity attached; the reason string is left untouched.
    None,
    /// Caller-asserted display name, nothing verified.
    Manual { name: String },
    /// Email-verified beneficiary.
    Email { name: Option<String>, email: String },
    /// OAuth-verified beneficiary (provider + stable subject id).
    Oauth {
        name: Option<String>,
        email: Option<String>,
        provider: String,
        subject: String,
    },
}

impl IdentityAttribution {
    pub fn method(&self) -> &'static str {
        match self {
            IdentityAttribution::None => "none",
            IdentityAttribution::Manual { .. } => "manual",
            IdentityAttribution::Email { .. } => "email",
            IdentityAttribution::Oauth { .. } => "oauth",
        }
    }
}

/// Raw identity fields as supplied by a caller, prior to normalization.
#[derive(Debug, Clone, Default)]
pub struct IdentityInput {
    pub name: Option<String>,
    pub email: Option<String>,
    pub provider: Option<String>,
    pub subject: Option<String>,
}

/// Errors from identity capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionError {
    /// Email does not have the shape `local@domain.tld`.
    InvalidEmail(String),
    /// `provider` and `subject` must be given together.
    IncompleteOauth,
}

impl std::fmt::Display for AttributionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributionError::InvalidEmail(e) => write!(f, "invalid email address: {:?}", e),
            AttributionError::IncompleteOauth => {
                write!(f, "oauth identity requires both provider and subject")
            }
        }
    }
}

impl std::error::Error for AttributionError {}

/// Shape check equivalent to `[^\s@]+@[^\s@]+\.[^\s@]+`: one `@`, no
/// whitespace, and a dot inside the domain with characters on both sides.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let domain = match parts.next() {
        Some(d) => d,
        None => return false,
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((head, tail)) => !head.is_empty() && !tail.is_empty(),
        None => false,
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Normalize raw identity fields into an [`IdentityAttribution`].
///
/// Strings are trimmed, emails lowercased and shape-checked, and
/// `provider`/`subject` must come as a pair. Empty input is `None`, not an
/// error.
pub fn capture_identity(input: &IdentityInput) -> Result<IdentityAttribution, AttributionError> {
    let name = non_empty(input.name.as_ref());
    let provider = non_empty(input.provider.as_ref());
    let subject = non_empty(input.subject.as_ref());

    let email = match non_empty(input.email.as_ref()) {
        Some(raw) => {
            let lowered = raw.to_lowercase();
            if !is_valid_email(&lowered) {
                return Err(AttributionError::InvalidEmail(raw));
            }
            Some(lowered)
        }
        None => None,
    };

    match (provider, subject) {
        (Some(provider), Some(subject)) => Ok(IdentityAttribution::Oauth {
            name,
            email,
            provider,
            subject,
        }),
        (None, None) => match email {
            Some(email) => Ok(IdentityAttribution::Email { name, email }),
            None => match name {
                Some(name) => Ok(IdentityAttribution::Manual { name }),
                None => Ok(IdentityAttribution::None),
            },
        },
        _ => Err(AttributionError::IncompleteOauth),
    }
}

/// Wire shape of the base64url JSON payload inside a reason tag.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityTag {
    v: u8,
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
}

impl IdentityTag {
    fn from_identity(identity: &IdentityAttribution) -> Option<Self> {
        let mut tag = IdentityTag {
            v: TAG_VERSION,
            method: identity.method().to_string(),
            name: None,
            email: None,
            provider: None,
            subject: None,
        };
        match identity {
            IdentityAttribution::None => return None,
            IdentityAttribution::Manual { name } => tag.name = Some(name.clone()),
            IdentityAttribution::Email { name, email } => {
                tag.name = name.clone();
                tag.email = Some(email.clone());
            }
            IdentityAttribution::Oauth {
                name,
                email,
                provider,
                subject,
            } => {
                tag.name = name.clone();
                tag.email = email.clone();
                tag.provider = Some(provider.clone());
                tag.subject = Some(subject.clone());
            }
        }
        Some(tag)
    }
}

/// Append an identity tag to a retirement reason. `None` identities leave
/// the reason unchanged.
pub fn append_identity_to_reason(reason: &str, identity: &IdentityAttribution) -> String {
    let tag = match IdentityTag::from_identity(identity) {
        Some(tag) => tag,
        None => return reason.to_string(),
    };
    // IdentityTag has no map keys or non-string values that can fail to
    // serialize; treat the impossible as an untagged reason.
    let json = match serde_json::to_vec(&tag) {
        Ok(json) => json,
        Err(_) => return reason.to_string(),
    };
    format!("{} {}{}]", reason, TAG_PREFIX, URL_SAFE_NO_PAD.encode(json))
}

/// Result of [`parse_attributed_reason`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReason {
    /// Reason with any valid identity tag removed; the raw input when no
    /// valid tag was found.
    pub reason_text: String,
    pub identity: Option<IdentityAttribution>,
}

/// Recover the identity from a tagged reason string.
///
/// Strips the suffix `\s*[identity:TOKEN]\s*` where TOKEN is base64url,
/// decodes and validates the payload, and renormalizes the fields through
/// [`capture_identity`]. Any failure along the way yields the raw reason
/// with no identity, never an error.
pub fn parse_attributed_reason(raw_reason: &str) -> ParsedReason {
    let untagged = || ParsedReason {
        reason_text: raw_reason.to_string(),
        identity: None,
    };

    let trimmed = raw_reason.trim_end();
    let body = match trimmed.strip_suffix(']') {
        Some(body) => body,
        None => return untagged(),
    };
    let tag_start = match body.rfind(TAG_PREFIX) {
        Some(idx) => idx,
        None => return untagged(),
    };
    let token = &body[tag_start + TAG_PREFIX.len()..];
    if token.is_empty()
        || !token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return untagged();
    }

    let decoded = match URL_SAFE_NO_PAD.decode(token) {
        Ok(bytes) => bytes,
        Err(_) => return untagged(),
    };
    let tag: IdentityTag = match serde_json::from_slice(&decoded) {
        Ok(tag) => tag,
        Err(_) => return untagged(),
    };
    if tag.v != TAG_VERSION {
        return untagged();
    }

    // The method names which fields the tag must carry; everything is
    // then re-run through capture so forged field combinations cannot
    // bypass normalization.
    let complete = match tag.method.as_str() {
        "manual" => tag.name.is_some() && tag.provider.is_none() && tag.subject.is_none(),
        "email" => tag.email.is_some() && tag.provider.is_none() && tag.subject.is_none(),
        "oauth" => tag.provider.is_some() && tag.subject.is_some(),
        _ => false,
    };
    if !complete {
        return untagged();
    }

    let identity = match capture_identity(&IdentityInput {
        name: tag.name,
        email: tag.email,
        provider: tag.provider,
        subject: tag.subject,
    }) {
        Ok(identity) => identity,
        Err(_) => return untagged(),
    };
    // A tag whose fields normalize to nothing (e.g. whitespace-only name)
    // is treated as forged.
    if identity.method() != tag.method {
        return untagged();
    }

    ParsedReason {
        reason_text: body[..tag_start].trim_end().to_string(),
        identity: Some(identity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_identity() -> IdentityAttribution {
        IdentityAttribution::Oauth {
            name: Some("Ada Lovelace".to_string()),
            email: Some("ada@example.org".to_string()),
            provider: "google".to_string(),
            subject: "sub-1234".to_string(),
        }
    }

    // ── Capture / normalization ─────────────────────────────────────────

    #[test]
    fn capture_trims_and_lowercases() {
        let input = IdentityInput {
            name: Some("  Ada  ".to_string()),
            email: Some(" Ada@Example.ORG ".to_string()),
            ..Default::default()
        };
        match capture_identity(&input).unwrap() {
            IdentityAttribution::Email { name, email } => {
                assert_eq!(name.as_deref(), Some("Ada"));
                assert_eq!(email, "ada@example.org");
            }
            other => panic!("expected Email, got {:?}", other),
        }
    }

    #[test]
    fn capture_precedence_oauth_over_email() {
        let input = IdentityInput {
            name: None,
            email: Some("ada@example.org".to_string()),
            provider: Some("github".to_string()),
            subject: Some("42".to_string()),
        };
        assert_eq!(capture_identity(&input).unwrap().method(), "oauth");
    }

    #[test]
    fn capture_empty_input_is_none() {
        let input = IdentityInput {
            name: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(capture_identity(&input).unwrap(), IdentityAttribution::None);
    }

    #[test]
    fn capture_rejects_bad_emails() {
        for bad in ["nope", "a@b", "a b@c.d", "@x.y", "a@", "a@@b.c"] {
            let input = IdentityInput {
                email: Some(bad.to_string()),
                ..Default::default()
            };
            assert!(capture_identity(&input).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn capture_rejects_provider_without_subject() {
        let input = IdentityInput {
            provider: Some("google".to_string()),
            ..Default::default()
        };
        assert_eq!(
            capture_identity(&input),
            Err(AttributionError::IncompleteOauth)
        );
    }

    // ── Encode / parse round trip ───────────────────────────────────────

    #[test]
    fn round_trip_all_methods() {
        let identities = [
            IdentityAttribution::Manual {
                name: "Grace Hopper".to_string(),
            },
            IdentityAttribution::Email {
                name: None,
                email: "grace@example.org".to_string(),
            },
            oauth_identity(),
        ];
        for identity in identities {
            let tagged = append_identity_to_reason("Monthly climate action", &identity);
            let parsed = parse_attributed_reason(&tagged);
            assert_eq!(parsed.reason_text, "Monthly climate action");
            assert_eq!(parsed.identity, Some(identity));
        }
    }

    #[test]
    fn none_identity_leaves_reason_untouched() {
        let reason = "plain reason";
        assert_eq!(
            append_identity_to_reason(reason, &IdentityAttribution::None),
            reason
        );
    }

    #[test]
    fn parse_untagged_reason() {
        let parsed = parse_attributed_reason("no tag here");
        assert_eq!(parsed.reason_text, "no tag here");
        assert_eq!(parsed.identity, None);
    }

    #[test]
    fn parse_tolerates_trailing_whitespace() {
        let tagged = append_identity_to_reason("r", &oauth_identity());
        let parsed = parse_attributed_reason(&format!("{}  \n", tagged));
        assert_eq!(parsed.reason_text, "r");
        assert!(parsed.identity.is_some());
    }

    #[test]
    fn forged_tags_fall_back_to_raw_reason() {
        let cases = [
            // not base64
            "reason [identity:!!!]".to_string(),
            // base64 of non-JSON
            format!("reason [identity:{}]", URL_SAFE_NO_PAD.encode("not json")),
            // wrong version
            format!(
                "reason [identity:{}]",
                URL_SAFE_NO_PAD.encode(r#"{"v":2,"method":"manual","name":"x"}"#)
            ),
            // unknown method
            format!(
                "reason [identity:{}]",
                URL_SAFE_NO_PAD.encode(r#"{"v":1,"method":"carrier-pigeon"}"#)
            ),
            // method/field mismatch
            format!(
                "reason [identity:{}]",
                URL_SAFE_NO_PAD.encode(r#"{"v":1,"method":"email","name":"x"}"#)
            ),
            // invalid email inside an otherwise well-formed tag
            format!(
                "reason [identity:{}]",
                URL_SAFE_NO_PAD.encode(r#"{"v":1,"method":"email","email":"not-an-email"}"#)
            ),
        ];
        for raw in &cases {
            let parsed = parse_attributed_reason(raw);
            assert_eq!(&parsed.reason_text, raw, "stripped forged tag: {}", raw);
            assert_eq!(parsed.identity, None);
        }
    }

    #[test]
    fn whitespace_only_name_tag_is_forged() {
        let raw = format!(
            "reason [identity:{}]",
            URL_SAFE_NO_PAD.encode(r#"{"v":1,"method":"manual","name":"   "}"#)
        );
        let parsed = parse_attributed_reason(&raw);
        assert_eq!(parsed.identity, None);
    }
}
