//! Contribution records and input validation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("invalid contribution input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("gateway failure: {0}")]
    Gateway(String),
    #[error("pool store failure: {0}")]
    Store(String),
}

/// Where a contribution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionSource {
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "one-off")]
    OneOff,
}

/// One immutable row of the contribution ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: String,
    pub user_id: String,
    pub amount_usd_cents: u64,
    pub contributed_at: DateTime<Utc>,
    pub source: ContributionSource,
    /// Globally unique key from the source system when present
    /// (`stripe_invoice:…`, `stripe_checkout:…`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// `YYYY-MM` bucket derived from `contributed_at`.
    pub month: String,
}

/// Caller-supplied fields for a new contribution.
#[derive(Debug, Clone, Default)]
pub struct ContributionInput {
    pub user_id: Option<String>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub amount_usd_cents: u64,
    /// ISO-8601; rejected if unparseable.
    pub contributed_at: String,
    pub source: Option<ContributionSource>,
    pub external_event_id: Option<String>,
    pub tier_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ContributionInput {
    /// First non-empty of explicit id, `customer:{id}`, `email:{lower}`.
    pub fn derive_user_id(&self) -> Result<String, PoolError> {
        if let Some(user_id) = trimmed(&self.user_id) {
            return Ok(user_id.to_string());
        }
        if let Some(customer_id) = trimmed(&self.customer_id) {
            return Ok(format!("customer:{}", customer_id));
        }
        if let Some(email) = trimmed(&self.email) {
            return Ok(format!("email:{}", email.to_lowercase()));
        }
        Err(PoolError::InvalidInput(
            "one of user_id, customer_id or email is required".to_string(),
        ))
    }

    /// Validate and convert into the stored shape (id assigned by the
    /// store).
    pub fn into_record(self, id: String) -> Result<Contribution, PoolError> {
        if self.amount_usd_cents == 0 {
            return Err(PoolError::InvalidInput(
                "amount_usd_cents must be positive".to_string(),
            ));
        }
        let user_id = self.derive_user_id()?;
        let contributed_at = DateTime::parse_from_rfc3339(self.contributed_at.trim())
            .map_err(|e| {
                PoolError::InvalidInput(format!(
                    "contributed_at is not ISO-8601 ({}): {:?}",
                    e, self.contributed_at
                ))
            })?
            .with_timezone(&Utc);
        let month = contributed_at.format("%Y-%m").to_string();
        Ok(Contribution {
            id,
            user_id,
            amount_usd_cents: self.amount_usd_cents,
            contributed_at,
            source: self.source.unwrap_or(ContributionSource::OneOff),
            external_event_id: trimmed(&self.external_event_id).map(str::to_string),
            tier_id: trimmed(&self.tier_id).map(str::to_string),
            metadata: self.metadata,
            month,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> ContributionInput {
        ContributionInput {
            email: Some("Ada@Example.ORG".to_string()),
            amount_usd_cents: 500,
            contributed_at: "2026-03-15T10:00:00Z".to_string(),
            source: Some(ContributionSource::Subscription),
            ..Default::default()
        }
    }

    #[test]
    fn user_id_precedence() {
        let mut input = base_input();
        input.customer_id = Some("cus_1".to_string());
        assert_eq!(input.derive_user_id().unwrap(), "customer:cus_1");

        input.user_id = Some("u-7".to_string());
        assert_eq!(input.derive_user_id().unwrap(), "u-7");

        let email_only = base_input();
        assert_eq!(
            email_only.derive_user_id().unwrap(),
            "email:ada@example.org"
        );
    }

    #[test]
    fn missing_identity_is_invalid() {
        let input = ContributionInput {
            amount_usd_cents: 100,
            contributed_at: "2026-03-15T10:00:00Z".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            input.into_record("c1".to_string()),
            Err(PoolError::InvalidInput(_))
        ));
    }

    #[test]
    fn month_is_derived_from_timestamp() {
        let record = base_input().into_record("c1".to_string()).unwrap();
        assert_eq!(record.month, "2026-03");
        assert_eq!(record.user_id, "email:ada@example.org");
    }

    #[test]
    fn offset_timestamps_normalize_to_utc_month() {
        let mut input = base_input();
        // 23:30 on Jan 31 in +05:00 is Jan 31 18:30 UTC
        input.contributed_at = "2026-01-31T23:30:00+05:00".to_string();
        let record = input.into_record("c1".to_string()).unwrap();
        assert_eq!(record.month, "2026-01");
    }

    #[test]
    fn zero_amount_and_bad_timestamp_are_rejected() {
        let mut input = base_input();
        input.amount_usd_cents = 0;
        assert!(input.into_record("c1".to_string()).is_err());

        let mut input = base_input();
        input.contributed_at = "yesterday".to_string();
        assert!(input.into_record("c1".to_string()).is_err());
    }
}
