//! # Dashboard Projection
//!
//! Read-only views over the pool and execution stores, consumed by the
//! template collaborators that render dashboards and certificates. Data
//! flows one way: projections read stores, never the reverse.
//!
//! Any user-supplied text that can reach a template (names, reasons)
//! goes through [`html_escape`] here so a reason like
//! `<script>…</script>` renders as text, never as markup.

use std::sync::Arc;

use serde::Serialize;

use verdant_common::attribution::parse_attributed_reason;
use verdant_ledger::RetirementRecord;
use verdant_pool::{MonthSummary, PoolStore, UserSummary};
use verdant_retire::{BatchExecution, ExecutionStore};

use crate::envelope::ApiError;

/// Minimal entity escaping for text interpolated into HTML templates.
pub fn html_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// One month of pool + batch activity.
#[derive(Debug, Clone, Serialize)]
pub struct MonthDashboard {
    pub summary: MonthSummary,
    pub executions: Vec<BatchExecution>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDashboard {
    pub summary: UserSummary,
}

/// Certificate fields, pre-escaped for direct template interpolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateView {
    pub certificate_id: String,
    pub tx_hash: String,
    pub quantity: String,
    pub batch_denom: String,
    pub jurisdiction: String,
    /// Reason with any identity tag stripped, HTML-escaped.
    pub reason_html: String,
    /// Beneficiary display name recovered from the identity tag,
    /// HTML-escaped; empty when the retirement carries no identity.
    pub beneficiary_html: String,
    pub timestamp: String,
}

pub struct DashboardProjection {
    pool: Arc<dyn PoolStore>,
    executions: Arc<dyn ExecutionStore>,
}

impl DashboardProjection {
    pub fn new(pool: Arc<dyn PoolStore>, executions: Arc<dyn ExecutionStore>) -> Self {
        Self { pool, executions }
    }

    pub fn month_view(&self, month: &str) -> Result<MonthDashboard, ApiError> {
        let contributions = self.pool.contributions()?;
        Ok(MonthDashboard {
            summary: verdant_pool::summary::monthly_summary(&contributions, month),
            executions: self.executions.list_executions(Some(month))?,
        })
    }

    pub fn user_view(&self, user_id: &str) -> Result<UserDashboard, ApiError> {
        let contributions = self.pool.contributions()?;
        Ok(UserDashboard {
            summary: verdant_pool::summary::user_summary(&contributions, user_id),
        })
    }

    /// Project an indexed retirement into certificate fields. The
    /// identity tag is parsed out of the on-chain reason; forged or
    /// absent tags simply leave the beneficiary empty.
    pub fn certificate_view(record: &RetirementRecord) -> CertificateView {
        let parsed = parse_attributed_reason(&record.reason);
        let beneficiary = parsed
            .identity
            .as_ref()
            .map(|identity| match identity {
                verdant_common::IdentityAttribution::None => String::new(),
                verdant_common::IdentityAttribution::Manual { name } => name.clone(),
                verdant_common::IdentityAttribution::Email { name, email } => {
                    name.clone().unwrap_or_else(|| email.clone())
                }
                verdant_common::IdentityAttribution::Oauth {
                    name,
                    email,
                    subject,
                    ..
                } => name
                    .clone()
                    .or_else(|| email.clone())
                    .unwrap_or_else(|| subject.clone()),
            })
            .unwrap_or_default();

        CertificateView {
            certificate_id: record.node_id.clone(),
            tx_hash: record.tx_hash.clone(),
            quantity: record.amount.clone(),
            batch_denom: record.batch_denom.clone(),
            jurisdiction: record.jurisdiction.clone(),
            reason_html: html_escape(&parsed.reason_text),
            beneficiary_html: html_escape(&beneficiary),
            timestamp: record.timestamp.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdant_common::attribution::append_identity_to_reason;
    use verdant_common::IdentityAttribution;
    use verdant_pool::{ContributionInput, ContributionSource, MemoryPoolStore};
    use verdant_retire::MemoryExecutionStore;

    fn record(reason: &str) -> RetirementRecord {
        RetirementRecord {
            node_id: "ret-1".to_string(),
            amount: "2.500000".to_string(),
            batch_denom: "C01-001".to_string(),
            owner: "verdant1aa".to_string(),
            jurisdiction: "US-OR".to_string(),
            reason: reason.to_string(),
            timestamp: "2026-03-01T00:00:00Z".to_string(),
            tx_hash: "CAFE".to_string(),
            block_height: 1,
        }
    }

    #[test]
    fn script_tags_in_reasons_render_as_text() {
        let view = DashboardProjection::certificate_view(&record(
            "<script>alert('x')</script>",
        ));
        assert_eq!(
            view.reason_html,
            "&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"
        );
        assert!(!view.reason_html.contains('<'));
    }

    #[test]
    fn hostile_beneficiary_names_are_escaped() {
        let reason = append_identity_to_reason(
            "offset",
            &IdentityAttribution::Manual {
                name: "<img src=x onerror=alert(1)>".to_string(),
            },
        );
        let view = DashboardProjection::certificate_view(&record(&reason));
        assert_eq!(view.reason_html, "offset");
        assert!(view.beneficiary_html.starts_with("&lt;img"));
        assert!(!view.beneficiary_html.contains('<'));
    }

    #[test]
    fn identity_free_retirements_have_empty_beneficiary() {
        let view = DashboardProjection::certificate_view(&record("plain reason"));
        assert_eq!(view.beneficiary_html, "");
        assert_eq!(view.reason_html, "plain reason");
    }

    #[test]
    fn month_view_combines_pool_and_executions() {
        let pool = Arc::new(MemoryPoolStore::new());
        pool.record_contribution(ContributionInput {
            user_id: Some("alice".to_string()),
            amount_usd_cents: 300,
            contributed_at: "2026-03-15T00:00:00Z".to_string(),
            source: Some(ContributionSource::OneOff),
            ..Default::default()
        })
        .unwrap();
        let executions = Arc::new(MemoryExecutionStore::new());
        executions
            .begin_execution("2026-03", None, true, 300)
            .unwrap();

        let projection = DashboardProjection::new(pool, executions);
        let view = projection.month_view("2026-03").unwrap();
        assert_eq!(view.summary.total_usd_cents, 300);
        assert_eq!(view.executions.len(), 1);
    }
}
